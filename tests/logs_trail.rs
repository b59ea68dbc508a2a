use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_workspace(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_registrard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn registrard");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded",
        method
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn setup_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let ws = temp_workspace("registrard-logs");
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "login",
        "auth.login",
        json!({ "username": "admin", "password": "admin123" }),
    );
}

#[test]
fn mutations_and_logins_append_entries() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({ "studentId": "S001", "name": "Alice" }),
    );

    let logins = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "logs.list",
        json!({ "operation": "login" }),
    );
    assert_eq!(logins.get("totalItems").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        logins.pointer("/items/0/username").and_then(|v| v.as_str()),
        Some("admin")
    );

    let adds = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "logs.list",
        json!({ "operation": "add_student" }),
    );
    assert_eq!(adds.get("totalItems").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        adds.pointer("/items/0/target").and_then(|v| v.as_str()),
        Some("student S001")
    );
    assert!(adds
        .pointer("/items/0/timestamp")
        .and_then(|v| v.as_str())
        .is_some());
}

#[test]
fn denied_attempts_are_not_logged() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "users.add",
        json!({ "username": "student1", "password": "pass1234", "role": "student" }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "username": "student1", "password": "pass1234" }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "3",
            "students.add",
            json!({ "studentId": "S001", "name": "Alice" })
        ),
        "permission_denied"
    );
    // Students cannot read the trail either.
    assert_eq!(
        request_err(&mut stdin, &mut reader, "4", "logs.list", json!({})),
        "permission_denied"
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "username": "admin", "password": "admin123" }),
    );
    let adds = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "logs.list",
        json!({ "operation": "add_student" }),
    );
    assert_eq!(adds.get("totalItems").and_then(|v| v.as_i64()), Some(0));
}

#[test]
fn search_and_user_activity() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({ "studentId": "S001", "name": "Alice" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.add",
        json!({ "username": "teacher1", "password": "pass1234", "role": "teacher" }),
    );

    let found = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "logs.search",
        json!({ "keyword": "S001" }),
    );
    assert_eq!(found.get("totalItems").and_then(|v| v.as_i64()), Some(1));

    let activity = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "logs.userActivity",
        json!({ "username": "admin" }),
    );
    let items = activity.get("items").and_then(|v| v.as_array()).expect("items");
    assert!(items.len() >= 3);
    assert!(items
        .iter()
        .all(|e| e.get("username").and_then(|v| v.as_str()) == Some("admin")));

    // A non-admin may query their own activity, nobody else's.
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "username": "teacher1", "password": "pass1234" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "logs.userActivity",
        json!({ "username": "teacher1" }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "7",
            "logs.userActivity",
            json!({ "username": "admin" })
        ),
        "permission_denied"
    );
}

#[test]
fn operation_stats_count_by_kind() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    for (i, id) in ["S001", "S002", "S003"].iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "students.add",
            json!({ "studentId": id, "name": "Someone" }),
        );
    }

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "logs.operationStats",
        json!({ "days": 7 }),
    );
    let operations = stats
        .get("operations")
        .and_then(|v| v.as_array())
        .expect("operations");
    // Busiest first: three add_student against one login.
    assert_eq!(
        operations[0].get("operation").and_then(|v| v.as_str()),
        Some("add_student")
    );
    assert_eq!(operations[0].get("count").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(stats.get("totalCount").and_then(|v| v.as_i64()), Some(4));
}

#[test]
fn purge_removes_old_entries_and_logs_itself() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({ "studentId": "S001", "name": "Alice" }),
    );

    // Retention window of zero days: everything written so far goes.
    let purged = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "logs.purge",
        json!({ "days": 0 }),
    );
    assert_eq!(purged.get("purgedCount").and_then(|v| v.as_i64()), Some(2));

    let listed = request_ok(&mut stdin, &mut reader, "3", "logs.list", json!({}));
    assert_eq!(listed.get("totalItems").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        listed.pointer("/items/0/operation").and_then(|v| v.as_str()),
        Some("purge_logs")
    );

    // Defaulted window keeps recent entries.
    let purged = request_ok(&mut stdin, &mut reader, "4", "logs.purge", json!({}));
    assert_eq!(purged.get("purgedCount").and_then(|v| v.as_i64()), Some(0));
}
