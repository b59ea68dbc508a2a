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
    let ws = temp_workspace("registrard-students");
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
fn add_get_round_trip() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({
            "studentId": "S001",
            "name": "Alice",
            "gender": "female",
            "className": "CS-1",
            "email": "alice@example.edu",
            "contactPhone": "13912345678",
        }),
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.get",
        json!({ "studentId": "S001" }),
    );
    assert_eq!(student.get("name").and_then(|v| v.as_str()), Some("Alice"));
    assert_eq!(
        student.get("className").and_then(|v| v.as_str()),
        Some("CS-1")
    );
    assert_eq!(
        student.get("status").and_then(|v| v.as_str()),
        Some("enrolled")
    );
    assert!(student
        .get("createdAt")
        .and_then(|v| v.as_str())
        .is_some());
}

#[test]
fn duplicate_and_invalid_inputs_are_rejected() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({ "studentId": "S001", "name": "Alice" }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "2",
            "students.add",
            json!({ "studentId": "S001", "name": "Someone Else" })
        ),
        "conflict"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "3",
            "students.add",
            json!({ "studentId": "S?", "name": "Bad Id" })
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "students.add",
            json!({ "studentId": "S002", "name": "Bob", "email": "not-an-email" })
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "5",
            "students.add",
            json!({ "studentId": "S003", "name": "Carol", "contactPhone": "12345" })
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "6",
            "students.add",
            json!({ "studentId": "S004", "name": "Dave", "status": "expelled" })
        ),
        "bad_params"
    );
}

#[test]
fn update_patches_only_supplied_fields() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({
            "studentId": "S001",
            "name": "Alice",
            "email": "alice@example.edu",
            "className": "CS-1",
        }),
    );

    // Absent fields stay untouched.
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.update",
        json!({ "studentId": "S001", "status": "suspended" }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.get",
        json!({ "studentId": "S001" }),
    );
    assert_eq!(
        student.get("email").and_then(|v| v.as_str()),
        Some("alice@example.edu")
    );
    assert_eq!(
        student.get("status").and_then(|v| v.as_str()),
        Some("suspended")
    );

    // Explicit null clears; absent still leaves alone.
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.update",
        json!({ "studentId": "S001", "email": null }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.get",
        json!({ "studentId": "S001" }),
    );
    assert!(student.get("email").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        student.get("className").and_then(|v| v.as_str()),
        Some("CS-1")
    );

    // Name is not clearable and the patch must not be empty.
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "6",
            "students.update",
            json!({ "studentId": "S001", "name": null })
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "7",
            "students.update",
            json!({ "studentId": "S001" })
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "students.update",
            json!({ "studentId": "S999", "status": "enrolled" })
        ),
        "not_found"
    );
}

#[test]
fn delete_cascades_to_grades() {
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
        "courses.add",
        json!({ "courseId": "C1", "courseName": "Algorithms", "credit": 3.0 }),
    );
    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 92 }),
    );
    let grade_id = grade
        .get("id")
        .and_then(|v| v.as_str())
        .expect("grade id")
        .to_string();

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.delete",
        json!({ "studentId": "S001" }),
    );
    assert_eq!(out.get("deletedGrades").and_then(|v| v.as_i64()), Some(1));

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "5",
            "students.get",
            json!({ "studentId": "S001" })
        ),
        "not_found"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "6",
            "grades.get",
            json!({ "id": grade_id })
        ),
        "not_found"
    );
}

#[test]
fn list_filters_paginate_and_count() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    for (i, (id, name, class)) in [
        ("S001", "Alice", "CS-1"),
        ("S002", "Bob", "CS-1"),
        ("S003", "Carol", "CS-2"),
    ]
    .iter()
    .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "students.add",
            json!({ "studentId": id, "name": name, "className": class }),
        );
    }

    let page = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.list",
        json!({ "page": 1, "pageSize": 2 }),
    );
    assert_eq!(page.get("totalItems").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(page.get("totalPages").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        page.get("items").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.list",
        json!({ "className": "CS-1" }),
    );
    assert_eq!(filtered.get("totalItems").and_then(|v| v.as_i64()), Some(2));

    let count = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.count",
        json!({ "className": "CS-2" }),
    );
    assert_eq!(count.get("count").and_then(|v| v.as_i64()), Some(1));

    let found = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.search",
        json!({ "keyword": "Car" }),
    );
    assert_eq!(found.get("totalItems").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        found.pointer("/items/0/studentId").and_then(|v| v.as_str()),
        Some("S003")
    );

    let classes = request_ok(&mut stdin, &mut reader, "5", "students.classes", json!({}));
    assert_eq!(
        classes.get("classes").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );
}

#[test]
fn bulk_import_isolates_bad_records() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({ "studentId": "S001", "name": "Alice" }),
    );

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.import",
        json!({ "records": [
            { "studentId": "S002", "name": "Bob" },
            { "studentId": "S001", "name": "Duplicate" },
            { "studentId": "S003", "name": "Carol" },
            { "studentId": "S004" },
        ]}),
    );
    assert_eq!(out.get("importedCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(out.get("failedCount").and_then(|v| v.as_i64()), Some(2));
    let failures = out.get("failures").and_then(|v| v.as_array()).expect("failures");
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.get("reason").is_some()));
    assert!(failures.iter().all(|f| f.get("record").is_some()));

    let count = request_ok(&mut stdin, &mut reader, "3", "students.count", json!({}));
    assert_eq!(count.get("count").and_then(|v| v.as_i64()), Some(3));
}
