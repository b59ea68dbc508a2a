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
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded",
        method
    );
    value.get("error").cloned().expect("error object")
}

fn error_code(error: &serde_json::Value) -> &str {
    error
        .get("code")
        .and_then(|v| v.as_str())
        .expect("error code")
}

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
    password: &str,
) {
    request_ok(
        stdin,
        reader,
        "login",
        "auth.login",
        json!({ "username": username, "password": password }),
    );
}

fn setup_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let ws = temp_workspace("registrard-grades");
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    login(stdin, reader, "admin", "admin123");
}

fn seed_alice(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    request_ok(
        stdin,
        reader,
        "seed1",
        "students.add",
        json!({ "studentId": "S001", "name": "Alice", "className": "CS-1" }),
    );
    request_ok(
        stdin,
        reader,
        "seed2",
        "courses.add",
        json!({ "courseId": "C1", "courseName": "Algorithms", "credit": 3.0 }),
    );
}

#[test]
fn grade_point_is_derived_and_gpa_follows() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 92 }),
    );
    assert_eq!(grade.get("gradePoint").and_then(|v| v.as_f64()), Some(4.0));

    let gpa = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.studentGpa",
        json!({ "studentId": "S001" }),
    );
    assert_eq!(gpa.get("gpa").and_then(|v| v.as_f64()), Some(4.0));
    assert_eq!(gpa.get("totalCredit").and_then(|v| v.as_f64()), Some(3.0));
    assert_eq!(
        gpa.get("studentName").and_then(|v| v.as_str()),
        Some("Alice")
    );
}

#[test]
fn weighted_gpa_across_two_courses() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "courses.add",
        json!({ "courseId": "C2", "courseName": "Databases", "credit": 2.0 }),
    );

    // 95 -> 4.0 band, 62 -> 2.0 band: GPA = (4.0*3 + 2.0*2) / 5 = 3.2.
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 95 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C2", "semester": "2024-1", "score": 62 }),
    );

    let gpa = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.studentGpa",
        json!({ "studentId": "S001" }),
    );
    assert_eq!(gpa.get("gpa").and_then(|v| v.as_f64()), Some(3.2));
    assert_eq!(gpa.get("totalCredit").and_then(|v| v.as_f64()), Some(5.0));
    // Credit-weighted mean score: (95*3 + 62*2) / 5 = 81.8.
    assert_eq!(
        gpa.get("weightedAverage").and_then(|v| v.as_f64()),
        Some(81.8)
    );
    assert_eq!(
        gpa.get("averageScore").and_then(|v| v.as_f64()),
        Some(78.5)
    );
}

#[test]
fn duplicate_insert_leaves_original_row() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 92 }),
    );
    let grade_id = grade
        .get("id")
        .and_then(|v| v.as_str())
        .expect("grade id")
        .to_string();

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 50 }),
    );
    assert_eq!(error_code(&error), "conflict");

    let row = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.get",
        json!({ "id": grade_id }),
    );
    assert_eq!(row.get("score").and_then(|v| v.as_f64()), Some(92.0));

    // A different semester is a different key, not a conflict.
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-2", "score": 88 }),
    );
}

#[test]
fn score_update_recomputes_grade_point() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);

    let grade = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 92 }),
    );
    let grade_id = grade
        .get("id")
        .and_then(|v| v.as_str())
        .expect("grade id")
        .to_string();

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.update",
        json!({ "id": grade_id, "score": 59 }),
    );
    assert_eq!(updated.get("gradePoint").and_then(|v| v.as_f64()), Some(0.0));

    let row = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.get",
        json!({ "id": grade_id }),
    );
    assert_eq!(row.get("score").and_then(|v| v.as_f64()), Some(59.0));
    assert_eq!(row.get("gradePoint").and_then(|v| v.as_f64()), Some(0.0));

    // And the statistics now count the row in the fail band.
    let statistics = request_ok(&mut stdin, &mut reader, "4", "grades.statistics", json!({}));
    assert_eq!(
        statistics.pointer("/scoreBands/fail").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        statistics.get("passRate").and_then(|v| v.as_f64()),
        Some(0.0)
    );
}

#[test]
fn update_and_delete_by_keys() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 70 }),
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.updateByKeys",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 86 }),
    );
    assert_eq!(updated.get("gradePoint").and_then(|v| v.as_f64()), Some(3.7));

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.deleteByKeys",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1" }),
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "grades.deleteByKeys",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1" }),
    );
    assert_eq!(error_code(&error), "not_found");
}

#[test]
fn input_validation_and_references() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 101 }),
    );
    assert_eq!(error_code(&error), "bad_params");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "grades.add",
        json!({ "studentId": "S999", "courseId": "C1", "semester": "2024-1", "score": 80 }),
    );
    assert_eq!(error_code(&error), "not_found");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "NOPE", "semester": "2024-1", "score": 80 }),
    );
    assert_eq!(error_code(&error), "not_found");
}

#[test]
fn student_principals_see_only_their_own_rows() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({ "studentId": "S002", "name": "Bob", "className": "CS-1" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 92 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.add",
        json!({ "studentId": "S002", "courseId": "C1", "semester": "2024-1", "score": 75 }),
    );
    // Student account whose username doubles as the student key.
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.add",
        json!({ "username": "S001", "password": "pass1234", "role": "student" }),
    );

    login(&mut stdin, &mut reader, "S001", "pass1234");

    let own = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.forStudent",
        json!({ "studentId": "S001" }),
    );
    assert_eq!(own.get("totalItems").and_then(|v| v.as_i64()), Some(1));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "grades.forStudent",
        json!({ "studentId": "S002" }),
    );
    assert_eq!(error_code(&error), "permission_denied");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "grades.studentGpa",
        json!({ "studentId": "S002" }),
    );
    assert_eq!(error_code(&error), "permission_denied");

    // Listing is pinned to the caller's own rows even with a filter.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.list",
        json!({ "studentId": "S002" }),
    );
    assert_eq!(listed.get("totalItems").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        listed.pointer("/items/0/studentId").and_then(|v| v.as_str()),
        Some("S001")
    );

    // Course-wide listings remain teacher territory.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "grades.forCourse",
        json!({ "courseId": "C1" }),
    );
    assert_eq!(error_code(&error), "permission_denied");

    let error = request_err(&mut stdin, &mut reader, "10", "grades.statistics", json!({}));
    assert_eq!(error_code(&error), "permission_denied");
}

#[test]
fn bulk_import_isolates_bad_records() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.add",
        json!({ "studentId": "S002", "name": "Bob" }),
    );

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.import",
        json!({ "records": [
            { "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 92 },
            { "studentId": "S002", "courseId": "C1", "semester": "2024-1", "score": 85 },
            { "studentId": "S999", "courseId": "C1", "semester": "2024-1", "score": 70 },
            { "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 50 },
        ]}),
    );
    assert_eq!(out.get("importedCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(out.get("failedCount").and_then(|v| v.as_i64()), Some(2));

    let listed = request_ok(&mut stdin, &mut reader, "3", "grades.list", json!({}));
    assert_eq!(listed.get("totalItems").and_then(|v| v.as_i64()), Some(2));
}

#[test]
fn conflict_message_names_the_existing_registration() {
    let (_child, mut stdin, mut reader) = spawn_daemon();
    setup_admin(&mut stdin, &mut reader);
    seed_alice(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 92 }),
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "grades.add",
        json!({ "studentId": "S001", "courseId": "C1", "semester": "2024-1", "score": 60 }),
    );
    let message = error
        .get("message")
        .and_then(|v| v.as_str())
        .expect("message");
    assert!(message.contains("S001"), "message was: {}", message);
    assert!(message.contains("C1"), "message was: {}", message);
}
