use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::json;

use crate::auth::Role;
use crate::ipc::error::{ok, ServiceError};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

const STUDENT_STATUSES: [&str; 4] = ["enrolled", "suspended", "withdrawn", "graduated"];

const STUDENT_COLS: &str = "student_id, name, gender, birth_date, class_name, admission_date,
     contact_phone, email, address, status, created_at, updated_at";

fn valid_student_id(id: &str) -> bool {
    (3..=20).contains(&id.len()) && id.chars().all(|c| c.is_ascii_alphanumeric())
}

fn valid_email(email: &str) -> bool {
    if email.chars().any(|c| c.is_whitespace()) {
        return false;
    }
    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.len() >= 3
}

/// Mainland mobile shape: 1[3-9] followed by nine digits. Swap this out
/// for other deployments.
fn valid_phone(phone: &str) -> bool {
    let bytes = phone.as_bytes();
    bytes.len() == 11
        && bytes[0] == b'1'
        && (b'3'..=b'9').contains(&bytes[1])
        && phone.chars().all(|c| c.is_ascii_digit())
}

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "studentId": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "gender": r.get::<_, Option<String>>(2)?,
        "birthDate": r.get::<_, Option<String>>(3)?,
        "className": r.get::<_, Option<String>>(4)?,
        "admissionDate": r.get::<_, Option<String>>(5)?,
        "contactPhone": r.get::<_, Option<String>>(6)?,
        "email": r.get::<_, Option<String>>(7)?,
        "address": r.get::<_, Option<String>>(8)?,
        "status": r.get::<_, String>(9)?,
        "createdAt": r.get::<_, Option<String>>(10)?,
        "updatedAt": r.get::<_, Option<String>>(11)?,
    }))
}

struct StudentInput {
    student_id: String,
    name: String,
    gender: Option<String>,
    birth_date: Option<String>,
    class_name: Option<String>,
    admission_date: Option<String>,
    contact_phone: Option<String>,
    email: Option<String>,
    address: Option<String>,
    status: String,
}

fn parse_student(params: &serde_json::Value) -> Result<StudentInput, ServiceError> {
    let student_id = helpers::req_str(params, "studentId")?;
    if !valid_student_id(&student_id) {
        return Err(ServiceError::Validation(
            "studentId must be 3-20 alphanumeric characters".to_string(),
        ));
    }
    let name = helpers::req_str(params, "name")?;
    let email = helpers::opt_str(params, "email");
    if let Some(email) = &email {
        if !valid_email(email) {
            return Err(ServiceError::Validation(format!(
                "invalid email address: {}",
                email
            )));
        }
    }
    let contact_phone = helpers::opt_str(params, "contactPhone");
    if let Some(phone) = &contact_phone {
        if !valid_phone(phone) {
            return Err(ServiceError::Validation(format!(
                "invalid phone number: {}",
                phone
            )));
        }
    }
    let status = helpers::opt_str(params, "status").unwrap_or_else(|| "enrolled".to_string());
    if !STUDENT_STATUSES.contains(&status.as_str()) {
        return Err(ServiceError::Validation(format!(
            "status must be one of: {}",
            STUDENT_STATUSES.join(", ")
        )));
    }

    Ok(StudentInput {
        student_id,
        name,
        gender: helpers::opt_str(params, "gender"),
        birth_date: helpers::opt_str(params, "birthDate"),
        class_name: helpers::opt_str(params, "className"),
        admission_date: helpers::opt_str(params, "admissionDate"),
        contact_phone,
        email,
        address: helpers::opt_str(params, "address"),
        status,
    })
}

fn insert_student(conn: &Connection, input: &StudentInput) -> Result<(), ServiceError> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE student_id = ?",
            [&input.student_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(ServiceError::Conflict {
            message: format!("student {} already exists", input.student_id),
            details: None,
        });
    }

    let now = helpers::now_stamp();
    conn.execute(
        "INSERT INTO students(student_id, name, gender, birth_date, class_name, admission_date,
                              contact_phone, email, address, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &input.student_id,
            &input.name,
            &input.gender,
            &input.birth_date,
            &input.class_name,
            &input.admission_date,
            &input.contact_phone,
            &input.email,
            &input.address,
            &input.status,
            &now,
            &now,
        ),
    )?;
    Ok(())
}

fn handle_add(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let input = parse_student(&req.params)?;

    let tx = conn.unchecked_transaction()?;
    insert_student(&tx, &input)?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "add_student",
        Some(&format!("student {}", input.student_id)),
        Some(&format!(
            "added student {} ({})",
            input.name, input.student_id
        )),
        None,
    )?;
    tx.commit()?;
    log::info!("added student {} ({})", input.student_id, input.name);

    Ok(json!({ "studentId": input.student_id }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let student_id = helpers::req_str(&req.params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(ServiceError::NotFound(format!(
            "student {} not found",
            student_id
        )));
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(field) = helpers::patch_str(&req.params, "name")? {
        match field {
            Some(v) if !v.is_empty() => {
                sets.push("name = ?");
                values.push(SqlValue::Text(v));
            }
            _ => {
                return Err(ServiceError::Validation(
                    "name cannot be cleared".to_string(),
                ))
            }
        }
    }
    if let Some(field) = helpers::patch_str(&req.params, "status")? {
        match field.as_deref() {
            Some(v) if STUDENT_STATUSES.contains(&v) => {
                sets.push("status = ?");
                values.push(SqlValue::Text(v.to_string()));
            }
            _ => {
                return Err(ServiceError::Validation(format!(
                    "status must be one of: {}",
                    STUDENT_STATUSES.join(", ")
                )))
            }
        }
    }
    if let Some(field) = helpers::patch_str(&req.params, "email")? {
        if let Some(v) = &field {
            if !valid_email(v) {
                return Err(ServiceError::Validation(format!(
                    "invalid email address: {}",
                    v
                )));
            }
        }
        sets.push("email = ?");
        values.push(field.map(SqlValue::Text).unwrap_or(SqlValue::Null));
    }
    if let Some(field) = helpers::patch_str(&req.params, "contactPhone")? {
        if let Some(v) = &field {
            if !valid_phone(v) {
                return Err(ServiceError::Validation(format!(
                    "invalid phone number: {}",
                    v
                )));
            }
        }
        sets.push("contact_phone = ?");
        values.push(field.map(SqlValue::Text).unwrap_or(SqlValue::Null));
    }
    for (key, column) in [
        ("gender", "gender = ?"),
        ("birthDate", "birth_date = ?"),
        ("className", "class_name = ?"),
        ("admissionDate", "admission_date = ?"),
        ("address", "address = ?"),
    ] {
        if let Some(field) = helpers::patch_str(&req.params, key)? {
            sets.push(column);
            values.push(field.map(SqlValue::Text).unwrap_or(SqlValue::Null));
        }
    }

    if sets.is_empty() {
        return Err(ServiceError::Validation("no fields to update".to_string()));
    }
    sets.push("updated_at = ?");
    values.push(SqlValue::Text(helpers::now_stamp()));
    values.push(SqlValue::Text(student_id.clone()));

    let sql = format!(
        "UPDATE students SET {} WHERE student_id = ?",
        sets.join(", ")
    );
    let tx = conn.unchecked_transaction()?;
    tx.execute(&sql, params_from_iter(values))?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "update_student",
        Some(&format!("student {}", student_id)),
        Some(&format!("updated student {}", student_id)),
        None,
    )?;
    tx.commit()?;
    log::info!("updated student {}", student_id);

    Ok(json!({ "studentId": student_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let student_id = helpers::req_str(&req.params, "studentId")?;

    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM students WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(name) = name else {
        return Err(ServiceError::NotFound(format!(
            "student {} not found",
            student_id
        )));
    };

    // Grades go first; no ON DELETE CASCADE in the schema.
    let tx = conn.unchecked_transaction()?;
    let deleted_grades = tx.execute("DELETE FROM grades WHERE student_id = ?", [&student_id])?;
    tx.execute("DELETE FROM students WHERE student_id = ?", [&student_id])?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "delete_student",
        Some(&format!("student {} ({})", name, student_id)),
        Some(&format!(
            "deleted student {} and {} grade records",
            student_id, deleted_grades
        )),
        None,
    )?;
    tx.commit()?;
    log::info!(
        "deleted student {} and {} grade records",
        student_id,
        deleted_grades
    );

    Ok(json!({ "studentId": student_id, "deletedGrades": deleted_grades }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let student_id = helpers::req_str(&req.params, "studentId")?;

    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM students WHERE student_id = ?",
                STUDENT_COLS
            ),
            [&student_id],
            student_json,
        )
        .optional()?;
    row.ok_or_else(|| ServiceError::NotFound(format!("student {} not found", student_id)))
}

fn list_filters(params: &serde_json::Value) -> (Vec<&'static str>, Vec<SqlValue>) {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(v) = helpers::opt_str(params, "className") {
        clauses.push("class_name = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(params, "status") {
        clauses.push("status = ?");
        values.push(SqlValue::Text(v));
    }
    (clauses, values)
}

fn where_sql(clauses: &[&str]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let (page, page_size) = helpers::page_params(&req.params);
    let (clauses, values) = list_filters(&req.params);
    let where_part = where_sql(&clauses);

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM students{}", where_part),
        params_from_iter(values.clone()),
        |r| r.get(0),
    )?;

    let mut values = values;
    values.push(SqlValue::Integer(page_size));
    values.push(SqlValue::Integer((page - 1) * page_size));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM students{} ORDER BY name, student_id LIMIT ? OFFSET ?",
        STUDENT_COLS, where_part
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), student_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(helpers::page_envelope(items, page, page_size, total))
}

fn handle_search(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let keyword = helpers::req_str(&req.params, "keyword")?;
    let (page, page_size) = helpers::page_params(&req.params);
    let pattern = format!("%{}%", keyword);

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students
         WHERE student_id LIKE ?1 OR name LIKE ?1 OR class_name LIKE ?1 OR contact_phone LIKE ?1",
        [&pattern],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM students
         WHERE student_id LIKE ?1 OR name LIKE ?1 OR class_name LIKE ?1 OR contact_phone LIKE ?1
         ORDER BY name, student_id LIMIT ?2 OFFSET ?3",
        STUDENT_COLS
    ))?;
    let items = stmt
        .query_map(
            (&pattern, page_size, (page - 1) * page_size),
            student_json,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(helpers::page_envelope(items, page, page_size, total))
}

fn handle_count(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let (clauses, values) = list_filters(&req.params);
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM students{}", where_sql(&clauses)),
        params_from_iter(values),
        |r| r.get(0),
    )?;
    Ok(json!({ "count": total }))
}

fn handle_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let Some(records) = req.params.get("records").and_then(|v| v.as_array()) else {
        return Err(ServiceError::Validation(
            "records must be an array".to_string(),
        ));
    };

    // Each record stands alone: one bad row never aborts the batch.
    let mut imported: i64 = 0;
    let mut failures: Vec<serde_json::Value> = Vec::new();
    for record in records {
        let result = parse_student(record).and_then(|input| insert_student(conn, &input));
        match result {
            Ok(()) => imported += 1,
            Err(e) => failures.push(json!({ "record": record, "reason": e.to_string() })),
        }
    }

    helpers::log_operation(
        conn,
        &principal.username,
        "import_students",
        None,
        Some(&format!(
            "imported {} students, {} failures",
            imported,
            failures.len()
        )),
        None,
    )?;
    log::info!(
        "imported {} students, {} failures",
        imported,
        failures.len()
    );

    Ok(json!({
        "importedCount": imported,
        "failedCount": failures.len(),
        "failures": failures,
    }))
}

fn handle_classes(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT class_name FROM students
         WHERE class_name IS NOT NULL AND class_name != ''
         ORDER BY class_name",
    )?;
    let classes = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "students.add" => handle_add(state, req),
        "students.update" => handle_update(state, req),
        "students.delete" => handle_delete(state, req),
        "students.get" => handle_get(state, req),
        "students.list" => handle_list(state, req),
        "students.search" => handle_search(state, req),
        "students.count" => handle_count(state, req),
        "students.import" => handle_import(state, req),
        "students.classes" => handle_classes(state, req),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
