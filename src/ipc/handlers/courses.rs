use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::json;

use crate::auth::Role;
use crate::ipc::error::{ok, ServiceError};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

const COURSE_COLS: &str =
    "course_id, course_name, credit, teacher, description, semester, created_at, updated_at";

fn valid_course_id(id: &str) -> bool {
    (2..=20).contains(&id.len()) && id.chars().all(|c| c.is_ascii_alphanumeric())
}

fn course_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "courseId": r.get::<_, String>(0)?,
        "courseName": r.get::<_, String>(1)?,
        "credit": r.get::<_, f64>(2)?,
        "teacher": r.get::<_, Option<String>>(3)?,
        "description": r.get::<_, Option<String>>(4)?,
        "semester": r.get::<_, Option<String>>(5)?,
        "createdAt": r.get::<_, Option<String>>(6)?,
        "updatedAt": r.get::<_, Option<String>>(7)?,
    }))
}

struct CourseInput {
    course_id: String,
    course_name: String,
    credit: f64,
    teacher: Option<String>,
    description: Option<String>,
    semester: Option<String>,
}

fn parse_course(params: &serde_json::Value) -> Result<CourseInput, ServiceError> {
    let course_id = helpers::req_str(params, "courseId")?;
    if !valid_course_id(&course_id) {
        return Err(ServiceError::Validation(
            "courseId must be 2-20 alphanumeric characters".to_string(),
        ));
    }
    let course_name = helpers::req_str(params, "courseName")?;
    let credit = helpers::req_f64(params, "credit")?;
    if credit <= 0.0 {
        return Err(ServiceError::Validation(
            "credit must be greater than 0".to_string(),
        ));
    }
    Ok(CourseInput {
        course_id,
        course_name,
        credit,
        teacher: helpers::opt_str(params, "teacher"),
        description: helpers::opt_str(params, "description"),
        semester: helpers::opt_str(params, "semester"),
    })
}

fn insert_course(conn: &Connection, input: &CourseInput) -> Result<(), ServiceError> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM courses WHERE course_id = ?",
            [&input.course_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(ServiceError::Conflict {
            message: format!("course {} already exists", input.course_id),
            details: None,
        });
    }

    let now = helpers::now_stamp();
    conn.execute(
        "INSERT INTO courses(course_id, course_name, credit, teacher, description, semester,
                             created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &input.course_id,
            &input.course_name,
            input.credit,
            &input.teacher,
            &input.description,
            &input.semester,
            &now,
            &now,
        ),
    )?;
    Ok(())
}

fn handle_add(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let input = parse_course(&req.params)?;

    let tx = conn.unchecked_transaction()?;
    insert_course(&tx, &input)?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "add_course",
        Some(&format!("course {}", input.course_id)),
        Some(&format!(
            "added course {} ({})",
            input.course_name, input.course_id
        )),
        None,
    )?;
    tx.commit()?;
    log::info!("added course {} ({})", input.course_id, input.course_name);

    Ok(json!({ "courseId": input.course_id }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let course_id = helpers::req_str(&req.params, "courseId")?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM courses WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(ServiceError::NotFound(format!(
            "course {} not found",
            course_id
        )));
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(field) = helpers::patch_str(&req.params, "courseName")? {
        match field {
            Some(v) if !v.is_empty() => {
                sets.push("course_name = ?");
                values.push(SqlValue::Text(v));
            }
            _ => {
                return Err(ServiceError::Validation(
                    "courseName cannot be cleared".to_string(),
                ))
            }
        }
    }
    if let Some(credit) = helpers::opt_f64(&req.params, "credit")? {
        if credit <= 0.0 {
            return Err(ServiceError::Validation(
                "credit must be greater than 0".to_string(),
            ));
        }
        sets.push("credit = ?");
        values.push(SqlValue::Real(credit));
    }
    for (key, column) in [
        ("teacher", "teacher = ?"),
        ("description", "description = ?"),
        ("semester", "semester = ?"),
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
    values.push(SqlValue::Text(course_id.clone()));

    let sql = format!("UPDATE courses SET {} WHERE course_id = ?", sets.join(", "));
    let tx = conn.unchecked_transaction()?;
    tx.execute(&sql, params_from_iter(values))?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "update_course",
        Some(&format!("course {}", course_id)),
        Some(&format!("updated course {}", course_id)),
        None,
    )?;
    tx.commit()?;
    log::info!("updated course {}", course_id);

    Ok(json!({ "courseId": course_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let course_id = helpers::req_str(&req.params, "courseId")?;

    let name: Option<String> = conn
        .query_row(
            "SELECT course_name FROM courses WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(name) = name else {
        return Err(ServiceError::NotFound(format!(
            "course {} not found",
            course_id
        )));
    };

    // Dependents first; no ON DELETE CASCADE in the schema.
    let tx = conn.unchecked_transaction()?;
    let deleted_grades = tx.execute("DELETE FROM grades WHERE course_id = ?", [&course_id])?;
    let deleted_schedules =
        tx.execute("DELETE FROM schedules WHERE course_id = ?", [&course_id])?;
    tx.execute("DELETE FROM courses WHERE course_id = ?", [&course_id])?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "delete_course",
        Some(&format!("course {} ({})", name, course_id)),
        Some(&format!(
            "deleted course {} with {} grades and {} schedule entries",
            course_id, deleted_grades, deleted_schedules
        )),
        None,
    )?;
    tx.commit()?;
    log::info!(
        "deleted course {} with {} grades and {} schedule entries",
        course_id,
        deleted_grades,
        deleted_schedules
    );

    Ok(json!({
        "courseId": course_id,
        "deletedGrades": deleted_grades,
        "deletedSchedules": deleted_schedules,
    }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let course_id = helpers::req_str(&req.params, "courseId")?;

    let row = conn
        .query_row(
            &format!("SELECT {} FROM courses WHERE course_id = ?", COURSE_COLS),
            [&course_id],
            course_json,
        )
        .optional()?;
    row.ok_or_else(|| ServiceError::NotFound(format!("course {} not found", course_id)))
}

fn list_filters(params: &serde_json::Value) -> (Vec<&'static str>, Vec<SqlValue>) {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(v) = helpers::opt_str(params, "semester") {
        clauses.push("semester = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(params, "teacher") {
        clauses.push("teacher = ?");
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
        &format!("SELECT COUNT(*) FROM courses{}", where_part),
        params_from_iter(values.clone()),
        |r| r.get(0),
    )?;

    let mut values = values;
    values.push(SqlValue::Integer(page_size));
    values.push(SqlValue::Integer((page - 1) * page_size));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM courses{} ORDER BY course_name, course_id LIMIT ? OFFSET ?",
        COURSE_COLS, where_part
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), course_json)?
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
        "SELECT COUNT(*) FROM courses
         WHERE course_id LIKE ?1 OR course_name LIKE ?1 OR teacher LIKE ?1",
        [&pattern],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM courses
         WHERE course_id LIKE ?1 OR course_name LIKE ?1 OR teacher LIKE ?1
         ORDER BY course_name, course_id LIMIT ?2 OFFSET ?3",
        COURSE_COLS
    ))?;
    let items = stmt
        .query_map((&pattern, page_size, (page - 1) * page_size), course_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(helpers::page_envelope(items, page, page_size, total))
}

fn handle_count(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let (clauses, values) = list_filters(&req.params);
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM courses{}", where_sql(&clauses)),
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

    let mut imported: i64 = 0;
    let mut failures: Vec<serde_json::Value> = Vec::new();
    for record in records {
        let result = parse_course(record).and_then(|input| insert_course(conn, &input));
        match result {
            Ok(()) => imported += 1,
            Err(e) => failures.push(json!({ "record": record, "reason": e.to_string() })),
        }
    }

    helpers::log_operation(
        conn,
        &principal.username,
        "import_courses",
        None,
        Some(&format!(
            "imported {} courses, {} failures",
            imported,
            failures.len()
        )),
        None,
    )?;
    log::info!("imported {} courses, {} failures", imported, failures.len());

    Ok(json!({
        "importedCount": imported,
        "failedCount": failures.len(),
        "failures": failures,
    }))
}

/// Semesters that actually have grade rows, newest first.
fn handle_semesters(
    state: &mut AppState,
    _req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT semester FROM grades
         WHERE semester IS NOT NULL AND semester != ''
         ORDER BY semester DESC",
    )?;
    let semesters = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "semesters": semesters }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "courses.add" => handle_add(state, req),
        "courses.update" => handle_update(state, req),
        "courses.delete" => handle_delete(state, req),
        "courses.get" => handle_get(state, req),
        "courses.list" => handle_list(state, req),
        "courses.search" => handle_search(state, req),
        "courses.count" => handle_count(state, req),
        "courses.import" => handle_import(state, req),
        "courses.semesters" => handle_semesters(state, req),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
