use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::ipc::error::{ok, ServiceError};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use crate::stats;

const GRADE_COLS: &str = "g.id, g.student_id, g.course_id, g.semester, g.score, g.grade_point,
     g.exam_date, g.remarks, g.created_at, g.updated_at,
     s.name, s.class_name, c.course_name, c.credit";

const GRADE_FROM: &str = "FROM grades g
     LEFT JOIN students s ON s.student_id = g.student_id
     LEFT JOIN courses c ON c.course_id = g.course_id";

fn grade_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "courseId": r.get::<_, String>(2)?,
        "semester": r.get::<_, String>(3)?,
        "score": r.get::<_, f64>(4)?,
        "gradePoint": r.get::<_, f64>(5)?,
        "examDate": r.get::<_, Option<String>>(6)?,
        "remarks": r.get::<_, Option<String>>(7)?,
        "createdAt": r.get::<_, Option<String>>(8)?,
        "updatedAt": r.get::<_, Option<String>>(9)?,
        "studentName": r.get::<_, Option<String>>(10)?,
        "className": r.get::<_, Option<String>>(11)?,
        "courseName": r.get::<_, Option<String>>(12)?,
        "credit": r.get::<_, Option<f64>>(13)?,
    }))
}

struct GradeInput {
    student_id: String,
    course_id: String,
    semester: String,
    score: f64,
    grade_point: f64,
    exam_date: Option<String>,
    remarks: Option<String>,
}

fn parse_grade(params: &serde_json::Value) -> Result<GradeInput, ServiceError> {
    let student_id = helpers::req_str(params, "studentId")?;
    let course_id = helpers::req_str(params, "courseId")?;
    let semester = helpers::req_str(params, "semester")?;
    let score = helpers::req_f64(params, "score")?;
    if !(0.0..=100.0).contains(&score) {
        return Err(ServiceError::Validation(
            "score must be between 0 and 100".to_string(),
        ));
    }
    let grade_point =
        helpers::opt_f64(params, "gradePoint")?.unwrap_or_else(|| stats::grade_point_for(score));

    Ok(GradeInput {
        student_id,
        course_id,
        semester,
        score,
        grade_point,
        exam_date: helpers::opt_str(params, "examDate"),
        remarks: helpers::opt_str(params, "remarks"),
    })
}

fn insert_grade(conn: &Connection, input: &GradeInput) -> Result<String, ServiceError> {
    let student: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE student_id = ?",
            [&input.student_id],
            |r| r.get(0),
        )
        .optional()?;
    if student.is_none() {
        return Err(ServiceError::NotFound(format!(
            "student {} not found",
            input.student_id
        )));
    }
    let course: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM courses WHERE course_id = ?",
            [&input.course_id],
            |r| r.get(0),
        )
        .optional()?;
    if course.is_none() {
        return Err(ServiceError::NotFound(format!(
            "course {} not found",
            input.course_id
        )));
    }

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM grades WHERE student_id = ? AND course_id = ? AND semester = ?",
            (&input.student_id, &input.course_id, &input.semester),
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(ServiceError::Conflict {
            message: format!(
                "student {} already has a grade for course {} in semester {}",
                input.student_id, input.course_id, input.semester
            ),
            details: None,
        });
    }

    let id = Uuid::new_v4().to_string();
    let now = helpers::now_stamp();
    conn.execute(
        "INSERT INTO grades(id, student_id, course_id, semester, score, grade_point,
                            exam_date, remarks, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &input.student_id,
            &input.course_id,
            &input.semester,
            input.score,
            input.grade_point,
            &input.exam_date,
            &input.remarks,
            &now,
            &now,
        ),
    )?;
    Ok(id)
}

fn handle_add(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let input = parse_grade(&req.params)?;

    let tx = conn.unchecked_transaction()?;
    let id = insert_grade(&tx, &input)?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "add_grade",
        Some(&format!(
            "grade {}/{}/{}",
            input.student_id, input.course_id, input.semester
        )),
        Some(&format!(
            "recorded score {} for student {} in course {}",
            input.score, input.student_id, input.course_id
        )),
        None,
    )?;
    tx.commit()?;
    log::info!(
        "added grade for student {} course {} semester {}",
        input.student_id,
        input.course_id,
        input.semester
    );

    Ok(json!({ "id": id, "gradePoint": input.grade_point }))
}

/// Identity fields (student, course, semester) are immutable; a grade
/// that must move is deleted and re-added.
fn update_by_id(state: &AppState, req: &Request, id: &str) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    let mut new_grade_point: Option<f64> = None;

    let score = helpers::opt_f64(&req.params, "score")?;
    if let Some(score) = score {
        if !(0.0..=100.0).contains(&score) {
            return Err(ServiceError::Validation(
                "score must be between 0 and 100".to_string(),
            ));
        }
        sets.push("score = ?");
        values.push(SqlValue::Real(score));
    }
    match helpers::opt_f64(&req.params, "gradePoint")? {
        Some(gp) => {
            sets.push("grade_point = ?");
            values.push(SqlValue::Real(gp));
            new_grade_point = Some(gp);
        }
        None => {
            // A score change without an explicit grade point recomputes it.
            if let Some(score) = score {
                let gp = stats::grade_point_for(score);
                sets.push("grade_point = ?");
                values.push(SqlValue::Real(gp));
                new_grade_point = Some(gp);
            }
        }
    }
    for (key, column) in [("examDate", "exam_date = ?"), ("remarks", "remarks = ?")] {
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
    values.push(SqlValue::Text(id.to_string()));

    let sql = format!("UPDATE grades SET {} WHERE id = ?", sets.join(", "));
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(&sql, params_from_iter(values))?;
    if changed == 0 {
        return Err(ServiceError::NotFound(format!("grade {} not found", id)));
    }
    helpers::log_operation(
        &tx,
        &principal.username,
        "update_grade",
        Some(&format!("grade {}", id)),
        Some(&format!("updated grade {}", id)),
        None,
    )?;
    tx.commit()?;
    log::info!("updated grade {}", id);

    let mut result = json!({ "id": id });
    if let Some(gp) = new_grade_point {
        result["gradePoint"] = json!(gp);
    }
    Ok(result)
}

fn resolve_id_by_keys(conn: &Connection, params: &serde_json::Value) -> Result<String, ServiceError> {
    let student_id = helpers::req_str(params, "studentId")?;
    let course_id = helpers::req_str(params, "courseId")?;
    let semester = helpers::req_str(params, "semester")?;
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM grades WHERE student_id = ? AND course_id = ? AND semester = ?",
            (&student_id, &course_id, &semester),
            |r| r.get(0),
        )
        .optional()?;
    id.ok_or_else(|| {
        ServiceError::NotFound(format!(
            "no grade for student {} course {} semester {}",
            student_id, course_id, semester
        ))
    })
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Teacher)?;
    let id = helpers::req_str(&req.params, "id")?;
    update_by_id(state, req, &id)
}

fn handle_update_by_keys(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Teacher)?;
    let id = resolve_id_by_keys(helpers::db(state)?, &req.params)?;
    update_by_id(state, req, &id)
}

fn delete_by_id(state: &AppState, id: &str) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;

    let tx = conn.unchecked_transaction()?;
    let deleted = tx.execute("DELETE FROM grades WHERE id = ?", [id])?;
    if deleted == 0 {
        return Err(ServiceError::NotFound(format!("grade {} not found", id)));
    }
    helpers::log_operation(
        &tx,
        &principal.username,
        "delete_grade",
        Some(&format!("grade {}", id)),
        None,
        None,
    )?;
    tx.commit()?;
    log::info!("deleted grade {}", id);

    Ok(json!({ "id": id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Admin)?;
    let id = helpers::req_str(&req.params, "id")?;
    delete_by_id(state, &id)
}

fn handle_delete_by_keys(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Admin)?;
    let id = resolve_id_by_keys(helpers::db(state)?, &req.params)?;
    delete_by_id(state, &id)
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let id = helpers::req_str(&req.params, "id")?;

    let row = conn
        .query_row(
            &format!("SELECT {} {} WHERE g.id = ?", GRADE_COLS, GRADE_FROM),
            [&id],
            grade_json,
        )
        .optional()?;
    let Some(row) = row else {
        return Err(ServiceError::NotFound(format!("grade {} not found", id)));
    };
    if let Some(student_id) = row.get("studentId").and_then(|v| v.as_str()) {
        helpers::ensure_own_records(&principal, student_id)?;
    }
    Ok(row)
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let (page, page_size) = helpers::page_params(&req.params);

    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    // A student principal is pinned to their own rows regardless of
    // the requested filter.
    let student_filter = if principal.role == Role::Student {
        Some(principal.username.clone())
    } else {
        helpers::opt_str(&req.params, "studentId")
    };
    if let Some(v) = student_filter {
        clauses.push("g.student_id = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "courseId") {
        clauses.push("g.course_id = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "semester") {
        clauses.push("g.semester = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "className") {
        clauses.push("s.class_name = ?");
        values.push(SqlValue::Text(v));
    }
    let where_part = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {}{}", GRADE_FROM, where_part),
        params_from_iter(values.clone()),
        |r| r.get(0),
    )?;

    let mut values = values;
    values.push(SqlValue::Integer(page_size));
    values.push(SqlValue::Integer((page - 1) * page_size));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} {}{} ORDER BY g.semester, g.student_id, g.course_id LIMIT ? OFFSET ?",
        GRADE_COLS, GRADE_FROM, where_part
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), grade_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(helpers::page_envelope(items, page, page_size, total))
}

fn handle_for_student(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let student_id = helpers::req_str(&req.params, "studentId")?;
    helpers::ensure_own_records(&principal, &student_id)?;

    let student: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, class_name FROM students WHERE student_id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((name, class_name)) = student else {
        return Err(ServiceError::NotFound(format!(
            "student {} not found",
            student_id
        )));
    };

    let semester = helpers::opt_str(&req.params, "semester");
    let (page, page_size) = helpers::page_params(&req.params);

    let mut clauses = vec!["g.student_id = ?"];
    let mut values: Vec<SqlValue> = vec![SqlValue::Text(student_id.clone())];
    if let Some(v) = semester {
        clauses.push("g.semester = ?");
        values.push(SqlValue::Text(v));
    }
    let where_part = format!(" WHERE {}", clauses.join(" AND "));

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {}{}", GRADE_FROM, where_part),
        params_from_iter(values.clone()),
        |r| r.get(0),
    )?;

    let mut values = values;
    values.push(SqlValue::Integer(page_size));
    values.push(SqlValue::Integer((page - 1) * page_size));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} {}{} ORDER BY g.semester, g.course_id LIMIT ? OFFSET ?",
        GRADE_COLS, GRADE_FROM, where_part
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), grade_json)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut result = helpers::page_envelope(items, page, page_size, total);
    result["student"] = json!({
        "studentId": student_id,
        "name": name,
        "className": class_name,
    });
    Ok(result)
}

fn handle_for_course(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let course_id = helpers::req_str(&req.params, "courseId")?;

    let course_name: Option<String> = conn
        .query_row(
            "SELECT course_name FROM courses WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(course_name) = course_name else {
        return Err(ServiceError::NotFound(format!(
            "course {} not found",
            course_id
        )));
    };

    let semester = helpers::opt_str(&req.params, "semester");
    let (page, page_size) = helpers::page_params(&req.params);

    let mut clauses = vec!["g.course_id = ?"];
    let mut values: Vec<SqlValue> = vec![SqlValue::Text(course_id.clone())];
    if let Some(v) = semester {
        clauses.push("g.semester = ?");
        values.push(SqlValue::Text(v));
    }
    let where_part = format!(" WHERE {}", clauses.join(" AND "));

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {}{}", GRADE_FROM, where_part),
        params_from_iter(values.clone()),
        |r| r.get(0),
    )?;

    let mut values = values;
    values.push(SqlValue::Integer(page_size));
    values.push(SqlValue::Integer((page - 1) * page_size));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} {}{} ORDER BY g.score DESC, g.student_id LIMIT ? OFFSET ?",
        GRADE_COLS, GRADE_FROM, where_part
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), grade_json)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut result = helpers::page_envelope(items, page, page_size, total);
    result["course"] = json!({ "courseId": course_id, "courseName": course_name });
    Ok(result)
}

fn handle_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let Some(records) = req.params.get("records").and_then(|v| v.as_array()) else {
        return Err(ServiceError::Validation(
            "records must be an array".to_string(),
        ));
    };

    let mut imported: i64 = 0;
    let mut failures: Vec<serde_json::Value> = Vec::new();
    for record in records {
        let result = parse_grade(record).and_then(|input| insert_grade(conn, &input).map(|_| ()));
        match result {
            Ok(()) => imported += 1,
            Err(e) => failures.push(json!({ "record": record, "reason": e.to_string() })),
        }
    }

    helpers::log_operation(
        conn,
        &principal.username,
        "import_grades",
        None,
        Some(&format!(
            "imported {} grades, {} failures",
            imported,
            failures.len()
        )),
        None,
    )?;
    log::info!("imported {} grades, {} failures", imported, failures.len());

    Ok(json!({
        "importedCount": imported,
        "failedCount": failures.len(),
        "failures": failures,
    }))
}

fn handle_student_gpa(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let student_id = helpers::req_str(&req.params, "studentId")?;
    helpers::ensure_own_records(&principal, &student_id)?;

    let student: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, class_name FROM students WHERE student_id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((name, class_name)) = student else {
        return Err(ServiceError::NotFound(format!(
            "student {} not found",
            student_id
        )));
    };

    let semester = helpers::opt_str(&req.params, "semester");
    let filters = stats::StatFilters {
        student_id: Some(student_id.clone()),
        semester: semester.clone(),
        ..Default::default()
    };
    let records = stats::fetch_grade_records(conn, &filters)?;
    let summary = stats::student_gpa(&student_id, semester.as_deref(), &records);

    let mut result =
        serde_json::to_value(&summary).map_err(|e| ServiceError::Store(e.to_string()))?;
    result["studentName"] = json!(name);
    result["className"] = json!(class_name);
    Ok(result)
}

fn handle_statistics(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;

    let raw = req.params.get("filters").cloned().unwrap_or(json!({}));
    let filters: stats::StatFilters = serde_json::from_value(raw)
        .map_err(|e| ServiceError::Validation(format!("invalid filters: {}", e)))?;

    let records = stats::fetch_grade_records(conn, &filters)?;
    let statistics = stats::aggregate(&records);
    serde_json::to_value(&statistics).map_err(|e| ServiceError::Store(e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "grades.add" => handle_add(state, req),
        "grades.update" => handle_update(state, req),
        "grades.updateByKeys" => handle_update_by_keys(state, req),
        "grades.delete" => handle_delete(state, req),
        "grades.deleteByKeys" => handle_delete_by_keys(state, req),
        "grades.get" => handle_get(state, req),
        "grades.list" => handle_list(state, req),
        "grades.forStudent" => handle_for_student(state, req),
        "grades.forCourse" => handle_for_course(state, req),
        "grades.import" => handle_import(state, req),
        "grades.studentGpa" => handle_student_gpa(state, req),
        "grades.statistics" => handle_statistics(state, req),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
