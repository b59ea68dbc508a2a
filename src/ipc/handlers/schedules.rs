use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::ipc::error::{ok, ServiceError};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use crate::timetable::{self, Slot, WeekType};

const SCHEDULE_COLS: &str = "s.id, s.course_id, COALESCE(c.course_name, s.course_id), s.semester,
     s.day_of_week, s.start_section, s.end_section, s.location, s.teacher,
     s.week_type, s.start_week, s.end_week, s.created_at, s.updated_at";

const SCHEDULE_FROM: &str = "FROM schedules s
     LEFT JOIN courses c ON c.course_id = s.course_id";

fn schedule_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "courseId": r.get::<_, String>(1)?,
        "courseName": r.get::<_, String>(2)?,
        "semester": r.get::<_, String>(3)?,
        "dayOfWeek": r.get::<_, i64>(4)?,
        "startSection": r.get::<_, i64>(5)?,
        "endSection": r.get::<_, i64>(6)?,
        "location": r.get::<_, String>(7)?,
        "teacher": r.get::<_, Option<String>>(8)?,
        "weekType": r.get::<_, i64>(9)?,
        "startWeek": r.get::<_, i64>(10)?,
        "endWeek": r.get::<_, i64>(11)?,
        "createdAt": r.get::<_, Option<String>>(12)?,
        "updatedAt": r.get::<_, Option<String>>(13)?,
    }))
}

struct ScheduleInput {
    course_id: String,
    semester: String,
    day_of_week: i64,
    start_section: i64,
    end_section: i64,
    location: String,
    teacher: Option<String>,
    week_type: WeekType,
    start_week: i64,
    end_week: i64,
}

impl ScheduleInput {
    fn slot(&self) -> Slot {
        Slot {
            semester: self.semester.clone(),
            day_of_week: self.day_of_week,
            start_section: self.start_section,
            end_section: self.end_section,
            start_week: self.start_week,
            end_week: self.end_week,
            week_type: self.week_type,
        }
    }
}

fn check_ranges(
    day_of_week: i64,
    start_section: i64,
    end_section: i64,
    start_week: i64,
    end_week: i64,
) -> Result<(), ServiceError> {
    if !(1..=7).contains(&day_of_week) {
        return Err(ServiceError::Validation(
            "dayOfWeek must be between 1 and 7".to_string(),
        ));
    }
    if start_section > end_section {
        return Err(ServiceError::Validation(
            "startSection cannot be greater than endSection".to_string(),
        ));
    }
    if start_week > end_week {
        return Err(ServiceError::Validation(
            "startWeek cannot be greater than endWeek".to_string(),
        ));
    }
    Ok(())
}

fn parse_entry(params: &serde_json::Value) -> Result<ScheduleInput, ServiceError> {
    let course_id = helpers::req_str(params, "courseId")?;
    let semester = helpers::req_str(params, "semester")?;
    let day_of_week = helpers::req_int(params, "dayOfWeek")?;
    let start_section = helpers::req_int(params, "startSection")?;
    let end_section = helpers::req_int(params, "endSection")?;
    let start_week = helpers::req_int(params, "startWeek")?;
    let end_week = helpers::req_int(params, "endWeek")?;
    let location = helpers::req_str(params, "location")?;
    let week_type_code = helpers::opt_int(params, "weekType")?.unwrap_or(0);
    let week_type = WeekType::from_code(week_type_code).ok_or_else(|| {
        ServiceError::Validation("weekType must be 0 (all), 1 (odd) or 2 (even)".to_string())
    })?;
    check_ranges(day_of_week, start_section, end_section, start_week, end_week)?;

    Ok(ScheduleInput {
        course_id,
        semester,
        day_of_week,
        start_section,
        end_section,
        location,
        teacher: helpers::opt_str(params, "teacher"),
        week_type,
        start_week,
        end_week,
    })
}

fn conflict_error(conflicts: Vec<timetable::ConflictEntry>) -> ServiceError {
    let summary = conflicts
        .iter()
        .map(|c| format!("{} ({})", c.course_name, c.location))
        .collect::<Vec<_>>()
        .join(", ");
    let details = serde_json::to_value(&conflicts).ok();
    ServiceError::Conflict {
        message: format!("time conflict with existing entries: {}", summary),
        details,
    }
}

fn insert_entry(conn: &Connection, input: &ScheduleInput) -> Result<String, ServiceError> {
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

    let conflicts = timetable::find_conflicts(conn, &input.slot(), None)?;
    if !conflicts.is_empty() {
        return Err(conflict_error(conflicts));
    }

    let id = Uuid::new_v4().to_string();
    let now = helpers::now_stamp();
    conn.execute(
        "INSERT INTO schedules(id, course_id, semester, day_of_week, start_section, end_section,
                               location, teacher, week_type, start_week, end_week,
                               created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &input.course_id,
            &input.semester,
            input.day_of_week,
            input.start_section,
            input.end_section,
            &input.location,
            &input.teacher,
            input.week_type.code(),
            input.start_week,
            input.end_week,
            &now,
            &now,
        ),
    )?;
    Ok(id)
}

fn handle_add(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let input = parse_entry(&req.params)?;

    let tx = conn.unchecked_transaction()?;
    let id = insert_entry(&tx, &input)?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "add_schedule",
        Some(&format!("schedule {}", id)),
        Some(&format!(
            "scheduled course {} on day {} sections {}-{} at {}",
            input.course_id, input.day_of_week, input.start_section, input.end_section,
            input.location
        )),
        None,
    )?;
    tx.commit()?;
    log::info!(
        "added schedule entry for course {} ({} day {})",
        input.course_id,
        input.semester,
        input.day_of_week
    );

    Ok(json!({ "id": id }))
}

struct ScheduleRow {
    course_id: String,
    semester: String,
    day_of_week: i64,
    start_section: i64,
    end_section: i64,
    week_type: i64,
    start_week: i64,
    end_week: i64,
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Teacher)?;
    let conn = helpers::db(state)?;
    let id = helpers::req_str(&req.params, "id")?;

    let existing: Option<ScheduleRow> = conn
        .query_row(
            "SELECT course_id, semester, day_of_week, start_section, end_section,
                    week_type, start_week, end_week
             FROM schedules WHERE id = ?",
            [&id],
            |r| {
                Ok(ScheduleRow {
                    course_id: r.get(0)?,
                    semester: r.get(1)?,
                    day_of_week: r.get(2)?,
                    start_section: r.get(3)?,
                    end_section: r.get(4)?,
                    week_type: r.get(5)?,
                    start_week: r.get(6)?,
                    end_week: r.get(7)?,
                })
            },
        )
        .optional()?;
    let Some(existing) = existing else {
        return Err(ServiceError::NotFound(format!(
            "schedule entry {} not found",
            id
        )));
    };

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    let course_id = helpers::opt_str(&req.params, "courseId");
    if let Some(course_id) = &course_id {
        if course_id != &existing.course_id {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM courses WHERE course_id = ?",
                    [course_id],
                    |r| r.get(0),
                )
                .optional()?;
            if found.is_none() {
                return Err(ServiceError::NotFound(format!(
                    "course {} not found",
                    course_id
                )));
            }
        }
        sets.push("course_id = ?");
        values.push(SqlValue::Text(course_id.clone()));
    }
    let semester = helpers::opt_str(&req.params, "semester");
    if let Some(v) = &semester {
        sets.push("semester = ?");
        values.push(SqlValue::Text(v.clone()));
    }
    let day_of_week = helpers::opt_int(&req.params, "dayOfWeek")?;
    if let Some(v) = day_of_week {
        sets.push("day_of_week = ?");
        values.push(SqlValue::Integer(v));
    }
    let start_section = helpers::opt_int(&req.params, "startSection")?;
    if let Some(v) = start_section {
        sets.push("start_section = ?");
        values.push(SqlValue::Integer(v));
    }
    let end_section = helpers::opt_int(&req.params, "endSection")?;
    if let Some(v) = end_section {
        sets.push("end_section = ?");
        values.push(SqlValue::Integer(v));
    }
    let start_week = helpers::opt_int(&req.params, "startWeek")?;
    if let Some(v) = start_week {
        sets.push("start_week = ?");
        values.push(SqlValue::Integer(v));
    }
    let end_week = helpers::opt_int(&req.params, "endWeek")?;
    if let Some(v) = end_week {
        sets.push("end_week = ?");
        values.push(SqlValue::Integer(v));
    }
    let week_type_code = helpers::opt_int(&req.params, "weekType")?;
    let week_type = match week_type_code {
        Some(code) => {
            let wt = WeekType::from_code(code).ok_or_else(|| {
                ServiceError::Validation("weekType must be 0 (all), 1 (odd) or 2 (even)".to_string())
            })?;
            sets.push("week_type = ?");
            values.push(SqlValue::Integer(code));
            wt
        }
        None => WeekType::from_code(existing.week_type).unwrap_or(WeekType::All),
    };
    if let Some(field) = helpers::patch_str(&req.params, "location")? {
        match field {
            Some(v) if !v.is_empty() => {
                sets.push("location = ?");
                values.push(SqlValue::Text(v));
            }
            _ => {
                return Err(ServiceError::Validation(
                    "location cannot be cleared".to_string(),
                ))
            }
        }
    }
    if let Some(field) = helpers::patch_str(&req.params, "teacher")? {
        sets.push("teacher = ?");
        values.push(field.map(SqlValue::Text).unwrap_or(SqlValue::Null));
    }

    if sets.is_empty() {
        return Err(ServiceError::Validation("no fields to update".to_string()));
    }

    // Range checks and the conflict search run on the merged view:
    // patched fields where present, stored values otherwise.
    let merged = Slot {
        semester: semester.unwrap_or(existing.semester),
        day_of_week: day_of_week.unwrap_or(existing.day_of_week),
        start_section: start_section.unwrap_or(existing.start_section),
        end_section: end_section.unwrap_or(existing.end_section),
        start_week: start_week.unwrap_or(existing.start_week),
        end_week: end_week.unwrap_or(existing.end_week),
        week_type,
    };
    check_ranges(
        merged.day_of_week,
        merged.start_section,
        merged.end_section,
        merged.start_week,
        merged.end_week,
    )?;

    let conflicts = timetable::find_conflicts(conn, &merged, Some(&id))?;
    if !conflicts.is_empty() {
        return Err(conflict_error(conflicts));
    }

    sets.push("updated_at = ?");
    values.push(SqlValue::Text(helpers::now_stamp()));
    values.push(SqlValue::Text(id.clone()));

    let sql = format!("UPDATE schedules SET {} WHERE id = ?", sets.join(", "));
    let tx = conn.unchecked_transaction()?;
    tx.execute(&sql, params_from_iter(values))?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "update_schedule",
        Some(&format!("schedule {}", id)),
        Some(&format!("updated schedule entry {}", id)),
        None,
    )?;
    tx.commit()?;
    log::info!("updated schedule entry {}", id);

    Ok(json!({ "id": id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let id = helpers::req_str(&req.params, "id")?;

    let tx = conn.unchecked_transaction()?;
    let deleted = tx.execute("DELETE FROM schedules WHERE id = ?", [&id])?;
    if deleted == 0 {
        return Err(ServiceError::NotFound(format!(
            "schedule entry {} not found",
            id
        )));
    }
    helpers::log_operation(
        &tx,
        &principal.username,
        "delete_schedule",
        Some(&format!("schedule {}", id)),
        None,
        None,
    )?;
    tx.commit()?;
    log::info!("deleted schedule entry {}", id);

    Ok(json!({ "id": id }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let id = helpers::req_str(&req.params, "id")?;

    let row = conn
        .query_row(
            &format!("SELECT {} {} WHERE s.id = ?", SCHEDULE_COLS, SCHEDULE_FROM),
            [&id],
            schedule_json,
        )
        .optional()?;
    row.ok_or_else(|| ServiceError::NotFound(format!("schedule entry {} not found", id)))
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let semester = helpers::req_str(&req.params, "semester")?;

    let mut clauses = vec!["s.semester = ?"];
    let mut values: Vec<SqlValue> = vec![SqlValue::Text(semester)];
    if let Some(v) = helpers::opt_str(&req.params, "courseId") {
        clauses.push("s.course_id = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_int(&req.params, "dayOfWeek")? {
        clauses.push("s.day_of_week = ?");
        values.push(SqlValue::Integer(v));
    }
    if let Some(v) = helpers::opt_int(&req.params, "weekType")? {
        clauses.push("s.week_type = ?");
        values.push(SqlValue::Integer(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "location") {
        clauses.push("s.location = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "teacher") {
        clauses.push("s.teacher = ?");
        values.push(SqlValue::Text(v));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} {} WHERE {} ORDER BY s.day_of_week, s.start_section",
        SCHEDULE_COLS,
        SCHEDULE_FROM,
        clauses.join(" AND ")
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), schedule_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "items": items }))
}

/// Entries that actually occur in the given week: the week range must
/// cover it and the parity must admit it.
fn handle_by_week(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let semester = helpers::req_str(&req.params, "semester")?;
    let week = helpers::req_int(&req.params, "week")?;
    if week < 1 {
        return Err(ServiceError::Validation(
            "week must be a positive integer".to_string(),
        ));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} {} WHERE s.semester = ? ORDER BY s.day_of_week, s.start_section",
        SCHEDULE_COLS, SCHEDULE_FROM
    ))?;
    let rows = stmt
        .query_map([&semester], |r| {
            let value = schedule_json(r)?;
            let week_type: i64 = r.get(9)?;
            let start_week: i64 = r.get(10)?;
            let end_week: i64 = r.get(11)?;
            Ok((value, week_type, start_week, end_week))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let items: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(_, week_type, start_week, end_week)| {
            let parity = WeekType::from_code(*week_type).unwrap_or(WeekType::All);
            timetable::occurs_in_week(parity, *start_week, *end_week, week)
        })
        .map(|(value, _, _, _)| value)
        .collect();

    Ok(json!({ "week": week, "items": items }))
}

fn handle_for_course(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let course_id = helpers::req_str(&req.params, "courseId")?;

    let mut clauses = vec!["s.course_id = ?"];
    let mut values: Vec<SqlValue> = vec![SqlValue::Text(course_id)];
    if let Some(v) = helpers::opt_str(&req.params, "semester") {
        clauses.push("s.semester = ?");
        values.push(SqlValue::Text(v));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} {} WHERE {} ORDER BY s.semester DESC, s.day_of_week, s.start_section",
        SCHEDULE_COLS,
        SCHEDULE_FROM,
        clauses.join(" AND ")
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), schedule_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "items": items }))
}

fn handle_semesters(
    state: &mut AppState,
    _req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Student)?;
    let conn = helpers::db(state)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT semester FROM schedules
         WHERE semester IS NOT NULL AND semester != ''
         ORDER BY semester DESC",
    )?;
    let semesters = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "semesters": semesters }))
}

fn handle_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let Some(records) = req.params.get("records").and_then(|v| v.as_array()) else {
        return Err(ServiceError::Validation(
            "records must be an array".to_string(),
        ));
    };

    // Records insert sequentially, so an accepted entry participates in
    // the conflict search for the ones after it.
    let mut imported: i64 = 0;
    let mut failures: Vec<serde_json::Value> = Vec::new();
    for record in records {
        let result = parse_entry(record).and_then(|input| insert_entry(conn, &input).map(|_| ()));
        match result {
            Ok(()) => imported += 1,
            Err(e) => failures.push(json!({ "record": record, "reason": e.to_string() })),
        }
    }

    helpers::log_operation(
        conn,
        &principal.username,
        "import_schedules",
        None,
        Some(&format!(
            "imported {} schedule entries, {} failures",
            imported,
            failures.len()
        )),
        None,
    )?;
    log::info!(
        "imported {} schedule entries, {} failures",
        imported,
        failures.len()
    );

    Ok(json!({
        "importedCount": imported,
        "failedCount": failures.len(),
        "failures": failures,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "schedules.add" => handle_add(state, req),
        "schedules.update" => handle_update(state, req),
        "schedules.delete" => handle_delete(state, req),
        "schedules.get" => handle_get(state, req),
        "schedules.list" => handle_list(state, req),
        "schedules.byWeek" => handle_by_week(state, req),
        "schedules.forCourse" => handle_for_course(state, req),
        "schedules.semesters" => handle_semesters(state, req),
        "schedules.import" => handle_import(state, req),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
