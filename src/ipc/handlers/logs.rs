use chrono::{Duration, Local};
use rusqlite::{params_from_iter, types::Value as SqlValue};
use serde_json::json;

use crate::auth::Role;
use crate::ipc::error::{ok, ServiceError};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

const LOG_COLS: &str = "id, username, operation, target, details, ip_address, timestamp";

const DEFAULT_RETENTION_DAYS: i64 = 365;

fn log_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "username": r.get::<_, String>(1)?,
        "operation": r.get::<_, String>(2)?,
        "target": r.get::<_, Option<String>>(3)?,
        "details": r.get::<_, Option<String>>(4)?,
        "ipAddress": r.get::<_, Option<String>>(5)?,
        "timestamp": r.get::<_, String>(6)?,
    }))
}

fn cutoff_stamp(days: i64) -> String {
    (Local::now() - Duration::days(days))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let (page, page_size) = helpers::page_params(&req.params);

    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(v) = helpers::opt_str(&req.params, "username") {
        clauses.push("username = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "operation") {
        clauses.push("operation = ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "startDate") {
        clauses.push("timestamp >= ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "endDate") {
        clauses.push("timestamp <= ?");
        values.push(SqlValue::Text(v));
    }
    let where_part = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM operation_logs{}", where_part),
        params_from_iter(values.clone()),
        |r| r.get(0),
    )?;

    let mut values = values;
    values.push(SqlValue::Integer(page_size));
    values.push(SqlValue::Integer((page - 1) * page_size));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM operation_logs{} ORDER BY timestamp DESC, id LIMIT ? OFFSET ?",
        LOG_COLS, where_part
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), log_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(helpers::page_envelope(items, page, page_size, total))
}

fn handle_search(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let keyword = helpers::req_str(&req.params, "keyword")?;
    let (page, page_size) = helpers::page_params(&req.params);
    let pattern = format!("%{}%", keyword);

    let mut clauses =
        vec!["(username LIKE ?1 OR operation LIKE ?1 OR target LIKE ?1 OR details LIKE ?1)"];
    let mut values: Vec<SqlValue> = vec![SqlValue::Text(pattern)];
    if let Some(v) = helpers::opt_str(&req.params, "startDate") {
        clauses.push("timestamp >= ?");
        values.push(SqlValue::Text(v));
    }
    if let Some(v) = helpers::opt_str(&req.params, "endDate") {
        clauses.push("timestamp <= ?");
        values.push(SqlValue::Text(v));
    }
    let where_part = clauses.join(" AND ");

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM operation_logs WHERE {}", where_part),
        params_from_iter(values.clone()),
        |r| r.get(0),
    )?;

    let mut values = values;
    values.push(SqlValue::Integer(page_size));
    values.push(SqlValue::Integer((page - 1) * page_size));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM operation_logs WHERE {} ORDER BY timestamp DESC, id LIMIT ? OFFSET ?",
        LOG_COLS, where_part
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), log_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(helpers::page_envelope(items, page, page_size, total))
}

fn handle_user_activity(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_login(state)?;
    let username = helpers::req_str(&req.params, "username")?;
    helpers::require_admin_or_self(state, &username)?;
    let conn = helpers::db(state)?;
    let limit = helpers::opt_int(&req.params, "limit")?
        .filter(|l| (1..=500).contains(l))
        .unwrap_or(50);

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM operation_logs WHERE username = ?
         ORDER BY timestamp DESC, id LIMIT ?",
        LOG_COLS
    ))?;
    let items = stmt
        .query_map((&username, limit), log_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "username": username, "items": items }))
}

/// Per-operation counts over a trailing window, busiest first.
fn handle_operation_stats(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let days = helpers::opt_int(&req.params, "days")?
        .filter(|d| *d >= 1)
        .unwrap_or(30);
    let cutoff = cutoff_stamp(days);

    let mut stmt = conn.prepare(
        "SELECT operation, COUNT(*) FROM operation_logs
         WHERE timestamp >= ?
         GROUP BY operation ORDER BY COUNT(*) DESC, operation",
    )?;
    let operations = stmt
        .query_map([&cutoff], |r| {
            Ok(json!({
                "operation": r.get::<_, String>(0)?,
                "count": r.get::<_, i64>(1)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM operation_logs WHERE timestamp >= ?",
        [&cutoff],
        |r| r.get(0),
    )?;

    Ok(json!({ "days": days, "totalCount": total, "operations": operations }))
}

/// Bulk retention purge. The purge itself lands in the trail: its entry
/// is inserted after the delete inside the same transaction.
fn handle_purge(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let days = helpers::opt_int(&req.params, "days")?
        .filter(|d| *d >= 0)
        .unwrap_or(DEFAULT_RETENTION_DAYS);
    let cutoff = cutoff_stamp(days);

    let tx = conn.unchecked_transaction()?;
    let purged = tx.execute("DELETE FROM operation_logs WHERE timestamp <= ?", [&cutoff])?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "purge_logs",
        None,
        Some(&format!(
            "purged {} log entries older than {} days",
            purged, days
        )),
        None,
    )?;
    tx.commit()?;
    log::info!("purged {} log entries older than {} days", purged, days);

    Ok(json!({ "purgedCount": purged, "days": days }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "logs.list" => handle_list(state, req),
        "logs.search" => handle_search(state, req),
        "logs.userActivity" => handle_user_activity(state, req),
        "logs.operationStats" => handle_operation_stats(state, req),
        "logs.purge" => handle_purge(state, req),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
