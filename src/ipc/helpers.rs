use chrono::Local;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{has_permission, Principal, Role};
use crate::ipc::error::ServiceError;
use crate::ipc::types::AppState;

pub fn now_stamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn db(state: &AppState) -> Result<&Connection, ServiceError> {
    state.db.as_ref().ok_or(ServiceError::NoWorkspace)
}

pub fn require_login(state: &AppState) -> Result<Principal, ServiceError> {
    state
        .session
        .as_ref()
        .cloned()
        .ok_or_else(|| ServiceError::Permission("not logged in".to_string()))
}

/// The first action of every gated operation. Denied attempts are not
/// written to the operation log.
pub fn require_role(state: &AppState, required: Role) -> Result<Principal, ServiceError> {
    let Some(principal) = state.session.as_ref() else {
        return Err(ServiceError::Permission("not logged in".to_string()));
    };
    if !has_permission(Some(principal), required) {
        return Err(ServiceError::Permission(format!(
            "requires {} role",
            required.name()
        )));
    }
    Ok(principal.clone())
}

/// Admin, or the principal acting on their own account.
pub fn require_admin_or_self(state: &AppState, username: &str) -> Result<Principal, ServiceError> {
    let principal = require_login(state)?;
    if principal.role != Role::Admin && principal.username != username {
        return Err(ServiceError::Permission(
            "requires admin role or your own account".to_string(),
        ));
    }
    Ok(principal)
}

/// Student principals may only see grade rows keyed by their own
/// username; higher roles see everything.
pub fn ensure_own_records(principal: &Principal, student_id: &str) -> Result<(), ServiceError> {
    if principal.role == Role::Student && principal.username != student_id {
        return Err(ServiceError::Permission(
            "students may only view their own records".to_string(),
        ));
    }
    Ok(())
}

/// Append to the audit trail. Callers pass the open transaction so the
/// entry commits (or rolls back) with the mutation it records.
pub fn log_operation(
    conn: &Connection,
    username: &str,
    operation: &str,
    target: Option<&str>,
    details: Option<&str>,
    ip_address: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO operation_logs(id, username, operation, target, details, ip_address, timestamp)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            username,
            operation,
            target,
            details,
            ip_address,
            now_stamp(),
        ),
    )?;
    Ok(())
}

pub fn page_params(params: &serde_json::Value) -> (i64, i64) {
    let page = params
        .get("page")
        .and_then(|v| v.as_i64())
        .filter(|p| *p >= 1)
        .unwrap_or(1);
    let page_size = params
        .get("pageSize")
        .and_then(|v| v.as_i64())
        .filter(|p| (1..=200).contains(p))
        .unwrap_or(20);
    (page, page_size)
}

pub fn page_envelope(
    items: Vec<serde_json::Value>,
    page: i64,
    page_size: i64,
    total_items: i64,
) -> serde_json::Value {
    let total_pages = if total_items == 0 {
        0
    } else {
        (total_items + page_size - 1) / page_size
    };
    json!({
        "items": items,
        "page": page,
        "pageSize": page_size,
        "totalItems": total_items,
        "totalPages": total_pages,
    })
}

pub fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn req_str(params: &serde_json::Value, key: &str) -> Result<String, ServiceError> {
    opt_str(params, key).ok_or_else(|| ServiceError::Validation(format!("missing {}", key)))
}

/// Integers arrive as JSON numbers or as numeric strings (console
/// clients send text); anything else is a validation failure.
pub fn opt_int(params: &serde_json::Value, key: &str) -> Result<Option<i64>, ServiceError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .map(Some)
            .ok_or_else(|| ServiceError::Validation(format!("{} must be an integer", key))),
    }
}

pub fn req_int(params: &serde_json::Value, key: &str) -> Result<i64, ServiceError> {
    opt_int(params, key)?.ok_or_else(|| ServiceError::Validation(format!("missing {}", key)))
}

pub fn opt_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, ServiceError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .map(Some)
            .ok_or_else(|| ServiceError::Validation(format!("{} must be a number", key))),
    }
}

pub fn req_f64(params: &serde_json::Value, key: &str) -> Result<f64, ServiceError> {
    opt_f64(params, key)?.ok_or_else(|| ServiceError::Validation(format!("missing {}", key)))
}

/// Tri-state patch field: outer None = key absent (leave untouched),
/// Some(None) = explicit null (clear the column), Some(Some(v)) = set.
pub fn patch_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<Option<String>>, ServiceError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(Some(None)),
        Some(v) => match v.as_str() {
            Some(s) => Ok(Some(Some(s.trim().to_string()))),
            None => Err(ServiceError::Validation(format!(
                "{} must be a string or null",
                key
            ))),
        },
    }
}
