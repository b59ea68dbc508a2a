use rusqlite::{params_from_iter, types::Value as SqlValue, OptionalExtension};
use serde_json::json;

use crate::auth::{self, Role};
use crate::ipc::error::{ok, ServiceError};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

// password_hash never leaves the store.
const USER_COLS: &str =
    "username, real_name, role, email, phone, last_login, created_at, updated_at";

fn user_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "username": r.get::<_, String>(0)?,
        "realName": r.get::<_, Option<String>>(1)?,
        "role": r.get::<_, String>(2)?,
        "email": r.get::<_, Option<String>>(3)?,
        "phone": r.get::<_, Option<String>>(4)?,
        "lastLogin": r.get::<_, Option<String>>(5)?,
        "createdAt": r.get::<_, Option<String>>(6)?,
        "updatedAt": r.get::<_, Option<String>>(7)?,
    }))
}

fn handle_add(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;

    let username = helpers::req_str(&req.params, "username")?;
    if !auth::valid_username(&username) {
        return Err(ServiceError::Validation(
            "username must be 3-20 characters of letters, digits or underscore".to_string(),
        ));
    }
    let password = helpers::req_str(&req.params, "password")?;
    if !auth::valid_password(&password) {
        return Err(ServiceError::Validation(
            "password must be at least 6 characters and contain a letter and a digit".to_string(),
        ));
    }
    let role_name = helpers::req_str(&req.params, "role")?;
    let Some(role) = Role::parse(&role_name) else {
        return Err(ServiceError::Validation(
            "role must be one of: admin, teacher, student, guest".to_string(),
        ));
    };

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE username = ?", [&username], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_some() {
        return Err(ServiceError::Conflict {
            message: format!("user {} already exists", username),
            details: None,
        });
    }

    let now = helpers::now_stamp();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO users(username, password_hash, real_name, role, email, phone,
                           created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &username,
            auth::hash_password(&password),
            helpers::opt_str(&req.params, "realName"),
            role.name(),
            helpers::opt_str(&req.params, "email"),
            helpers::opt_str(&req.params, "phone"),
            &now,
            &now,
        ),
    )?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "add_user",
        Some(&format!("user {}", username)),
        Some(&format!("added user {} with role {}", username, role.name())),
        None,
    )?;
    tx.commit()?;
    log::info!("added user {} with role {}", username, role.name());

    Ok(json!({ "username": username, "role": role.name() }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_login(state)?;
    let username = helpers::req_str(&req.params, "username")?;
    let principal = helpers::require_admin_or_self(state, &username)?;
    let conn = helpers::db(state)?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE username = ?", [&username], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(ServiceError::NotFound(format!(
            "user {} not found",
            username
        )));
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(field) = helpers::patch_str(&req.params, "role")? {
        // Self-service updates must not escalate; only admins touch roles.
        if principal.role != Role::Admin {
            return Err(ServiceError::Permission(
                "only admins may change roles".to_string(),
            ));
        }
        let Some(role) = field.as_deref().and_then(Role::parse) else {
            return Err(ServiceError::Validation(
                "role must be one of: admin, teacher, student, guest".to_string(),
            ));
        };
        sets.push("role = ?");
        values.push(SqlValue::Text(role.name().to_string()));
    }
    for (key, column) in [
        ("realName", "real_name = ?"),
        ("email", "email = ?"),
        ("phone", "phone = ?"),
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
    values.push(SqlValue::Text(username.clone()));

    let sql = format!("UPDATE users SET {} WHERE username = ?", sets.join(", "));
    let tx = conn.unchecked_transaction()?;
    tx.execute(&sql, params_from_iter(values))?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "update_user",
        Some(&format!("user {}", username)),
        Some(&format!("updated user {}", username)),
        None,
    )?;
    tx.commit()?;
    log::info!("updated user {}", username);

    Ok(json!({ "username": username }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let username = helpers::req_str(&req.params, "username")?;
    if username == principal.username {
        return Err(ServiceError::Validation(
            "cannot delete the currently logged-in account".to_string(),
        ));
    }

    let tx = conn.unchecked_transaction()?;
    let deleted = tx.execute("DELETE FROM users WHERE username = ?", [&username])?;
    if deleted == 0 {
        return Err(ServiceError::NotFound(format!(
            "user {} not found",
            username
        )));
    }
    helpers::log_operation(
        &tx,
        &principal.username,
        "delete_user",
        Some(&format!("user {}", username)),
        None,
        None,
    )?;
    tx.commit()?;
    log::info!("deleted user {}", username);

    Ok(json!({ "username": username }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_login(state)?;
    let username = helpers::req_str(&req.params, "username")?;
    helpers::require_admin_or_self(state, &username)?;
    let conn = helpers::db(state)?;

    let row = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE username = ?", USER_COLS),
            [&username],
            user_json,
        )
        .optional()?;
    row.ok_or_else(|| ServiceError::NotFound(format!("user {} not found", username)))
}

fn handle_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let (page, page_size) = helpers::page_params(&req.params);

    let mut clauses: Vec<&'static str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(v) = helpers::opt_str(&req.params, "role") {
        clauses.push("role = ?");
        values.push(SqlValue::Text(v));
    }
    let where_part = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM users{}", where_part),
        params_from_iter(values.clone()),
        |r| r.get(0),
    )?;

    let mut values = values;
    values.push(SqlValue::Integer(page_size));
    values.push(SqlValue::Integer((page - 1) * page_size));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users{} ORDER BY username LIMIT ? OFFSET ?",
        USER_COLS, where_part
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), user_json)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(helpers::page_envelope(items, page, page_size, total))
}

fn handle_reset_password(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let conn = helpers::db(state)?;
    let username = helpers::req_str(&req.params, "username")?;
    let new_password = helpers::req_str(&req.params, "newPassword")?;
    if !auth::valid_password(&new_password) {
        return Err(ServiceError::Validation(
            "password must be at least 6 characters and contain a letter and a digit".to_string(),
        ));
    }

    let now = helpers::now_stamp();
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE username = ?",
        (auth::hash_password(&new_password), &now, &username),
    )?;
    if changed == 0 {
        return Err(ServiceError::NotFound(format!(
            "user {} not found",
            username
        )));
    }
    helpers::log_operation(
        &tx,
        &principal.username,
        "reset_password",
        Some(&format!("user {}", username)),
        None,
        None,
    )?;
    tx.commit()?;
    log::info!("reset password for user {}", username);

    Ok(json!({ "username": username }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "users.add" => handle_add(state, req),
        "users.update" => handle_update(state, req),
        "users.delete" => handle_delete(state, req),
        "users.get" => handle_get(state, req),
        "users.list" => handle_list(state, req),
        "users.resetPassword" => handle_reset_password(state, req),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
