use rusqlite::OptionalExtension;
use serde_json::json;

use crate::auth::{self, Principal, Role};
use crate::ipc::error::{ok, ServiceError};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

struct UserRow {
    username: String,
    password_hash: String,
    real_name: Option<String>,
    role: String,
    email: Option<String>,
    phone: Option<String>,
}

fn handle_login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, ServiceError> {
    let username = helpers::req_str(&req.params, "username")?;
    let password = helpers::req_str(&req.params, "password")?;
    let client_ip = helpers::opt_str(&req.params, "clientIp");

    let conn = helpers::db(state)?;
    let row: Option<UserRow> = conn
        .query_row(
            "SELECT username, password_hash, real_name, role, email, phone
             FROM users WHERE username = ?",
            [&username],
            |r| {
                Ok(UserRow {
                    username: r.get(0)?,
                    password_hash: r.get(1)?,
                    real_name: r.get(2)?,
                    role: r.get(3)?,
                    email: r.get(4)?,
                    phone: r.get(5)?,
                })
            },
        )
        .optional()?;

    let Some(user) = row else {
        log::warn!("login failed for unknown user {}", username);
        return Err(ServiceError::AuthFailed);
    };
    if !auth::verify_password(&password, &user.password_hash) {
        log::warn!("login failed for user {}", username);
        return Err(ServiceError::AuthFailed);
    }

    let now = helpers::now_stamp();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE users SET last_login = ? WHERE username = ?",
        (&now, &user.username),
    )?;
    helpers::log_operation(
        &tx,
        &user.username,
        "login",
        None,
        Some(&format!("user {} logged in", user.username)),
        client_ip.as_deref(),
    )?;
    tx.commit()?;

    let role = Role::from_name(&user.role);
    state.session = Some(Principal {
        username: user.username.clone(),
        role,
    });
    log::info!("user {} logged in as {}", user.username, role.name());

    Ok(json!({
        "username": user.username,
        "realName": user.real_name,
        "role": role.name(),
        "email": user.email,
        "phone": user.phone,
        "lastLogin": now,
    }))
}

fn handle_logout(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, ServiceError> {
    let Some(principal) = state.session.take() else {
        return Ok(json!({ "loggedOut": false }));
    };
    if let Ok(conn) = helpers::db(state) {
        if let Err(e) = helpers::log_operation(
            conn,
            &principal.username,
            "logout",
            None,
            Some(&format!("user {} logged out", principal.username)),
            None,
        ) {
            log::warn!("failed to record logout for {}: {}", principal.username, e);
        }
    }
    log::info!("user {} logged out", principal.username);
    Ok(json!({ "loggedOut": true }))
}

fn handle_whoami(state: &AppState, _req: &Request) -> Result<serde_json::Value, ServiceError> {
    Ok(json!({ "session": state.session }))
}

fn handle_change_password(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_login(state)?;
    let username = helpers::req_str(&req.params, "username")?;
    if principal.username != username {
        return Err(ServiceError::Permission(
            "passwords can only be changed on your own account".to_string(),
        ));
    }
    let old_password = helpers::req_str(&req.params, "oldPassword")?;
    let new_password = helpers::req_str(&req.params, "newPassword")?;
    if !auth::valid_password(&new_password) {
        return Err(ServiceError::Validation(
            "password must be at least 6 characters and contain a letter and a digit".to_string(),
        ));
    }

    let conn = helpers::db(state)?;
    let stored: Option<String> = conn
        .query_row(
            "SELECT password_hash FROM users WHERE username = ?",
            [&username],
            |r| r.get(0),
        )
        .optional()?;
    let Some(stored) = stored else {
        return Err(ServiceError::NotFound(format!(
            "user {} not found",
            username
        )));
    };
    if !auth::verify_password(&old_password, &stored) {
        return Err(ServiceError::AuthFailed);
    }

    let now = helpers::now_stamp();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE username = ?",
        (auth::hash_password(&new_password), &now, &username),
    )?;
    helpers::log_operation(
        &tx,
        &principal.username,
        "change_password",
        Some(&format!("user {}", username)),
        None,
        None,
    )?;
    tx.commit()?;
    log::info!("user {} changed their password", username);

    Ok(json!({ "username": username }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "auth.login" => handle_login(state, req),
        "auth.logout" => handle_logout(state, req),
        "auth.whoami" => handle_whoami(state, req),
        "auth.changePassword" => handle_change_password(state, req),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
