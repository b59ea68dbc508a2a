use serde_json::json;
use std::path::{Path, PathBuf};

use crate::auth::Role;
use crate::backup;
use crate::db;
use crate::ipc::error::{ok, ServiceError};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

fn handle_health(state: &AppState, _req: &Request) -> Result<serde_json::Value, ServiceError> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "session": state.session,
    }))
}

fn handle_workspace_select(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    let path = PathBuf::from(helpers::req_str(&req.params, "path")?);
    let conn = db::open_db(&path).map_err(|e| ServiceError::Store(e.to_string()))?;
    log::info!("workspace selected: {}", path.display());
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    // A new database means any previously bound principal is stale.
    state.session = None;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

fn handle_backup_export(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let Some(workspace) = state.workspace.clone() else {
        return Err(ServiceError::NoWorkspace);
    };
    let out_path = helpers::req_str(&req.params, "outPath")?;

    let summary = backup::export_workspace_bundle(&workspace, Path::new(&out_path))
        .map_err(|e| ServiceError::Store(e.to_string()))?;

    let conn = helpers::db(state)?;
    helpers::log_operation(
        conn,
        &principal.username,
        "backup_export",
        Some(&out_path),
        Some(&format!("exported workspace bundle to {}", out_path)),
        None,
    )?;
    log::info!("exported workspace bundle to {}", out_path);

    Ok(json!({
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "outPath": out_path,
    }))
}

fn handle_backup_import(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, ServiceError> {
    let principal = helpers::require_role(state, Role::Admin)?;
    let Some(workspace) = state.workspace.clone() else {
        return Err(ServiceError::NoWorkspace);
    };
    let in_path = helpers::req_str(&req.params, "inPath")?;

    // Close the live handle before the bundle replaces the file;
    // reopen either way, even when the import itself failed.
    state.db = None;
    let import_result = backup::import_workspace_bundle(Path::new(&in_path), &workspace);
    let conn = db::open_db(&workspace).map_err(|e| ServiceError::Store(e.to_string()))?;
    let summary = match import_result {
        Ok(summary) => summary,
        Err(e) => {
            state.db = Some(conn);
            return Err(ServiceError::Store(e.to_string()));
        }
    };

    helpers::log_operation(
        &conn,
        &principal.username,
        "backup_import",
        Some(&in_path),
        Some(&format!("imported workspace bundle from {}", in_path)),
        None,
    )?;
    log::info!("imported workspace bundle from {}", in_path);

    state.db = Some(conn);
    // The restored users table may not contain the current principal.
    state.session = None;

    Ok(json!({ "bundleFormatDetected": summary.bundle_format_detected }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        "backup.export" => handle_backup_export(state, req),
        "backup.import" => handle_backup_import(state, req),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
