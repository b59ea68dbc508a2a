use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::Principal;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One process serves one session: the workspace/database handle plus
/// the principal bound by auth.login. Concurrent sessions run separate
/// daemon processes and therefore never share permission state.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub session: Option<Principal>,
}

impl AppState {
    pub fn new() -> Self {
        AppState {
            workspace: None,
            db: None,
            session: None,
        }
    }
}
