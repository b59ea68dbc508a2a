use serde_json::json;
use thiserror::Error;

/// Business-layer failure taxonomy. Every variant renders to a wire
/// error with a stable code; nothing is swallowed on the way out.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Permission(String),
    #[error("invalid username or password")]
    AuthFailed,
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict {
        message: String,
        details: Option<serde_json::Value>,
    },
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("{0}")]
    Store(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "bad_params",
            ServiceError::Permission(_) => "permission_denied",
            ServiceError::AuthFailed => "auth_failed",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict { .. } => "conflict",
            ServiceError::NoWorkspace => "no_workspace",
            ServiceError::Store(_) => "db_failed",
        }
    }

    pub fn response(&self, id: &str) -> serde_json::Value {
        let details = match self {
            ServiceError::Conflict { details, .. } => details.clone(),
            _ => None,
        };
        err(id, self.code(), self.to_string(), details)
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ServiceError::Conflict {
                    message: e.to_string(),
                    details: None,
                }
            }
            _ => ServiceError::Store(e.to_string()),
        }
    }
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}
