use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use serde_json::json;

pub type RelayResult<T> = Result<T, RelayError>;

/// Failure taxonomy for the relay core.
///
/// `InvalidInput` and the referential errors are caller mistakes and are
/// never retried. `StoreUnavailable` is transient infrastructure failure and
/// is safe to retry with backoff.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("user {0} does not exist")]
    UnknownUser(i64),

    #[error("room {0:?} does not exist")]
    UnknownRoom(String),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    /// Machine-readable kind, carried in error payloads on both ingresses.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidInput(_) => "invalid_input",
            RelayError::UnknownUser(_) => "unknown_user",
            RelayError::UnknownRoom(_) => "unknown_room",
            RelayError::InvalidCredentials => "invalid_credentials",
            RelayError::StoreUnavailable(_) => "store_unavailable",
            RelayError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RelayError::UnknownUser(_) | RelayError::UnknownRoom(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            RelayError::StoreUnavailable(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => RelayError::StoreUnavailable(err.to_string()),
            sqlx::Error::Database(db) if is_transient_sqlite(db.code().as_deref()) => {
                RelayError::StoreUnavailable(db.to_string())
            }
            other => RelayError::Internal(other.into()),
        }
    }
}

/// SQLITE_BUSY and SQLITE_LOCKED (plus their extended codes) signal lock
/// contention, not a malformed statement.
fn is_transient_sqlite(code: Option<&str>) -> bool {
    matches!(code, Some("5" | "6" | "261" | "262" | "517"))
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{self}");
        }
        (
            status,
            Json(json!({ "error": self.kind(), "detail": self.to_string() })),
        )
            .into_response()
    }
}
