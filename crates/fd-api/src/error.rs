use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fd_auth::UserError;
use fd_registry::{DispatchError, NodeId};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("{0}")]
    BadRequest(String),

    /// Anything that went wrong reaching or running a task on a node.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    User(#[from] UserError),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::User(e) => match e {
                UserError::InvalidName | UserError::WeakPassword => StatusCode::BAD_REQUEST,
                UserError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                UserError::SignupClosed => StatusCode::FORBIDDEN,
                UserError::NotFound(_) => StatusCode::NOT_FOUND,
                UserError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{self}");
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_dispatch_errors_are_unprocessable() {
        let offline = ApiError::from(DispatchError::HostOffline(NodeId(7)));
        assert_eq!(offline.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let timeout = ApiError::from(DispatchError::TaskTimeout {
            task_id: "t".into(),
            after: Duration::from_secs(30),
        });
        assert_eq!(timeout.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ApiError::NodeNotFound(NodeId(3)).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_user_error_statuses() {
        let status = |e: UserError| ApiError::from(e).status();
        assert_eq!(status(UserError::InvalidCredentials), StatusCode::UNAUTHORIZED);
        assert_eq!(status(UserError::SignupClosed), StatusCode::FORBIDDEN);
        assert_eq!(status(UserError::WeakPassword), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_failed_task_message_is_passed_through() {
        let err = ApiError::from(DispatchError::TaskFailed("no such node: abc".into()));
        assert_eq!(err.to_string(), "no such node: abc");
    }
}
