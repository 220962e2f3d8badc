//! Mapping of core and cluster errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use shardcache_cluster::ClusterError;

/// Error type returned by HTTP handlers
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidArgument", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "KeyNotFound", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<shardcache_core::Error> for ApiError {
    fn from(e: shardcache_core::Error) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        if let ClusterError::Storage(inner) = e {
            return inner.into();
        }

        let code = match &e {
            ClusterError::EmptyRing => "EmptyRing",
            ClusterError::NodeNotFound(_) => "NodeNotFound",
            ClusterError::NodeUnreachable(_) | ClusterError::Transport(_) => "TransportFailure",
            ClusterError::CoordinationUnavailable(_) => "CoordinationUnavailable",
            _ => "InternalError",
        };
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, code, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("{}: {}", self.code, self.message);
        }
        let body = json!({ "error": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
