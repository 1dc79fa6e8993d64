//! Unified error types
//!
//! One error enum for the whole engine: request faults are rendered as HTTP
//! responses, lifecycle faults are returned to the embedding shell.

use std::io;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Engine-level error type
#[derive(Error, Debug)]
pub enum ShareError {
    /// 路径越界（目录穿越）
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// 资源不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 客户端输入不合法
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// 命名冲突
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 未预期的 IO / 内部错误
    #[error("Server error: {0}")]
    ServerError(String),

    /// 共享目录无效
    #[error("Invalid directory: {0}")]
    InvalidDirectory(String),

    /// 共享目录不可写
    #[error("No write access to directory: {0}")]
    NoWriteAccess(String),

    /// 端口被占用
    #[error("Port {0} is already in use")]
    PortInUse(u16),

    /// 其他绑定错误
    #[error("Failed to start server: {0}")]
    BindError(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,
}

/// Error detail attached to error responses so the access log can report it.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

/// Serializable error response for the embedding shell
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for client-side handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl ShareError {
    /// Create a server error
    pub fn server(msg: impl Into<String>) -> Self {
        Self::ServerError(msg.into())
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::ServerError(_) => "SERVER_ERROR",
            Self::InvalidDirectory(_) => "INVALID_DIRECTORY",
            Self::NoWriteAccess(_) => "NO_WRITE_ACCESS",
            Self::PortInUse(_) => "PORT_IN_USE",
            Self::BindError(_) => "BIND_ERROR",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
        }
    }

    /// 获取对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<io::Error> for ShareError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                Self::NotFound(err.to_string())
            }
            io::ErrorKind::PermissionDenied => Self::AccessDenied(err.to_string()),
            _ => Self::ServerError(err.to_string()),
        }
    }
}

impl From<ShareError> for ErrorResponse {
    fn from(err: ShareError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl Serialize for ShareError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        }
        .serialize(serializer)
    }
}

impl IntoResponse for ShareError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = self.to_string();
        let reason = status.canonical_reason().unwrap_or("Error");
        let body = format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"UTF-8\"><title>{code} {reason}</title></head>\n<body>\n<h1>{code} {reason}</h1>\n<p>{message}</p>\n<p><a href=\"/\">Back to home</a></p>\n</body>\n</html>\n",
            code = status.as_u16(),
            reason = reason,
            message = html_escape::encode_text(&detail),
        );

        let mut response = (
            status,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response();
        response.extensions_mut().insert(ErrorDetail(detail));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShareError::PortInUse(8000);
        assert_eq!(err.to_string(), "Port 8000 is already in use");

        let err = ShareError::AlreadyRunning;
        assert_eq!(err.to_string(), "Server already running");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ShareError::AccessDenied("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ShareError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ShareError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ShareError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ShareError::server("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let err: ShareError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, ShareError::NotFound(_)));

        let err: ShareError = io::Error::new(io::ErrorKind::NotADirectory, "a.txt/x").into();
        assert!(matches!(err, ShareError::NotFound(_)));

        let err: ShareError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(err, ShareError::AccessDenied(_)));

        let err: ShareError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, ShareError::ServerError(_)));
    }

    #[test]
    fn test_error_serialization() {
        let err = ShareError::NotRunning;
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("NOT_RUNNING"));
        assert!(json.contains("Server not running"));
    }

    #[test]
    fn test_into_response_carries_detail() {
        let response = ShareError::NotFound("a.txt".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let detail = response.extensions().get::<ErrorDetail>().unwrap();
        assert_eq!(detail.0, "Not found: a.txt");
    }
}
