//! Server error types.

use crate::config::ConfigError;
use hyper::StatusCode;
use robotrpc_core::CoreError;
use robotrpc_protocol::{ProtocolError, RetVal};
use serde_json::{json, Value};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Protocol(e) if e.is_bad_request() => StatusCode::BAD_REQUEST,
            ServerError::Protocol(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Core(CoreError::UnknownCaller { .. }) => StatusCode::BAD_REQUEST,
            ServerError::Core(CoreError::InvalidDatumKey { .. }) => StatusCode::BAD_REQUEST,
            ServerError::Json(_) => StatusCode::BAD_REQUEST,
            ServerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short code used in error bodies and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Protocol(ProtocolError::UnknownFunction(_)) => "UNKNOWN_FUNCTION",
            ServerError::Protocol(ProtocolError::MissingCallerId) => "MISSING_CALLER_ID",
            ServerError::Protocol(ProtocolError::BodyTooLarge { .. }) => "BODY_TOO_LARGE",
            ServerError::Protocol(_) => "BAD_REQUEST",
            ServerError::Core(e) => e.error_code(),
            ServerError::Json(_) => "BAD_REQUEST",
            ServerError::ShuttingDown => "SHUTTING_DOWN",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Return code a plugin decoding the error body sees.
    pub fn ret_val(&self) -> RetVal {
        match self {
            ServerError::Protocol(e) => e.ret_val(),
            ServerError::Core(e) => e.ret_val(),
            ServerError::Json(_) => RetVal::DataFormatError,
            _ => RetVal::Failed,
        }
    }

    /// JSON error body. Carries a `RetVal` so plugins that ignore the HTTP
    /// status still decode a failure code.
    pub fn to_body(&self) -> Value {
        json!({
            "RetVal": self.ret_val(),
            "Error": self.error_code(),
            "Message": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = ServerError::from(ProtocolError::UnknownFunction("Fly".into()));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "UNKNOWN_FUNCTION");
        assert_eq!(err.ret_val(), RetVal::Failed);

        let err = ServerError::from(ProtocolError::BodyTooLarge { size: 2, max: 1 });
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let err = ServerError::from(CoreError::UnknownCaller {
            caller_id: "x".into(),
        });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "UNKNOWN_CALLER");

        assert_eq!(
            ServerError::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_body() {
        let err = ServerError::from(ProtocolError::MissingCallerId);
        let body = err.to_body();
        assert_eq!(body["RetVal"], RetVal::DataFormatError.code());
        assert_eq!(body["Error"], "MISSING_CALLER_ID");
        assert!(body["Message"].as_str().unwrap().contains("CallerID"));
    }
}
