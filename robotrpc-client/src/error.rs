//! Client error types.

use robotrpc_protocol::{ProtocolError, RetVal};
use std::time::Duration;
use thiserror::Error;

/// Failure delivering a request or receiving its response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid host URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection refused by {addr}")]
    Refused {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("host answered HTTP {status}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("no scripted response left")]
    Exhausted,
}

impl TransportError {
    pub fn is_refused(&self) -> bool {
        matches!(self, TransportError::Refused { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("data format error: {0}")]
    DataFormat(#[from] ProtocolError),

    #[error("missing environment: {0}")]
    Environment(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Return code a plugin should treat this failure as.
    pub fn ret_val(&self) -> RetVal {
        match self {
            ClientError::DataFormat(_) => RetVal::DataFormatError,
            _ => RetVal::Failed,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::DataFormat(ProtocolError::Json(err))
    }
}
