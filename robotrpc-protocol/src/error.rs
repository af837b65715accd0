//! Protocol error types.

use crate::codes::RetVal;
use thiserror::Error;

/// Errors raised while encoding or decoding calls and results.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("invalid arguments for {func}: {reason}")]
    InvalidArgs { func: String, reason: String },

    #[error("missing CallerID")]
    MissingCallerId,

    #[error("expected a JSON object")]
    NotAnObject,

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// Return code a plugin sees for this failure.
    pub fn ret_val(&self) -> RetVal {
        match self {
            ProtocolError::UnknownFunction(_) => RetVal::Failed,
            _ => RetVal::DataFormatError,
        }
    }

    /// Whether the caller sent something the host could not accept, as
    /// opposed to the host producing a bad body.
    pub fn is_bad_request(&self) -> bool {
        !matches!(self, ProtocolError::BodyTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownFunction("Teleport".into());
        assert!(err.to_string().contains("Teleport"));

        let err = ProtocolError::InvalidArgs {
            func: "UpdateDatum".into(),
            reason: "missing field `Token`".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("UpdateDatum"));
        assert!(msg.contains("Token"));

        let err = ProtocolError::BodyTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        assert!(ProtocolError::MissingCallerId.to_string().contains("CallerID"));
    }

    #[test]
    fn test_ret_val_mapping() {
        assert_eq!(ProtocolError::NotAnObject.ret_val(), RetVal::DataFormatError);
        assert_eq!(ProtocolError::MissingCallerId.ret_val(), RetVal::DataFormatError);
        assert_eq!(
            ProtocolError::UnknownFunction("x".into()).ret_val(),
            RetVal::Failed
        );
    }

    #[test]
    fn test_bad_request() {
        assert!(ProtocolError::NotAnObject.is_bad_request());
        assert!(!ProtocolError::BodyTooLarge { size: 2, max: 1 }.is_bad_request());
    }
}
