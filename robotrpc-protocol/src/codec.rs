//! Encoder and decoder for call envelopes and results.

use crate::error::ProtocolError;
use crate::message::{decode_result, CallEnvelope, FuncCall, RawEnvelope};
use crate::MAX_BODY_SIZE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Encodes calls and results into JSON bodies.
pub struct Encoder;

impl Encoder {
    /// Encodes a call envelope.
    pub fn encode_call(envelope: &CallEnvelope) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    /// Encodes a result record.
    pub fn encode_response<T: Serialize>(response: &T) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(response)?)
    }
}

/// Decodes JSON bodies into calls and results.
pub struct Decoder {
    max_body: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_body: MAX_BODY_SIZE,
        }
    }

    /// Sets the largest body this decoder will accept.
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    fn check_size(&self, body: &[u8]) -> Result<(), ProtocolError> {
        if body.len() > self.max_body {
            return Err(ProtocolError::BodyTooLarge {
                size: body.len(),
                max: self.max_body,
            });
        }
        Ok(())
    }

    /// Decodes a call envelope as posted by a plugin.
    ///
    /// The caller id is required; a missing or null `FuncArgs` reads as `{}`.
    pub fn decode_call(&self, body: &[u8]) -> Result<CallEnvelope, ProtocolError> {
        self.check_size(body)?;
        let value: Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        let raw: RawEnvelope = serde_json::from_value(value)?;
        if raw.caller_id.trim().is_empty() {
            return Err(ProtocolError::MissingCallerId);
        }
        let call = FuncCall::from_parts(&raw.func_name, raw.func_args)?;
        Ok(CallEnvelope {
            caller_id: raw.caller_id,
            format: raw.format,
            call,
        })
    }

    /// Decodes a result record from a host response body.
    pub fn decode_response<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, ProtocolError> {
        self.check_size(body)?;
        let value: Value = serde_json::from_slice(body)?;
        decode_result(value)
    }

    pub fn max_body(&self) -> usize {
        self.max_body
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::RetVal;
    use crate::message::{
        CheckoutResponse, FuncName, ReplyResponse, RetValResponse, UpdateArgs,
    };
    use serde_json::json;

    #[test]
    fn test_encode_decode_call() {
        let env = CallEnvelope::new(
            "c-1",
            FuncCall::UpdateDatum(UpdateArgs {
                key: "ledger".into(),
                token: "t-1".into(),
                datum: json!({"balance": 10, "note": "caf\u{e9} \u{1}"}),
            }),
        );
        let body = Encoder::encode_call(&env).unwrap();
        let decoded = Decoder::new().decode_call(&body).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_call_without_args() {
        let body = br#"{"FuncName":"CheckAdmin","CallerID":"c-1"}"#;
        let env = Decoder::new().decode_call(body).unwrap();
        assert_eq!(env.call.func_name(), FuncName::CheckAdmin);
        assert_eq!(env.format, "");
    }

    #[test]
    fn test_decode_call_errors() {
        let decoder = Decoder::new();
        assert!(matches!(
            decoder.decode_call(b"not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            decoder.decode_call(b"[]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            decoder.decode_call(br#"{"FuncName":"CheckAdmin","FuncArgs":{}}"#),
            Err(ProtocolError::MissingCallerId)
        ));
        assert!(matches!(
            decoder.decode_call(br#"{"FuncName":"Fly","CallerID":"c","FuncArgs":{}}"#),
            Err(ProtocolError::UnknownFunction(_))
        ));
        assert!(matches!(
            decoder.decode_call(br#"{"FuncName":"Recall","CallerID":"c","FuncArgs":{"Key":1}}"#),
            Err(ProtocolError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn test_body_limit() {
        let decoder = Decoder::new().with_max_body(16);
        let err = decoder
            .decode_call(br#"{"FuncName":"CheckAdmin","CallerID":"c-1"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BodyTooLarge { max: 16, .. }));
    }

    #[test]
    fn test_decode_response() {
        let decoder = Decoder::new();
        let r: ReplyResponse = decoder
            .decode_response(br#"{"Reply":"yes","RetVal":0}"#)
            .unwrap();
        assert_eq!(r.reply, "yes");
        assert_eq!(r.ret_val, RetVal::Ok);

        let r: CheckoutResponse = decoder
            .decode_response(br#"{"LockToken":"abc","Exists":true,"Datum":[1,2],"RetVal":0}"#)
            .unwrap();
        assert_eq!(r.lock_token, "abc");
        assert_eq!(r.datum, json!([1, 2]));

        let r: RetValResponse = decoder.decode_response(b"{}").unwrap();
        assert_eq!(r.ret_val, RetVal::Failed);

        assert!(decoder.decode_response::<RetValResponse>(b"42").is_err());
        assert!(decoder.decode_response::<RetValResponse>(b"").is_err());
    }

    #[test]
    fn test_encode_response() {
        let body = Encoder::encode_response(&RetValResponse::new(RetVal::DatumLockExpired)).unwrap();
        assert_eq!(body, br#"{"RetVal":7}"#);
    }
}
