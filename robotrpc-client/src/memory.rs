//! Long-term memory handles.

use crate::error::ClientError;
use robotrpc_protocol::{CheckoutResponse, RetVal};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A checked-out datum.
///
/// A read-write checkout holds the lock token. Passing the memory to
/// [`crate::Robot::update_datum`] or [`crate::Robot::checkin_datum`] consumes
/// it, so a token cannot be presented twice.
#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    key: String,
    token: String,
    exists: bool,
    datum: Value,
    ret_val: RetVal,
}

impl Memory {
    pub(crate) fn from_checkout(key: &str, response: CheckoutResponse) -> Self {
        Self {
            key: key.to_string(),
            token: response.lock_token,
            exists: response.exists,
            datum: response.datum,
            ret_val: response.ret_val,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lock token; empty for read-only checkouts.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_locked(&self) -> bool {
        !self.token.is_empty()
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn ret_val(&self) -> RetVal {
        self.ret_val
    }

    pub fn datum(&self) -> &Value {
        &self.datum
    }

    pub fn set_datum(&mut self, datum: Value) {
        self.datum = datum;
    }

    /// Decodes the datum, `None` when the key has no value yet.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, ClientError> {
        if self.datum.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(self.datum.clone())?))
    }

    /// Replaces the datum with a serialized value.
    pub fn store<T: Serialize>(&mut self, value: &T) -> Result<(), ClientError> {
        self.datum = serde_json::to_value(value)?;
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (String, String, Value) {
        (self.key, self.token, self.datum)
    }
}
