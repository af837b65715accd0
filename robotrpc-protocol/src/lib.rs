//! # robotrpc-protocol
//!
//! Wire protocol for the robot RPC interface between plugins and the host.
//!
//! This crate provides:
//! - Return code enums with stable integer codes and reverse lookup
//! - The closed set of robot functions with typed arguments and results
//! - Call envelope encoding and forgiving response decoding
//! - Protocol constants

pub mod codec;
pub mod codes;
pub mod error;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use codes::{LogLevel, MessageFormat, Protocol, RetVal, TaskRetVal, UnknownName};
pub use error::ProtocolError;
pub use message::{
    AttributeResponse, BoolResponse, CallEnvelope, CheckoutResponse, FinishRequest,
    FinishResponse, FuncCall, FuncName, IncomingMessage, IncomingResponse, ReplyResponse,
    ResponseKind, RetValResponse, StrResponse, TaskConfigResponse,
};

/// Path the host serves robot calls on.
pub const JSON_PATH: &str = "/json";

/// Path the reference host accepts injected user messages on.
pub const INCOMING_PATH: &str = "/incoming";

/// Path the reference host ends a caller's pipeline on.
pub const FINISH_PATH: &str = "/finish";

/// Header duplicating the envelope's `CallerID`.
pub const CALLER_ID_HEADER: &str = "X-Caller-ID";

/// Default port for the reference host.
pub const DEFAULT_PORT: u16 = 8880;

/// Maximum request body size (16 MiB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;
