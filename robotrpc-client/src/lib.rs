//! # robotrpc-client
//!
//! Client library for plugins and jobs talking to a robot host.
//!
//! This crate provides:
//! - `RobotContext`, the caller identity read once from the environment
//! - A `Transport` seam with an HTTP implementation
//! - The `Robot` API covering every host function plus the message helpers
//! - Datum checkout/update/checkin with ownership-enforced lock tokens
//! - Prompting with bounded `RetryPrompt` handling
//! - Plugin argument dispatch

pub mod context;
pub mod error;
pub mod memory;
pub mod plugin;
pub mod prompt;
pub mod robot;
pub mod transport;

pub use context::{Message, RobotContext};
pub use error::{ClientError, TransportError};
pub use memory::Memory;
pub use plugin::{Dispatch, Plugin};
pub use prompt::{PromptFlow, PromptStep, MAX_PROMPT_ATTEMPTS};
pub use robot::Robot;
pub use transport::{
    HttpTransport, ScriptedTransport, Transport, TransportConfig, TransportRequest,
};

pub use robotrpc_protocol::{
    AttributeResponse as Attribute, LogLevel, MessageFormat, Protocol, ReplyResponse as Reply,
    RetVal, TaskRetVal,
};
