//! # robotrpc-core
//!
//! In-memory reference host for the robot RPC protocol.
//!
//! This crate provides:
//! - Long-term memory with token-based checkout locking
//! - Short-term, scope-bound memories
//! - Prompt/reply brokering with retry and timeout classification
//! - Caller registry resolving identity from a caller id
//! - Task registry, pipeline bookkeeping and exclusive tags
//! - Outgoing email kept in an in-memory mailbox

pub mod brain;
pub mod caller;
pub mod connector;
pub mod directory;
pub mod engine;
pub mod error;
pub mod mail;
pub mod pipeline;
pub mod prompt;
pub mod shortterm;

pub use brain::{Brain, Checkout};
pub use caller::{CallerContext, CallerRegistry, CallerSpec};
pub use connector::{Connector, MemoryConnector, OutgoingMessage};
pub use directory::{BotIdentity, Directory, DirectoryConfig, UserRecord};
pub use engine::{Host, HostConfig, HostStats, DEFAULT_PIPELINE_IDLE_TIMEOUT};
pub use error::CoreError;
pub use mail::{Mailbox, OutgoingMail};
pub use pipeline::{ExclusiveDenial, PipelineState, Stage, TaskKind, TaskRegistry, TaskSpec};
pub use prompt::{Matchers, PromptBroker, WaiterKey};
pub use shortterm::{MemoryScope, ShortTermMemory};
