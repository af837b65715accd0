//! Outgoing message delivery.
//!
//! The reference host has no real chat connection; [`MemoryConnector`]
//! records what would have been sent so tests and the CLI can inspect it.

use crate::directory::Directory;
use parking_lot::Mutex;
use robotrpc_protocol::{MessageFormat, Protocol, RetVal};
use serde::Serialize;

/// A message the robot sends. An empty `channel` is a direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMessage {
    pub protocol: Protocol,
    pub user: String,
    pub channel: String,
    pub thread: String,
    pub message: String,
    pub format: MessageFormat,
}

impl OutgoingMessage {
    pub fn is_direct(&self) -> bool {
        self.channel.is_empty()
    }
}

/// Delivers outgoing messages to a chat protocol.
pub trait Connector: Send + Sync {
    /// Sends a message, returning `Ok` or the reason it could not be sent.
    fn send(&self, message: OutgoingMessage) -> RetVal;

    /// Protocol this connector speaks.
    fn protocol(&self) -> Protocol;
}

/// Connector that validates recipients against the directory and keeps an
/// outbox instead of talking to a chat service.
pub struct MemoryConnector {
    directory: Directory,
    outbox: Mutex<Vec<OutgoingMessage>>,
    capacity: usize,
}

/// Messages kept before the oldest are dropped.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1000;

impl MemoryConnector {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            outbox: Mutex::new(Vec::new()),
            capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }

    /// Copy of the outbox, oldest first.
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.outbox.lock().clone()
    }

}

impl Connector for MemoryConnector {
    fn send(&self, message: OutgoingMessage) -> RetVal {
        if message.protocol != self.protocol() {
            return RetVal::FailedMessageSend;
        }
        if message.is_direct() {
            if !self.directory.has_user(&message.user) {
                return RetVal::UserNotFound;
            }
        } else {
            if !self.directory.has_channel(&message.channel) {
                return RetVal::ChannelNotFound;
            }
            if !message.user.is_empty() && !self.directory.has_user(&message.user) {
                return RetVal::UserNotFound;
            }
        }
        tracing::debug!(
            "Sending to user {:?} channel {:?} thread {:?}: {}",
            message.user,
            message.channel,
            message.thread,
            message.message
        );
        let mut outbox = self.outbox.lock();
        if outbox.len() >= self.capacity {
            outbox.remove(0);
        }
        outbox.push(message);
        RetVal::Ok
    }

    fn protocol(&self) -> Protocol {
        self.directory.bot().protocol()
    }
}
