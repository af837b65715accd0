//! Outgoing email.
//!
//! Like [`MemoryConnector`](crate::connector::MemoryConnector), the reference
//! host never talks to a mail server. [`Mailbox`] checks the sender and the
//! recipient and keeps what would have been sent.

use crate::directory::BotIdentity;
use crate::error::CoreError;
use crate::prompt::{anchored, EMAIL_PATTERN};
use parking_lot::Mutex;
use regex::Regex;
use robotrpc_protocol::RetVal;
use serde::Serialize;

/// Mails kept before the oldest are dropped.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 200;

/// A mail the robot sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMail {
    /// `Full Name <address>` of the robot.
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub html: bool,
}

pub struct Mailbox {
    address: Regex,
    sent: Mutex<Vec<OutgoingMail>>,
    capacity: usize,
}

impl Mailbox {
    pub fn new() -> Result<Self, CoreError> {
        let address = Regex::new(&anchored(EMAIL_PATTERN)).map_err(|source| {
            CoreError::InvalidMatcher {
                id: "Email".to_string(),
                source,
            }
        })?;
        Ok(Self {
            address,
            sent: Mutex::new(Vec::new()),
            capacity: DEFAULT_MAILBOX_CAPACITY,
        })
    }

    /// Sends a mail from the robot to `to`.
    ///
    /// The robot needs an address of its own (`NoBotEmail`); a recipient that
    /// is not an address is a delivery failure (`MailError`).
    pub fn send(
        &self,
        bot: &BotIdentity,
        to: &str,
        subject: &str,
        body: &str,
        html: bool,
    ) -> RetVal {
        if bot.email.is_empty() {
            tracing::warn!("Mail to {} not sent: robot has no email address", to);
            return RetVal::NoBotEmail;
        }
        if !self.address.is_match(to) {
            tracing::warn!("Mail not sent: invalid recipient {:?}", to);
            return RetVal::MailError;
        }
        let from = if bot.full_name.is_empty() {
            bot.email.clone()
        } else {
            format!("{} <{}>", bot.full_name, bot.email)
        };
        tracing::debug!("Mailing {:?} to {}", subject, to);
        let mut sent = self.sent.lock();
        if sent.len() >= self.capacity {
            sent.remove(0);
        }
        sent.push(OutgoingMail {
            from,
            to: to.trim().to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            html,
        });
        RetVal::Ok
    }

    /// Copy of the sent mail, oldest first.
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().clone()
    }
}
