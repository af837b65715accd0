//! Prompt/reply brokering.
//!
//! Plugins waiting for a reply register under the (protocol, user, channel,
//! thread) they expect it on. Only the first waiter for a key sends its
//! prompt; later ones queue. When a message arrives on the key the head
//! waiter gets it and every other waiter is told to retry.

use crate::error::CoreError;
use parking_lot::Mutex;
use regex::Regex;
use robotrpc_protocol::{Protocol, ReplyResponse, RetVal};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Default time a plugin waits for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(45);

/// Reply that aborts a prompt.
pub const CANCEL_REPLY: &str = "-";

/// Reply that asks the plugin to use its default.
pub const DEFAULT_REPLY: &str = "=";

/// Pattern of an email address, shared by the `Email` matcher and mail
/// delivery.
pub const EMAIL_PATTERN: &str = r"[-\w.]+@(?:[-\w]+\.)+[-\w]{2,4}";

const STOCK_MATCHERS: &[(&str, &str)] = &[
    ("Email", EMAIL_PATTERN),
    ("Domain", r"(?:[-\w]+\.)+[-\w]{2,4}"),
    ("OTP", r"\d{6}"),
    (
        "IPaddr",
        r"(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    ),
    ("SimpleString", r#"[-\w .,_'"?!]+"#),
    ("YesNo", r"(?i:yes|no|Y|N)"),
];

/// Anchors a reply pattern so the whole reply, modulo surrounding
/// whitespace, must match.
pub(crate) fn anchored(pattern: &str) -> String {
    format!(r"^\s*(?:{})\s*$", pattern)
}

/// Compiled reply matchers: the stock set plus per-task ones.
#[derive(Debug, Clone)]
pub struct Matchers {
    stock: HashMap<String, Regex>,
    tasks: HashMap<String, HashMap<String, Regex>>,
}

impl Matchers {
    pub fn new() -> Result<Self, CoreError> {
        let mut stock = HashMap::new();
        for (id, pattern) in STOCK_MATCHERS {
            stock.insert(id.to_string(), compile(id, pattern)?);
        }
        Ok(Self {
            stock,
            tasks: HashMap::new(),
        })
    }

    /// Adds the reply matchers configured for a task.
    pub fn add_task(
        &mut self,
        task: &str,
        matchers: &HashMap<String, String>,
    ) -> Result<(), CoreError> {
        let mut compiled = HashMap::new();
        for (id, pattern) in matchers {
            compiled.insert(id.clone(), compile(id, pattern)?);
        }
        self.tasks.insert(task.to_string(), compiled);
        Ok(())
    }

    /// Resolves a regex id. Ids starting with an uppercase letter are stock
    /// matchers; anything else is looked up in the task's own matchers.
    pub fn resolve(&self, task: &str, id: &str) -> Option<&Regex> {
        if id.starts_with(|c: char| c.is_ascii_uppercase()) {
            return self.stock.get(id);
        }
        self.tasks.get(task).and_then(|m| m.get(id))
    }
}

fn compile(id: &str, pattern: &str) -> Result<Regex, CoreError> {
    Regex::new(&anchored(pattern)).map_err(|source| CoreError::InvalidMatcher {
        id: id.to_string(),
        source,
    })
}

/// Where a reply is expected from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaiterKey {
    pub protocol: Protocol,
    pub user: String,
    pub channel: String,
    pub thread: String,
}

#[derive(Debug)]
enum Outcome {
    Reply(String),
    Retry,
    Interrupted,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Outcome>,
}

/// A registered waiter.
pub struct Registration {
    key: WaiterKey,
    id: u64,
    rx: oneshot::Receiver<Outcome>,
    /// Whether this waiter must send the prompt.
    pub first: bool,
}

#[derive(Default)]
struct BrokerState {
    waiters: HashMap<WaiterKey, Vec<Waiter>>,
    stopping: bool,
}

/// Routes incoming messages to waiting prompts.
pub struct PromptBroker {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    reply_timeout: Duration,
}

impl PromptBroker {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            next_id: AtomicU64::new(1),
            reply_timeout,
        }
    }

    /// Queues a waiter on `key`. After shutdown the registration is
    /// interrupted at once.
    pub fn register(&self, key: WaiterKey) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.stopping {
            let _ = tx.send(Outcome::Interrupted);
            return Registration {
                key,
                id,
                rx,
                first: false,
            };
        }
        let list = state.waiters.entry(key.clone()).or_default();
        let first = list.is_empty();
        list.push(Waiter { id, tx });
        Registration { key, id, rx, first }
    }

    /// Waits for the reply to a registration and classifies it.
    pub async fn wait(&self, reg: Registration, matcher: &Regex) -> ReplyResponse {
        let Registration { key, id, mut rx, .. } = reg;
        let outcome = match tokio::time::timeout(self.reply_timeout, &mut rx).await {
            Ok(received) => received.ok(),
            Err(_) => return self.timed_out(&key, id, rx, matcher),
        };
        finish(outcome, matcher)
    }

    /// Settles a wait whose timer fired. If an incoming message already took
    /// the waiter list, its outcome is sitting in `rx` and wins.
    fn timed_out(
        &self,
        key: &WaiterKey,
        id: u64,
        mut rx: oneshot::Receiver<Outcome>,
        matcher: &Regex,
    ) -> ReplyResponse {
        if !self.release(key, id) {
            if let Ok(outcome) = rx.try_recv() {
                return finish(Some(outcome), matcher);
            }
        }
        tracing::warn!(
            "Timed out waiting for reply from {} in {:?}",
            key.user,
            key.channel
        );
        ReplyResponse::failed(RetVal::TimeoutExpired)
    }

    /// Removes all waiters on `key` on behalf of waiter `id`, telling the
    /// others to retry. Used when the prompt times out or cannot be sent.
    /// Returns false when the waiter was no longer registered.
    pub fn release(&self, key: &WaiterKey, id: u64) -> bool {
        let list = {
            let mut state = self.state.lock();
            let ours = state
                .waiters
                .get(key)
                .is_some_and(|list| list.iter().any(|w| w.id == id));
            if !ours {
                return false;
            }
            state.waiters.remove(key)
        };
        for waiter in list.into_iter().flatten() {
            if waiter.id != id {
                let _ = waiter.tx.send(Outcome::Retry);
            }
        }
        true
    }

    /// Abandons a registration whose prompt could not be sent.
    pub fn abandon(&self, reg: Registration) {
        self.release(&reg.key, reg.id);
    }

    /// Delivers an incoming message. Returns whether anyone was waiting.
    pub fn deliver(&self, key: &WaiterKey, message: &str) -> bool {
        let Some(list) = self.state.lock().waiters.remove(key) else {
            return false;
        };
        let mut list = list.into_iter();
        let mut delivered = false;
        if let Some(head) = list.next() {
            delivered = head.tx.send(Outcome::Reply(message.to_string())).is_ok();
        }
        for waiter in list {
            let _ = waiter.tx.send(Outcome::Retry);
        }
        delivered
    }

    /// Interrupts every waiter and refuses new ones.
    pub fn shutdown(&self) {
        let all: Vec<_> = {
            let mut state = self.state.lock();
            state.stopping = true;
            state.waiters.drain().collect()
        };
        for (_, list) in all {
            for waiter in list {
                let _ = waiter.tx.send(Outcome::Interrupted);
            }
        }
    }

    /// Number of plugins waiting for replies.
    pub fn active(&self) -> usize {
        self.state.lock().waiters.values().map(Vec::len).sum()
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
}

impl Default for PromptBroker {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_TIMEOUT)
    }
}

fn finish(outcome: Option<Outcome>, matcher: &Regex) -> ReplyResponse {
    match outcome {
        Some(Outcome::Reply(reply)) => classify(&reply, matcher),
        Some(Outcome::Retry) => ReplyResponse::failed(RetVal::RetryPrompt),
        Some(Outcome::Interrupted) | None => ReplyResponse::failed(RetVal::Interrupted),
    }
}

fn classify(reply: &str, matcher: &Regex) -> ReplyResponse {
    match reply.trim() {
        CANCEL_REPLY => ReplyResponse::failed(RetVal::Interrupted),
        DEFAULT_REPLY => ReplyResponse::failed(RetVal::UseDefaultValue),
        _ if matcher.is_match(reply) => ReplyResponse::matched(reply.trim()),
        _ => ReplyResponse::failed(RetVal::ReplyNotMatched),
    }
}
