//! Long-term memory with token-based checkout locking.
//!
//! A read-write checkout hands out a token that must be presented on update.
//! Only one live token exists per key; a second read-write checkout waits
//! until the current lock is released or expires. Waiting writers are served
//! in arrival order.

use crate::error::CoreError;
use parking_lot::Mutex;
use robotrpc_protocol::RetVal;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default lifetime of a read-write checkout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkout {
    /// Lock token, empty for read-only checkouts.
    pub token: String,
    pub exists: bool,
    /// Stored value, null when the key does not exist.
    pub datum: Value,
}

#[derive(Debug)]
struct DatumLock {
    token: String,
    expires: Instant,
}

#[derive(Debug, Default)]
struct BrainState {
    data: HashMap<String, Value>,
    locks: HashMap<String, DatumLock>,
    /// Read-write checkouts waiting per key, oldest first.
    queues: HashMap<String, VecDeque<u64>>,
    next_ticket: u64,
}

impl BrainState {
    fn enqueue(&mut self, key: &str) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.queues
            .entry(key.to_string())
            .or_default()
            .push_back(ticket);
        ticket
    }

    fn dequeue(&mut self, key: &str, ticket: u64) {
        if let Some(queue) = self.queues.get_mut(key) {
            queue.retain(|t| *t != ticket);
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    /// Whether a checkout holding `ticket` (or none) is next in line.
    fn is_next(&self, key: &str, ticket: Option<u64>) -> bool {
        match self.queues.get(key).and_then(|q| q.front()) {
            None => true,
            Some(front) => ticket == Some(*front),
        }
    }

    /// Returns the expiry of the live lock on `key`, dropping it if stale.
    fn live_lock(&mut self, key: &str, now: Instant) -> Option<Instant> {
        match self.locks.get(key) {
            Some(lock) if now < lock.expires => Some(lock.expires),
            Some(_) => {
                self.locks.remove(key);
                None
            }
            None => None,
        }
    }
}

/// Place in a key's writer queue. Leaves the queue when dropped, so an
/// abandoned checkout never blocks the writers behind it.
struct QueueTicket<'a> {
    brain: &'a Brain,
    key: &'a str,
    id: u64,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.brain.state.lock().dequeue(self.key, self.id);
        self.brain.released.notify_waiters();
    }
}

enum Step {
    Granted(Checkout),
    Wait(Option<Instant>),
}

/// In-memory long-term store.
pub struct Brain {
    state: Mutex<BrainState>,
    released: Notify,
    lock_timeout: Duration,
}

impl Brain {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BrainState::default()),
            released: Notify::new(),
            lock_timeout,
        }
    }

    /// Validates a caller-supplied key.
    ///
    /// Keys are word characters plus `-` and `.`; `:` is reserved for the
    /// namespace separator.
    pub fn validate_key(key: &str) -> Result<(), CoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if valid {
            Ok(())
        } else {
            Err(CoreError::InvalidDatumKey {
                key: key.to_string(),
            })
        }
    }

    /// Builds the storage key for a caller key within a namespace.
    pub fn namespaced(namespace: &str, key: &str) -> Result<String, CoreError> {
        Self::validate_key(key)?;
        Ok(format!("{}:{}", namespace, key))
    }

    /// Checks out a datum. A read-write checkout waits its turn behind
    /// earlier writers and for any live lock on the key to be released or to
    /// expire, then takes the lock.
    pub async fn checkout(&self, key: &str, rw: bool) -> Checkout {
        let mut ticket: Option<QueueTicket<'_>> = None;
        loop {
            let released = self.released.notified();
            let step = {
                let mut state = self.state.lock();
                let datum = state.data.get(key).cloned();
                if !rw {
                    return Checkout {
                        token: String::new(),
                        exists: datum.is_some(),
                        datum: datum.unwrap_or(Value::Null),
                    };
                }
                let now = Instant::now();
                let live = state.live_lock(key, now);
                if live.is_none() && state.is_next(key, ticket.as_ref().map(|t| t.id)) {
                    let token = uuid::Uuid::new_v4().simple().to_string();
                    state.locks.insert(
                        key.to_string(),
                        DatumLock {
                            token: token.clone(),
                            expires: now + self.lock_timeout,
                        },
                    );
                    Step::Granted(Checkout {
                        token,
                        exists: datum.is_some(),
                        datum: datum.unwrap_or(Value::Null),
                    })
                } else {
                    if ticket.is_none() {
                        let id = state.enqueue(key);
                        ticket = Some(QueueTicket {
                            brain: self,
                            key,
                            id,
                        });
                    }
                    Step::Wait(live)
                }
            };
            match step {
                Step::Granted(checkout) => {
                    // Leaving the queue wakes the next writer so it can wait
                    // on the new lock's expiry.
                    drop(ticket);
                    tracing::debug!("Datum {} checked out rw", key);
                    return checkout;
                }
                Step::Wait(Some(expires)) => {
                    tracing::debug!("Datum {} is locked, waiting", key);
                    let _ = tokio::time::timeout_at(expires, released).await;
                }
                Step::Wait(None) => released.await,
            }
        }
    }

    /// Replaces a datum and releases its lock, if `token` is the live token.
    pub fn update(&self, key: &str, token: &str, datum: Value) -> RetVal {
        let mut state = self.state.lock();
        let now = Instant::now();
        let valid = state.live_lock(key, now).is_some()
            && !token.is_empty()
            && state.locks.get(key).is_some_and(|lock| lock.token == token);
        if !valid {
            tracing::warn!("Update of {} rejected: lock token expired or invalid", key);
            return RetVal::DatumLockExpired;
        }
        state.locks.remove(key);
        state.data.insert(key.to_string(), datum);
        drop(state);
        self.released.notify_waiters();
        RetVal::Ok
    }

    /// Releases a lock without touching the value. Always `Ok`; a token that
    /// no longer matches is ignored.
    pub fn checkin(&self, key: &str, token: &str) -> RetVal {
        let mut state = self.state.lock();
        let held = matches!(state.locks.get(key), Some(lock) if !token.is_empty() && lock.token == token);
        if held {
            state.locks.remove(key);
            drop(state);
            self.released.notify_waiters();
        }
        RetVal::Ok
    }

    /// Drops expired locks, waking any waiters. Returns how many were dropped.
    pub fn expire_locks(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let before = state.locks.len();
        state.locks.retain(|_, lock| now < lock.expires);
        let expired = before - state.locks.len();
        drop(state);
        if expired > 0 {
            self.released.notify_waiters();
        }
        expired
    }

    /// Number of live read-write locks.
    pub fn locks_active(&self) -> usize {
        let state = self.state.lock();
        let now = Instant::now();
        state.locks.values().filter(|l| now < l.expires).count()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

impl Default for Brain {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_checkout_missing_key() {
        let brain = Brain::default();
        let co = brain.checkout("ns:ledger", false).await;
        assert!(!co.exists);
        assert_eq!(co.datum, Value::Null);
        assert!(co.token.is_empty());
    }

    #[tokio::test]
    async fn test_checkout_update_creates_key() {
        let brain = Brain::default();
        let co = brain.checkout("ns:ledger", true).await;
        assert!(!co.exists);
        assert!(!co.token.is_empty());

        assert_eq!(brain.update("ns:ledger", &co.token, json!({"n": 1})), RetVal::Ok);

        let co = brain.checkout("ns:ledger", false).await;
        assert!(co.exists);
        assert_eq!(co.datum, json!({"n": 1}));
        assert_eq!(brain.locks_active(), 0);
    }

    #[tokio::test]
    async fn test_stale_token_rejected() {
        let brain = Brain::new(Duration::from_millis(100));
        let first = brain.checkout("ns:k", true).await;
        // Second writer waits for the first lock to expire, then wins.
        let second = brain.checkout("ns:k", true).await;
        assert_ne!(first.token, second.token);
        assert_eq!(brain.update("ns:k", &second.token, json!(2)), RetVal::Ok);
        assert_eq!(
            brain.update("ns:k", &first.token, json!(1)),
            RetVal::DatumLockExpired
        );
        assert_eq!(brain.checkout("ns:k", false).await.datum, json!(2));
    }

    #[tokio::test]
    async fn test_token_reuse_rejected() {
        let brain = Brain::default();
        let co = brain.checkout("ns:k", true).await;
        assert_eq!(brain.update("ns:k", &co.token, json!(1)), RetVal::Ok);
        assert_eq!(brain.update("ns:k", &co.token, json!(2)), RetVal::DatumLockExpired);
    }

    #[tokio::test]
    async fn test_empty_and_unknown_tokens() {
        let brain = Brain::default();
        assert_eq!(brain.update("ns:k", "", json!(1)), RetVal::DatumLockExpired);
        let _co = brain.checkout("ns:k", true).await;
        assert_eq!(brain.update("ns:k", "", json!(1)), RetVal::DatumLockExpired);
        assert_eq!(brain.update("ns:k", "bogus", json!(1)), RetVal::DatumLockExpired);
    }

    #[tokio::test]
    async fn test_expired_lock_rejects_update() {
        let brain = Brain::new(Duration::from_millis(20));
        let co = brain.checkout("ns:k", true).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(brain.update("ns:k", &co.token, json!(1)), RetVal::DatumLockExpired);
        assert!(brain.is_empty());
    }

    #[tokio::test]
    async fn test_checkin_wakes_waiter() {
        let brain = Arc::new(Brain::new(Duration::from_secs(30)));
        let first = brain.checkout("ns:k", true).await;

        let waiter = {
            let brain = brain.clone();
            tokio::spawn(async move { brain.checkout("ns:k", true).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert_eq!(brain.checkin("ns:k", &first.token), RetVal::Ok);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be granted after checkin")
            .unwrap();
        assert_ne!(second.token, first.token);
    }

    #[tokio::test]
    async fn test_rw_waiters_served_in_arrival_order() {
        let brain = Arc::new(Brain::new(Duration::from_secs(30)));
        let held = brain.checkout("ns:k", true).await;

        let spawn_writer = |brain: Arc<Brain>| {
            tokio::spawn(async move { brain.checkout("ns:k", true).await })
        };
        let first = spawn_writer(brain.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = spawn_writer(brain.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        brain.checkin("ns:k", &held.token);
        let a = tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        // A later writer stays behind the second one when the lock frees up.
        let third = spawn_writer(brain.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        brain.checkin("ns:k", &a.token);
        let b = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        brain.checkin("ns:k", &b.token);
        let c = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(b.token, c.token);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_leaves_queue() {
        let brain = Arc::new(Brain::new(Duration::from_secs(30)));
        let held = brain.checkout("ns:k", true).await;
        let abandoned = {
            let brain = brain.clone();
            tokio::spawn(async move { brain.checkout("ns:k", true).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        let _ = abandoned.await;

        brain.checkin("ns:k", &held.token);
        let next = tokio::time::timeout(Duration::from_millis(500), brain.checkout("ns:k", true))
            .await
            .expect("queue should be empty after the waiter was dropped");
        assert!(!next.token.is_empty());
    }

    #[tokio::test]
    async fn test_checkin_always_ok() {
        let brain = Brain::default();
        assert_eq!(brain.checkin("ns:k", ""), RetVal::Ok);
        assert_eq!(brain.checkin("ns:k", "nope"), RetVal::Ok);
        let co = brain.checkout("ns:k", true).await;
        assert_eq!(brain.checkin("ns:k", "nope"), RetVal::Ok);
        assert_eq!(brain.locks_active(), 1);
        assert_eq!(brain.checkin("ns:k", &co.token), RetVal::Ok);
        assert_eq!(brain.locks_active(), 0);
    }

    #[tokio::test]
    async fn test_read_only_checkout_ignores_lock() {
        let brain = Brain::default();
        let co = brain.checkout("ns:k", true).await;
        brain.update("ns:k", &co.token, json!("v"));
        let _held = brain.checkout("ns:k", true).await;
        let ro = tokio::time::timeout(Duration::from_millis(100), brain.checkout("ns:k", false))
            .await
            .unwrap();
        assert_eq!(ro.datum, json!("v"));
    }

    #[tokio::test]
    async fn test_expire_locks() {
        let brain = Brain::new(Duration::from_millis(10));
        brain.checkout("ns:a", true).await;
        brain.checkout("ns:b", true).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(brain.locks_active(), 0);
        assert_eq!(brain.expire_locks(), 2);
    }

    #[test]
    fn test_key_validation() {
        assert!(Brain::validate_key("ledger").is_ok());
        assert!(Brain::validate_key("my-list.v2_x").is_ok());
        assert!(Brain::validate_key("").is_err());
        assert!(Brain::validate_key("a:b").is_err());
        assert!(Brain::validate_key("has space").is_err());
        assert!(Brain::validate_key("café").is_err());
        assert!(Brain::validate_key("ключ").is_err());
        assert_eq!(Brain::namespaced("links", "list").unwrap(), "links:list");
        assert!(matches!(
            Brain::namespaced("links", "x:y"),
            Err(CoreError::InvalidDatumKey { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_word_keys_are_namespaced(key in "[A-Za-z0-9_.-]{1,32}") {
            proptest::prop_assert_eq!(Brain::namespaced("ns", &key).unwrap(), format!("ns:{}", key));
        }

        #[test]
        fn prop_colon_keys_are_rejected(head in "[a-z]{0,8}", tail in "[a-z]{0,8}") {
            let key = format!("{}:{}", head, tail);
            proptest::prop_assert!(Brain::validate_key(&key).is_err());
        }
    }
}
