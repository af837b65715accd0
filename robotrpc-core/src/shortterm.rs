//! Short-term memories: small strings scoped to a user, channel and thread,
//! forgotten after a fixed lifetime.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Default lifetime of a short-term memory.
pub const DEFAULT_SHORT_TERM_TTL: Duration = Duration::from_secs(7 * 60);

/// Where a memory is visible. An empty `user` marks a memory shared by the
/// whole channel; an empty `thread` is channel-wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryScope {
    pub user: String,
    pub channel: String,
    pub thread: String,
}

impl MemoryScope {
    pub fn new(
        user: impl Into<String>,
        channel: impl Into<String>,
        thread: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            channel: channel.into(),
            thread: thread.into(),
        }
    }

    /// Same scope without the thread.
    pub fn channel_wide(&self) -> Self {
        Self {
            user: self.user.clone(),
            channel: self.channel.clone(),
            thread: String::new(),
        }
    }
}

#[derive(Debug)]
struct Memory {
    value: String,
    stored: Instant,
}

/// Store of short-term memories keyed by (key, scope).
pub struct ShortTermMemory {
    memories: DashMap<(String, MemoryScope), Memory>,
    ttl: Duration,
}

impl ShortTermMemory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            memories: DashMap::new(),
            ttl,
        }
    }

    /// Stores a value, replacing any previous one. An empty value forgets.
    pub fn remember(&self, scope: MemoryScope, key: &str, value: &str) {
        let id = (key.to_string(), scope);
        if value.is_empty() {
            self.memories.remove(&id);
            return;
        }
        self.memories.insert(
            id,
            Memory {
                value: value.to_string(),
                stored: Instant::now(),
            },
        );
    }

    /// Looks up a value in exactly this scope.
    pub fn get(&self, scope: &MemoryScope, key: &str) -> Option<String> {
        let id = (key.to_string(), scope.clone());
        let expired = {
            let memory = self.memories.get(&id)?;
            if memory.stored.elapsed() < self.ttl {
                return Some(memory.value.clone());
            }
            true
        };
        if expired {
            self.memories.remove(&id);
        }
        None
    }

    /// Looks up a value in the thread scope first, then channel-wide.
    pub fn recall(&self, scope: &MemoryScope, key: &str) -> Option<String> {
        if !scope.thread.is_empty() {
            if let Some(value) = self.get(scope, key) {
                return Some(value);
            }
        }
        self.get(&scope.channel_wide(), key)
    }

    /// Forgets expired memories. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.memories.len();
        self.memories.retain(|_, m| m.stored.elapsed() < self.ttl);
        before.saturating_sub(self.memories.len())
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

impl Default for ShortTermMemory {
    fn default() -> Self {
        Self::new(DEFAULT_SHORT_TERM_TTL)
    }
}
