//! Caller registry.
//!
//! Every plugin or job the host launches gets a caller id. Calls carry only
//! that id; the user, channel, thread and protocol are resolved here.

use crate::error::CoreError;
use crate::pipeline::PipelineState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use robotrpc_protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// Identity a caller is launched with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerSpec {
    /// Fixed caller id; generated when empty.
    pub caller_id: String,
    /// Name of the task, job or plugin being run.
    pub task: String,
    /// Lowercase protocol name; the robot's own protocol when empty.
    pub protocol: String,
    pub user: String,
    pub channel: String,
    pub thread: String,
    /// Whether the triggering message was posted in a thread.
    pub threaded_message: bool,
}

impl CallerSpec {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = caller_id.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_thread(mut self, thread: impl Into<String>, threaded_message: bool) -> Self {
        self.thread = thread.into();
        self.threaded_message = threaded_message;
        self
    }
}

/// A registered caller.
#[derive(Debug)]
pub struct CallerContext {
    pub caller_id: String,
    pub task: String,
    pub protocol: Protocol,
    pub user: String,
    pub channel: String,
    pub thread: String,
    pub threaded_message: bool,
    pipeline: Mutex<PipelineState>,
    last_active: Mutex<Instant>,
}

impl CallerContext {
    pub(crate) fn new(spec: CallerSpec, caller_id: String, protocol: Protocol) -> Self {
        Self {
            caller_id,
            task: spec.task,
            protocol,
            user: spec.user,
            channel: spec.channel,
            thread: spec.thread,
            threaded_message: spec.threaded_message,
            pipeline: Mutex::new(PipelineState::default()),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Records that the caller just made a call.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Ends the current pipeline, returning its state and starting afresh.
    pub fn take_pipeline(&self) -> PipelineState {
        std::mem::take(&mut *self.pipeline.lock())
    }

    /// Runs `f` with the caller's pipeline state locked.
    pub fn with_pipeline<R>(&self, f: impl FnOnce(&mut PipelineState) -> R) -> R {
        f(&mut self.pipeline.lock())
    }

    /// Snapshot of the caller's pipeline state.
    pub fn pipeline(&self) -> PipelineState {
        self.pipeline.lock().clone()
    }
}

/// Registered callers by id.
#[derive(Debug, Default)]
pub struct CallerRegistry {
    callers: DashMap<String, Arc<CallerContext>>,
}

impl CallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a caller, generating an id if the spec has none.
    pub fn register(
        &self,
        spec: CallerSpec,
        protocol: Protocol,
    ) -> Result<Arc<CallerContext>, CoreError> {
        let caller_id = if spec.caller_id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            spec.caller_id.clone()
        };
        match self.callers.entry(caller_id.clone()) {
            Entry::Occupied(_) => Err(CoreError::CallerExists { caller_id }),
            Entry::Vacant(e) => {
                let ctx = Arc::new(CallerContext::new(spec, caller_id, protocol));
                e.insert(ctx.clone());
                Ok(ctx)
            }
        }
    }

    pub fn get(&self, caller_id: &str) -> Result<Arc<CallerContext>, CoreError> {
        self.callers
            .get(caller_id)
            .map(|c| c.clone())
            .ok_or_else(|| CoreError::UnknownCaller {
                caller_id: caller_id.to_string(),
            })
    }

    /// Callers whose last call was before `cutoff`.
    pub fn idle_since(&self, cutoff: Instant) -> Vec<Arc<CallerContext>> {
        self.callers
            .iter()
            .filter(|c| c.last_active() < cutoff)
            .map(|c| c.value().clone())
            .collect()
    }

    pub fn remove(&self, caller_id: &str) -> Option<Arc<CallerContext>> {
        self.callers.remove(caller_id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}
