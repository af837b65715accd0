//! Task registry and per-pipeline bookkeeping: added stages, parameters,
//! exclusive tags and thread subscriptions.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use robotrpc_protocol::RetVal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path};

/// What kind of thing a task is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Task,
    Job,
    Plugin,
}

/// A configured task, job or plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    /// Long-term memory namespace; defaults to the task name.
    pub namespace: String,
    pub disabled: bool,
    /// Only privileged pipelines may add privileged tasks.
    pub privileged: bool,
    /// Commands a plugin answers to.
    pub commands: Vec<String>,
    /// Task-specific reply matchers, id to pattern.
    pub reply_matchers: HashMap<String, String>,
    /// Parameters visible to `GetParameter`.
    pub parameters: HashMap<String, String>,
    /// Free-form configuration returned by `GetTaskConfig`.
    pub config: Value,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    pub fn namespace(&self) -> &str {
        if self.namespace.is_empty() {
            &self.name
        } else {
            &self.namespace
        }
    }
}

/// Registry of configured tasks by name.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskSpec>,
}

impl TaskRegistry {
    pub fn new(tasks: impl IntoIterator<Item = TaskSpec>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    /// Checks that `caller` may add task `name` of kind `want` to its
    /// pipeline.
    pub fn check_addable(
        &self,
        caller: &TaskSpec,
        name: &str,
        want: TaskKind,
    ) -> Result<&TaskSpec, RetVal> {
        if name.is_empty() {
            return Err(RetVal::MissingArguments);
        }
        let task = self.tasks.get(name).ok_or(RetVal::TaskNotFound)?;
        if task.disabled {
            return Err(RetVal::TaskDisabled);
        }
        if task.kind != want {
            return Err(RetVal::InvalidTaskType);
        }
        if task.privileged && !caller.privileged {
            return Err(RetVal::PrivilegeViolation);
        }
        Ok(task)
    }
}

/// Pipeline stage an entry runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Primary,
    Final,
    Fail,
}

/// What the pipeline runs for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Task,
    Job,
    Command,
}

/// One entry added to a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineEntry {
    pub stage: Stage,
    pub kind: EntryKind,
    pub name: String,
    pub args: Vec<String>,
}

/// What a pipeline should do after being denied an exclusive tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusiveDenial {
    /// Requeue the task once the tag is free.
    Queue,
    /// Abort the pipeline.
    Abort,
}

/// Mutable state of one running pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineState {
    pub stages: Vec<PipelineEntry>,
    pub spawned: Vec<PipelineEntry>,
    pub parameters: HashMap<String, String>,
    pub working_directory: String,
    pub denial: Option<ExclusiveDenial>,
    pub elevated: bool,
}

impl PipelineState {
    /// Whether anything was recorded since the pipeline started.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
            && self.spawned.is_empty()
            && self.parameters.is_empty()
            && self.working_directory.is_empty()
            && self.denial.is_none()
            && !self.elevated
    }

    pub fn add(&mut self, stage: Stage, kind: EntryKind, name: &str, args: Vec<String>) {
        self.stages.push(PipelineEntry {
            stage,
            kind,
            name: name.to_string(),
            args,
        });
    }

    pub fn spawn(&mut self, name: &str, args: Vec<String>) {
        self.spawned.push(PipelineEntry {
            stage: Stage::Primary,
            kind: EntryKind::Job,
            name: name.to_string(),
            args,
        });
    }

    /// Sets a parameter for later tasks. Empty names are refused.
    pub fn set_parameter(&mut self, name: &str, value: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.parameters.insert(name.to_string(), value.to_string());
        true
    }

    /// Sets the working directory. Relative paths may not climb out of the
    /// workspace.
    pub fn set_working_directory(&mut self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let climbs = Path::new(path)
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if climbs {
            return false;
        }
        self.working_directory = path.to_string();
        true
    }
}

/// Exclusive tags held by running pipelines.
#[derive(Debug, Default)]
pub struct ExclusiveTags {
    held: DashMap<String, String>,
}

impl ExclusiveTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the full tag for a pipeline namespace and optional tag.
    pub fn full_tag(namespace: &str, tag: &str) -> String {
        if tag.is_empty() {
            namespace.to_string()
        } else {
            format!("{}:{}", namespace, tag)
        }
    }

    /// Grants `tag` to `holder` if free or already theirs.
    pub fn acquire(&self, tag: &str, holder: &str) -> bool {
        match self.held.entry(tag.to_string()) {
            Entry::Occupied(e) => e.get() == holder,
            Entry::Vacant(e) => {
                e.insert(holder.to_string());
                true
            }
        }
    }

    /// Releases every tag held by `holder`. Returns how many were freed.
    pub fn release_all(&self, holder: &str) -> usize {
        let before = self.held.len();
        self.held.retain(|_, h| h != holder);
        before.saturating_sub(self.held.len())
    }

    pub fn holds_any(&self, holder: &str) -> bool {
        self.held.iter().any(|e| e.value() == holder)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Thread subscriptions: a plugin subscribed to a thread receives its
/// follow-up messages.
#[derive(Debug, Default)]
pub struct Subscriptions {
    threads: DashMap<(String, String), String>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str, thread: &str, task: &str) -> bool {
        if thread.is_empty() {
            return false;
        }
        match self.threads.entry((channel.to_string(), thread.to_string())) {
            Entry::Occupied(e) => e.get() == task,
            Entry::Vacant(e) => {
                e.insert(task.to_string());
                true
            }
        }
    }

    pub fn unsubscribe(&self, channel: &str, thread: &str, task: &str) -> bool {
        self.threads
            .remove_if(&(channel.to_string(), thread.to_string()), |_, t| t == task)
            .is_some()
    }

    pub fn subscriber(&self, channel: &str, thread: &str) -> Option<String> {
        self.threads
            .get(&(channel.to_string(), thread.to_string()))
            .map(|t| t.clone())
    }
}
