//! Host engine - resolves callers and carries out robot calls.

use crate::brain::{Brain, DEFAULT_LOCK_TIMEOUT};
use crate::caller::{CallerContext, CallerRegistry, CallerSpec};
use crate::connector::{Connector, MemoryConnector, OutgoingMessage};
use crate::directory::{BotIdentity, Directory, DirectoryConfig};
use crate::error::CoreError;
use crate::mail::{Mailbox, OutgoingMail};
use crate::pipeline::{
    EntryKind, ExclusiveDenial, ExclusiveTags, Stage, Subscriptions, TaskKind, TaskRegistry,
    TaskSpec,
};
use crate::prompt::{Matchers, PromptBroker, WaiterKey, DEFAULT_REPLY_TIMEOUT};
use crate::shortterm::{MemoryScope, ShortTermMemory, DEFAULT_SHORT_TERM_TTL};
use robotrpc_protocol::message::{
    AttributeArgs, CheckinArgs, CheckoutArgs, ChannelThreadMessageArgs, CommandArgs, ElevateArgs,
    EmailAddressArgs, EmailArgs, EmailUserArgs, ExclusiveArgs, GetParameterArgs, LogArgs, PromptArgs, ProtocolUserChannelMessageArgs,
    RecallArgs, RememberArgs, SetParameterArgs, TaskArgs, UpdateArgs, UserAttributeArgs,
    UserChannelThreadMessageArgs, UserMessageArgs, WorkingDirectoryArgs,
};
use robotrpc_protocol::{
    AttributeResponse, BoolResponse, CheckoutResponse, FinishResponse, IncomingMessage,
    IncomingResponse, LogLevel, MessageFormat, Protocol, ReplyResponse, RetVal, RetValResponse, StrResponse, TaskConfigResponse,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How long a caller may stay silent before its pipeline is finished for it.
pub const DEFAULT_PIPELINE_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Host engine configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Lifetime of a read-write datum checkout.
    pub lock_timeout: Duration,
    /// Lifetime of a short-term memory.
    pub short_term_ttl: Duration,
    /// How long a prompt waits for its reply.
    pub reply_timeout: Duration,
    /// Silence after which a caller's pipeline is finished by the sweeper.
    pub pipeline_idle_timeout: Duration,
    pub bot: BotIdentity,
    pub directory: DirectoryConfig,
    pub tasks: Vec<TaskSpec>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            short_term_ttl: DEFAULT_SHORT_TERM_TTL,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            pipeline_idle_timeout: DEFAULT_PIPELINE_IDLE_TIMEOUT,
            bot: BotIdentity::default(),
            directory: DirectoryConfig::default(),
            tasks: Vec::new(),
        }
    }
}

/// Point-in-time counters for metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub callers: usize,
    pub datum_locks: usize,
    pub prompt_waiters: usize,
    pub exclusive_tags: usize,
    pub short_term_memories: usize,
}

/// The reference robot host.
pub struct Host {
    brain: Brain,
    short_term: ShortTermMemory,
    prompts: PromptBroker,
    callers: CallerRegistry,
    directory: Directory,
    tasks: TaskRegistry,
    matchers: Matchers,
    exclusive: ExclusiveTags,
    subscriptions: Subscriptions,
    mail: Mailbox,
    pipeline_idle_timeout: Duration,
    connector: Arc<dyn Connector>,
    outbox: Option<Arc<MemoryConnector>>,
}

impl Host {
    /// Creates a host whose messages go to an in-memory outbox.
    pub fn new(config: HostConfig) -> Result<Self, CoreError> {
        let directory = Directory::new(config.bot.clone(), &config.directory);
        let outbox = Arc::new(MemoryConnector::new(directory.clone()));
        let mut host = Self::with_connector(config, outbox.clone())?;
        host.outbox = Some(outbox);
        Ok(host)
    }

    /// Creates a host delivering messages through `connector`.
    pub fn with_connector(
        config: HostConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, CoreError> {
        if Protocol::from_wire(&config.bot.protocol).is_none() {
            return Err(CoreError::InvalidConfig {
                reason: format!("unknown protocol {:?}", config.bot.protocol),
            });
        }
        let mut matchers = Matchers::new()?;
        for task in &config.tasks {
            if task.name.is_empty() {
                return Err(CoreError::InvalidConfig {
                    reason: "task with empty name".to_string(),
                });
            }
            matchers.add_task(&task.name, &task.reply_matchers)?;
        }

        tracing::info!(
            "Host {} ready: {} tasks, {} users, protocol {}",
            config.bot.name,
            config.tasks.len(),
            config.directory.users.len(),
            config.bot.protocol
        );

        Ok(Self {
            brain: Brain::new(config.lock_timeout),
            short_term: ShortTermMemory::new(config.short_term_ttl),
            prompts: PromptBroker::new(config.reply_timeout),
            callers: CallerRegistry::new(),
            directory: Directory::new(config.bot, &config.directory),
            tasks: TaskRegistry::new(config.tasks),
            matchers,
            exclusive: ExclusiveTags::new(),
            subscriptions: Subscriptions::new(),
            mail: Mailbox::new()?,
            pipeline_idle_timeout: config.pipeline_idle_timeout,
            connector,
            outbox: None,
        })
    }

    // =========================================================================
    // Callers
    // =========================================================================

    /// Registers a caller for a configured task.
    pub fn register_caller(&self, spec: CallerSpec) -> Result<Arc<CallerContext>, CoreError> {
        if self.tasks.get(&spec.task).is_none() {
            return Err(CoreError::TaskNotFound {
                task: spec.task.clone(),
            });
        }
        let protocol = if spec.protocol.is_empty() {
            self.connector.protocol()
        } else {
            Protocol::from_wire(&spec.protocol).ok_or_else(|| CoreError::InvalidConfig {
                reason: format!("unknown protocol {:?}", spec.protocol),
            })?
        };
        let ctx = self.callers.register(spec, protocol)?;
        tracing::debug!("Registered caller {} for task {}", ctx.caller_id, ctx.task);
        Ok(ctx)
    }

    /// Removes a caller, finishing its pipeline first.
    pub fn deregister_caller(&self, caller_id: &str) -> Option<Arc<CallerContext>> {
        let ctx = self.callers.remove(caller_id)?;
        let finished = self.finish(&ctx);
        tracing::debug!(
            "Deregistered caller {} ({} exclusive tags released)",
            caller_id,
            finished.released_tags
        );
        Some(ctx)
    }

    /// Resolves a caller id for a call, marking the caller active.
    pub fn caller(&self, caller_id: &str) -> Result<Arc<CallerContext>, CoreError> {
        let ctx = self.callers.get(caller_id)?;
        ctx.touch();
        Ok(ctx)
    }

    /// Ends the pipeline a caller is running: its exclusive tags are released
    /// and its stages, parameters and privileges start afresh. With
    /// `deregister` the caller id is forgotten too.
    pub fn finish_pipeline(
        &self,
        caller_id: &str,
        deregister: bool,
    ) -> Result<FinishResponse, CoreError> {
        let ctx = if deregister {
            self.callers
                .remove(caller_id)
                .ok_or_else(|| CoreError::UnknownCaller {
                    caller_id: caller_id.to_string(),
                })?
        } else {
            self.callers.get(caller_id)?
        };
        let finished = self.finish(&ctx);
        tracing::info!(
            "Finished pipeline of {} ({}): {} stages, {} spawned, {} tags released",
            ctx.caller_id,
            ctx.task,
            finished.stages,
            finished.spawned,
            finished.released_tags
        );
        Ok(finished)
    }

    fn finish(&self, caller: &CallerContext) -> FinishResponse {
        let pipeline = caller.take_pipeline();
        FinishResponse {
            released_tags: self.exclusive.release_all(&caller.caller_id),
            stages: pipeline.stages.len(),
            spawned: pipeline.spawned.len(),
        }
    }

    fn task(&self, caller: &CallerContext) -> Result<&TaskSpec, RetVal> {
        self.tasks.get(&caller.task).ok_or(RetVal::TaskNotFound)
    }

    /// Resolves an envelope `Format`; empty or unknown means the default.
    pub fn message_format(&self, format: &str) -> MessageFormat {
        MessageFormat::from_wire(format).unwrap_or(MessageFormat::Variable)
    }

    // =========================================================================
    // Identity and privileges
    // =========================================================================

    pub fn check_admin(&self, caller: &CallerContext) -> BoolResponse {
        BoolResponse::new(self.directory.is_admin(&caller.user))
    }

    /// Elevates the pipeline. Only administrators can elevate.
    pub fn elevate(&self, caller: &CallerContext, args: &ElevateArgs) -> BoolResponse {
        if caller.with_pipeline(|p| p.elevated) && !args.immediate {
            return BoolResponse::new(true);
        }
        let allowed = self.directory.is_admin(&caller.user);
        if allowed {
            caller.with_pipeline(|p| p.elevated = true);
        } else {
            tracing::warn!("Elevation denied for {} in {}", caller.user, caller.task);
        }
        BoolResponse::new(allowed)
    }

    pub fn subscribe(&self, caller: &CallerContext) -> BoolResponse {
        BoolResponse::new(
            self.subscriptions
                .subscribe(&caller.channel, &caller.thread, &caller.task),
        )
    }

    pub fn unsubscribe(&self, caller: &CallerContext) -> BoolResponse {
        BoolResponse::new(
            self.subscriptions
                .unsubscribe(&caller.channel, &caller.thread, &caller.task),
        )
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn sender_attribute(
        &self,
        caller: &CallerContext,
        args: &AttributeArgs,
    ) -> AttributeResponse {
        if caller.user.is_empty() {
            return AttributeResponse::missing(RetVal::UserNotFound);
        }
        self.directory.user_attribute(&caller.user, &args.attribute)
    }

    pub fn bot_attribute(&self, args: &AttributeArgs) -> AttributeResponse {
        self.directory.bot_attribute(&args.attribute)
    }

    pub fn user_attribute(&self, args: &UserAttributeArgs) -> AttributeResponse {
        self.directory.user_attribute(&args.user, &args.attribute)
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    fn send(&self, message: OutgoingMessage) -> RetValResponse {
        RetValResponse::new(self.connector.send(message))
    }

    pub fn send_channel_thread_message(
        &self,
        caller: &CallerContext,
        args: &ChannelThreadMessageArgs,
        format: MessageFormat,
    ) -> RetValResponse {
        if args.channel.is_empty() {
            return RetValResponse::new(RetVal::ChannelNotFound);
        }
        self.send(OutgoingMessage {
            protocol: caller.protocol,
            user: String::new(),
            channel: args.channel.clone(),
            thread: args.thread.clone(),
            message: args.message.clone(),
            format,
        })
    }

    pub fn send_user_message(
        &self,
        caller: &CallerContext,
        args: &UserMessageArgs,
        format: MessageFormat,
    ) -> RetValResponse {
        if args.user.is_empty() {
            return RetValResponse::new(RetVal::UserNotFound);
        }
        self.send(OutgoingMessage {
            protocol: caller.protocol,
            user: args.user.clone(),
            channel: String::new(),
            thread: String::new(),
            message: args.message.clone(),
            format,
        })
    }

    pub fn send_user_channel_thread_message(
        &self,
        caller: &CallerContext,
        args: &UserChannelThreadMessageArgs,
        format: MessageFormat,
    ) -> RetValResponse {
        if args.user.is_empty() {
            return RetValResponse::new(RetVal::UserNotFound);
        }
        self.send(OutgoingMessage {
            protocol: caller.protocol,
            user: args.user.clone(),
            channel: args.channel.clone(),
            thread: args.thread.clone(),
            message: args.message.clone(),
            format,
        })
    }

    pub fn send_protocol_user_channel_message(
        &self,
        args: &ProtocolUserChannelMessageArgs,
        format: MessageFormat,
    ) -> RetValResponse {
        let Some(protocol) = Protocol::from_wire(&args.protocol) else {
            tracing::warn!("Message for unknown protocol {:?}", args.protocol);
            return RetValResponse::new(RetVal::Failed);
        };
        if args.user.is_empty() && args.channel.is_empty() {
            return RetValResponse::new(RetVal::MissingArguments);
        }
        self.send(OutgoingMessage {
            protocol,
            user: args.user.clone(),
            channel: args.channel.clone(),
            thread: String::new(),
            message: args.message.clone(),
            format,
        })
    }

    /// Prompts a user and waits for a matching reply. The prompt is only
    /// sent if nobody else is already waiting on the same user and place.
    pub async fn prompt(
        &self,
        caller: &CallerContext,
        args: &PromptArgs,
        format: MessageFormat,
    ) -> ReplyResponse {
        let Some(matcher) = self.matchers.resolve(&caller.task, &args.regex_id) else {
            tracing::warn!("No reply matcher {:?} for {}", args.regex_id, caller.task);
            return ReplyResponse::failed(RetVal::MatcherNotFound);
        };
        if args.user.is_empty() {
            return ReplyResponse::failed(RetVal::UserNotFound);
        }

        let key = WaiterKey {
            protocol: caller.protocol,
            user: args.user.clone(),
            channel: args.channel.clone(),
            thread: args.thread.clone(),
        };
        let reg = self.prompts.register(key);
        if reg.first {
            let sent = self.connector.send(OutgoingMessage {
                protocol: caller.protocol,
                user: args.user.clone(),
                channel: args.channel.clone(),
                thread: args.thread.clone(),
                message: args.prompt.clone(),
                format,
            });
            if sent != RetVal::Ok {
                self.prompts.abandon(reg);
                return ReplyResponse::failed(sent);
            }
        }
        self.prompts.wait(reg, matcher).await
    }

    /// Routes a user message to whoever is waiting for it. A waiting prompt
    /// takes it first; otherwise it goes to the task subscribed to the thread.
    pub fn incoming(&self, message: &IncomingMessage) -> IncomingResponse {
        let protocol = message
            .protocol
            .as_deref()
            .and_then(Protocol::from_wire)
            .unwrap_or_else(|| self.connector.protocol());
        let key = WaiterKey {
            protocol,
            user: message.user.clone(),
            channel: message.channel.clone(),
            thread: message.thread.clone(),
        };
        if self.prompts.deliver(&key, &message.message) {
            return IncomingResponse {
                matched: true,
                subscriber: String::new(),
            };
        }
        let subscriber = if message.thread.is_empty() {
            None
        } else {
            self.subscriptions
                .subscriber(&message.channel, &message.thread)
        };
        match subscriber {
            Some(task) => {
                tracing::info!(
                    "Message from {} in {}/{} routed to subscriber {}",
                    message.user,
                    message.channel,
                    message.thread,
                    task
                );
                IncomingResponse {
                    matched: false,
                    subscriber: task,
                }
            }
            None => IncomingResponse::default(),
        }
    }

    // =========================================================================
    // Long-term memory
    // =========================================================================

    fn datum_key(&self, caller: &CallerContext, key: &str) -> Result<String, CoreError> {
        let namespace = self
            .tasks
            .get(&caller.task)
            .map(TaskSpec::namespace)
            .unwrap_or(caller.task.as_str());
        Brain::namespaced(namespace, key)
    }

    pub async fn checkout_datum(
        &self,
        caller: &CallerContext,
        args: &CheckoutArgs,
    ) -> CheckoutResponse {
        let key = match self.datum_key(caller, &args.key) {
            Ok(key) => key,
            Err(e) => return CheckoutResponse::failed(e.ret_val()),
        };
        let checkout = self.brain.checkout(&key, args.rw).await;
        CheckoutResponse {
            lock_token: checkout.token,
            exists: checkout.exists,
            datum: checkout.datum,
            ret_val: RetVal::Ok,
        }
    }

    pub fn update_datum(&self, caller: &CallerContext, args: &UpdateArgs) -> RetValResponse {
        let ret = match self.datum_key(caller, &args.key) {
            Ok(key) => self.brain.update(&key, &args.token, args.datum.clone()),
            Err(e) => e.ret_val(),
        };
        RetValResponse::new(ret)
    }

    pub fn checkin_datum(&self, caller: &CallerContext, args: &CheckinArgs) -> RetValResponse {
        if let Ok(key) = self.datum_key(caller, &args.key) {
            self.brain.checkin(&key, &args.token);
        }
        RetValResponse::new(RetVal::Ok)
    }

    // =========================================================================
    // Short-term memory
    // =========================================================================

    /// Stores a short-term memory for the caller's user and channel, or the
    /// whole channel when shared. `threaded` scopes it to the caller's thread.
    pub fn remember(
        &self,
        caller: &CallerContext,
        args: &RememberArgs,
        threaded: bool,
    ) -> RetValResponse {
        if args.key.is_empty() {
            return RetValResponse::new(RetVal::MissingArguments);
        }
        let user = if args.shared { "" } else { caller.user.as_str() };
        let thread = if threaded { caller.thread.as_str() } else { "" };
        let scope = MemoryScope::new(user, caller.channel.as_str(), thread);
        self.short_term.remember(scope, &args.key, &args.value);
        RetValResponse::new(RetVal::Ok)
    }

    pub fn recall(&self, caller: &CallerContext, args: &RecallArgs) -> StrResponse {
        let user = if args.shared { "" } else { caller.user.as_str() };
        let scope = MemoryScope::new(user, caller.channel.as_str(), caller.thread.as_str());
        StrResponse::new(self.short_term.recall(&scope, &args.key).unwrap_or_default())
    }

    // =========================================================================
    // Email
    // =========================================================================

    fn mail_user(
        &self,
        user: &str,
        subject: &str,
        body: &str,
        html: bool,
    ) -> RetValResponse {
        let address = self.directory.user_attribute(user, "email");
        if address.ret_val != RetVal::Ok {
            tracing::warn!("No email address for user {:?}", user);
            return RetValResponse::new(RetVal::NoUserEmail);
        }
        let bot = self.directory.bot();
        RetValResponse::new(self.mail.send(bot, &address.attribute, subject, body, html))
    }

    /// Mails the user who started the pipeline.
    pub fn email(&self, caller: &CallerContext, args: &EmailArgs) -> RetValResponse {
        self.mail_user(&caller.user, &args.subject, &args.body, args.html)
    }

    pub fn email_user(&self, args: &EmailUserArgs) -> RetValResponse {
        self.mail_user(&args.user, &args.subject, &args.body, args.html)
    }

    pub fn email_address(&self, args: &EmailAddressArgs) -> RetValResponse {
        let bot = self.directory.bot();
        RetValResponse::new(self.mail.send(
            bot,
            &args.address,
            &args.subject,
            &args.body,
            args.html,
        ))
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Requests an exclusive tag for the caller's pipeline.
    pub fn exclusive(&self, caller: &CallerContext, args: &ExclusiveArgs) -> BoolResponse {
        let namespace = self
            .tasks
            .get(&caller.task)
            .map(TaskSpec::namespace)
            .unwrap_or(caller.task.as_str());
        let tag = ExclusiveTags::full_tag(namespace, &args.tag);
        if self.exclusive.acquire(&tag, &caller.caller_id) {
            return BoolResponse::new(true);
        }
        let denial = if args.queue_task {
            ExclusiveDenial::Queue
        } else {
            ExclusiveDenial::Abort
        };
        tracing::debug!("Exclusive {} denied to {}: {:?}", tag, caller.caller_id, denial);
        caller.with_pipeline(|p| p.denial = Some(denial));
        BoolResponse::new(false)
    }

    /// Adds a task or job to one of the caller's pipeline stages.
    pub fn add_task(
        &self,
        caller: &CallerContext,
        args: &TaskArgs,
        stage: Stage,
        kind: TaskKind,
    ) -> RetValResponse {
        let ret = self.task(caller).and_then(|own| {
            self.tasks.check_addable(own, &args.name, kind)?;
            let entry = match kind {
                TaskKind::Job => EntryKind::Job,
                _ => EntryKind::Task,
            };
            caller.with_pipeline(|p| p.add(stage, entry, &args.name, args.cmd_args.clone()));
            Ok(())
        });
        RetValResponse::new(ret.err().unwrap_or(RetVal::Ok))
    }

    /// Starts a job in a new pipeline.
    pub fn spawn_job(&self, caller: &CallerContext, args: &TaskArgs) -> RetValResponse {
        let ret = self.task(caller).and_then(|own| {
            self.tasks.check_addable(own, &args.name, TaskKind::Job)?;
            caller.with_pipeline(|p| p.spawn(&args.name, args.cmd_args.clone()));
            Ok(())
        });
        RetValResponse::new(ret.err().unwrap_or(RetVal::Ok))
    }

    /// Adds a plugin command to one of the caller's pipeline stages.
    pub fn add_command(
        &self,
        caller: &CallerContext,
        args: &CommandArgs,
        stage: Stage,
    ) -> RetValResponse {
        let ret = self.task(caller).and_then(|own| {
            let plugin = self.tasks.check_addable(own, &args.plugin, TaskKind::Plugin)?;
            let mut words = args.command.split_whitespace();
            let command = words.next().ok_or(RetVal::MissingArguments)?;
            if !plugin.commands.iter().any(|c| c == command) {
                return Err(RetVal::CommandNotMatched);
            }
            let rest: Vec<String> = words.map(str::to_string).collect();
            let mut argv = vec![command.to_string()];
            argv.extend(rest);
            caller.with_pipeline(|p| p.add(stage, EntryKind::Command, &args.plugin, argv));
            Ok(())
        });
        RetValResponse::new(ret.err().unwrap_or(RetVal::Ok))
    }

    pub fn set_parameter(&self, caller: &CallerContext, args: &SetParameterArgs) -> BoolResponse {
        BoolResponse::new(caller.with_pipeline(|p| p.set_parameter(&args.name, &args.value)))
    }

    /// Reads a parameter set earlier in the pipeline, falling back to the
    /// task's configured parameters.
    pub fn get_parameter(&self, caller: &CallerContext, args: &GetParameterArgs) -> StrResponse {
        let value = caller
            .with_pipeline(|p| p.parameters.get(&args.parameter).cloned())
            .or_else(|| {
                self.tasks
                    .get(&caller.task)
                    .and_then(|t| t.parameters.get(&args.parameter).cloned())
            })
            .unwrap_or_default();
        StrResponse::new(value)
    }

    pub fn set_working_directory(
        &self,
        caller: &CallerContext,
        args: &WorkingDirectoryArgs,
    ) -> BoolResponse {
        BoolResponse::new(caller.with_pipeline(|p| p.set_working_directory(&args.path)))
    }

    // =========================================================================
    // Misc
    // =========================================================================

    /// Writes a plugin log line at the requested level.
    pub fn log(&self, caller: &CallerContext, args: &LogArgs) -> RetValResponse {
        let Some(level) = LogLevel::from_wire(&args.level) else {
            return RetValResponse::new(RetVal::Failed);
        };
        let task = caller.task.as_str();
        let msg = args.message.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(task, "{}", msg),
            LogLevel::Debug => tracing::debug!(task, "{}", msg),
            LogLevel::Info | LogLevel::Audit => tracing::info!(task, "{}", msg),
            LogLevel::Warn => tracing::warn!(task, "{}", msg),
            LogLevel::Error | LogLevel::Fatal => tracing::error!(task, "{}", msg),
        }
        RetValResponse::new(RetVal::Ok)
    }

    pub fn task_config(&self, caller: &CallerContext) -> TaskConfigResponse {
        match self.tasks.get(&caller.task).map(|t| &t.config) {
            Some(config) if !config.is_null() => TaskConfigResponse {
                config: config.clone(),
                ret_val: RetVal::Ok,
            },
            _ => TaskConfigResponse {
                config: Value::Null,
                ret_val: RetVal::NoConfigFound,
            },
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drops expired locks and memories, and finishes pipelines whose
    /// callers went quiet.
    pub fn sweep(&self) {
        let locks = self.brain.expire_locks();
        let memories = self.short_term.purge_expired();
        let pipelines = self.finish_idle();
        if locks > 0 || memories > 0 || pipelines > 0 {
            tracing::debug!(
                "Swept {} expired locks, {} memories, {} idle pipelines",
                locks,
                memories,
                pipelines
            );
        }
    }

    fn finish_idle(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.pipeline_idle_timeout) else {
            return 0;
        };
        let mut finished = 0;
        for caller in self.callers.idle_since(cutoff) {
            let holds_tags = self.exclusive.holds_any(&caller.caller_id);
            if !holds_tags && caller.with_pipeline(|p| p.is_empty()) {
                continue;
            }
            let done = self.finish(&caller);
            tracing::warn!(
                "Pipeline of {} ({}) idle for {:?}, finished: {} stages, {} tags released",
                caller.caller_id,
                caller.task,
                self.pipeline_idle_timeout,
                done.stages,
                done.released_tags
            );
            finished += 1;
        }
        finished
    }

    /// Interrupts every waiting prompt.
    pub fn shutdown(&self) {
        tracing::info!("Host shutting down, interrupting {} prompts", self.prompts.active());
        self.prompts.shutdown();
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            callers: self.callers.len(),
            datum_locks: self.brain.locks_active(),
            prompt_waiters: self.prompts.active(),
            exclusive_tags: self.exclusive.len(),
            short_term_memories: self.short_term.len(),
        }
    }

    /// Messages recorded by the in-memory connector, oldest first.
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.outbox.as_ref().map(|o| o.sent()).unwrap_or_default()
    }

    /// Mail recorded by the host, oldest first.
    pub fn mail(&self) -> Vec<OutgoingMail> {
        self.mail.sent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::UserRecord;
    use serde_json::json;
    use std::collections::HashMap;

    fn config() -> HostConfig {
        let mut links = TaskSpec::new("links", TaskKind::Plugin);
        links.commands = vec!["add".into(), "list".into()];
        links.config = json!({"max": 5});
        links.reply_matchers = HashMap::from([("url".to_string(), r"https?://\S+".to_string())]);
        links.parameters = HashMap::from([("SITE".to_string(), "wiki".to_string())]);
        let mut deploy = TaskSpec::new("deploy", TaskKind::Job);
        deploy.namespace = "ops".into();

        HostConfig {
            lock_timeout: Duration::from_millis(200),
            reply_timeout: Duration::from_secs(5),
            bot: BotIdentity {
                admins: vec!["alice".into()],
                ..Default::default()
            },
            directory: DirectoryConfig {
                users: vec![
                    UserRecord {
                        name: "alice".into(),
                        attributes: HashMap::from([(
                            "email".to_string(),
                            "alice@example.com".to_string(),
                        )]),
                    },
                    UserRecord {
                        name: "bob".into(),
                        ..Default::default()
                    },
                ],
                channels: vec!["general".into()],
            },
            tasks: vec![links, deploy, TaskSpec::new("notify", TaskKind::Task)],
            ..Default::default()
        }
    }

    fn caller(host: &Host, task: &str, user: &str) -> Arc<CallerContext> {
        host.register_caller(CallerSpec::new(task).with_user(user).with_channel("general"))
            .unwrap()
    }

    #[test]
    fn test_register_unknown_task() {
        let host = Host::new(config()).unwrap();
        assert!(matches!(
            host.register_caller(CallerSpec::new("nope")),
            Err(CoreError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_config() {
        let mut cfg = config();
        cfg.bot.protocol = "irc".into();
        assert!(matches!(Host::new(cfg), Err(CoreError::InvalidConfig { .. })));

        let mut cfg = config();
        cfg.tasks[0].reply_matchers.insert("bad".into(), "(".into());
        assert!(matches!(Host::new(cfg), Err(CoreError::InvalidMatcher { .. })));
    }

    #[test]
    fn test_remember_recall_scopes() {
        let host = Host::new(config()).unwrap();
        let alice = caller(&host, "links", "alice");
        let remember = |shared| RememberArgs {
            key: "k".into(),
            value: "v".into(),
            shared,
        };
        let recall = |shared| RecallArgs {
            key: "k".into(),
            shared,
        };

        assert_eq!(host.remember(&alice, &remember(false), false).ret_val, RetVal::Ok);
        assert_eq!(host.recall(&alice, &recall(false)).str_val, "v");
        assert_eq!(host.recall(&alice, &recall(true)).str_val, "");

        let bob = caller(&host, "links", "bob");
        assert_eq!(host.recall(&bob, &recall(false)).str_val, "");
        host.remember(&alice, &remember(true), false);
        assert_eq!(host.recall(&bob, &recall(true)).str_val, "v");
    }

    #[tokio::test]
    async fn test_datum_namespacing() {
        let host = Host::new(config()).unwrap();
        let links = caller(&host, "links", "alice");
        let deploy = caller(&host, "deploy", "alice");

        let co = host
            .checkout_datum(&links, &CheckoutArgs { key: "list".into(), rw: true })
            .await;
        assert_eq!(co.ret_val, RetVal::Ok);
        assert!(!co.exists);
        let update = UpdateArgs {
            key: "list".into(),
            token: co.lock_token,
            datum: json!(["a"]),
        };
        assert_eq!(host.update_datum(&links, &update).ret_val, RetVal::Ok);

        let other = host
            .checkout_datum(&deploy, &CheckoutArgs { key: "list".into(), rw: false })
            .await;
        assert!(!other.exists);

        let mine = host
            .checkout_datum(&links, &CheckoutArgs { key: "list".into(), rw: false })
            .await;
        assert!(mine.exists);
        assert_eq!(mine.datum, json!(["a"]));
    }

    #[tokio::test]
    async fn test_invalid_datum_key() {
        let host = Host::new(config()).unwrap();
        let c = caller(&host, "links", "alice");
        let co = host
            .checkout_datum(&c, &CheckoutArgs { key: "a:b".into(), rw: true })
            .await;
        assert_eq!(co.ret_val, RetVal::InvalidDatumKey);
        let up = UpdateArgs {
            key: "".into(),
            token: "t".into(),
            datum: json!(1),
        };
        assert_eq!(host.update_datum(&c, &up).ret_val, RetVal::InvalidDatumKey);
        let ci = CheckinArgs {
            key: "a:b".into(),
            token: "t".into(),
        };
        assert_eq!(host.checkin_datum(&c, &ci).ret_val, RetVal::Ok);
    }

    #[tokio::test]
    async fn test_prompt_reply_flow() {
        let host = Arc::new(Host::new(config()).unwrap());
        let c = caller(&host, "links", "alice");
        let args = PromptArgs {
            regex_id: "url".into(),
            user: "alice".into(),
            channel: "general".into(),
            thread: String::new(),
            prompt: "Which link?".into(),
        };

        let waiting = {
            let host = host.clone();
            let c = c.clone();
            tokio::spawn(async move { host.prompt(&c, &args, MessageFormat::Variable).await })
        };
        while host.stats().prompt_waiters == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(host.sent().last().map(|m| m.message.as_str()), Some("Which link?"));

        let reply = IncomingMessage {
            user: "alice".into(),
            channel: "general".into(),
            message: " https://example.com ".into(),
            ..Default::default()
        };
        assert!(host.incoming(&reply).matched);
        let result = waiting.await.unwrap();
        assert_eq!(result, ReplyResponse::matched("https://example.com"));
    }

    #[tokio::test]
    async fn test_prompt_errors() {
        let host = Host::new(config()).unwrap();
        let c = caller(&host, "links", "alice");
        let mut args = PromptArgs {
            regex_id: "nosuch".into(),
            user: "alice".into(),
            channel: "general".into(),
            thread: String::new(),
            prompt: "?".into(),
        };
        let r = host.prompt(&c, &args, MessageFormat::Variable).await;
        assert_eq!(r.ret_val, RetVal::MatcherNotFound);

        args.regex_id = "YesNo".into();
        args.user = "carol".into();
        let r = host.prompt(&c, &args, MessageFormat::Variable).await;
        assert_eq!(r.ret_val, RetVal::UserNotFound);
        assert_eq!(host.stats().prompt_waiters, 0);
    }

    #[test]
    fn test_exclusive_and_deregister() {
        let host = Host::new(config()).unwrap();
        let a = caller(&host, "deploy", "alice");
        let b = caller(&host, "deploy", "bob");
        let args = ExclusiveArgs {
            tag: "prod".into(),
            queue_task: true,
        };
        assert!(host.exclusive(&a, &args).boolean);
        assert!(host.exclusive(&a, &args).boolean);
        assert!(!host.exclusive(&b, &args).boolean);
        assert_eq!(b.pipeline().denial, Some(ExclusiveDenial::Queue));

        host.deregister_caller(&a.caller_id);
        assert!(host.exclusive(&b, &args).boolean);
        assert_eq!(host.stats().callers, 1);
    }

    #[test]
    fn test_finish_pipeline_frees_tags_and_stages() {
        let host = Host::new(config()).unwrap();
        let a = caller(&host, "deploy", "alice");
        let b = caller(&host, "deploy", "bob");
        let args = ExclusiveArgs {
            tag: "prod".into(),
            queue_task: false,
        };
        assert!(host.exclusive(&a, &args).boolean);
        assert!(!host.exclusive(&b, &args).boolean);

        let task = TaskArgs {
            name: "notify".into(),
            cmd_args: Vec::new(),
        };
        for _ in 0..1000 {
            host.add_task(&a, &task, Stage::Primary, TaskKind::Task);
        }
        assert_eq!(a.pipeline().stages.len(), 1000);

        let done = host.finish_pipeline(&a.caller_id, false).unwrap();
        assert_eq!(done.released_tags, 1);
        assert_eq!(done.stages, 1000);
        assert!(a.pipeline().is_empty());
        assert_eq!(host.stats().exclusive_tags, 0);
        assert_eq!(host.stats().callers, 2);

        // The next pipeline of the same caller starts from nothing.
        host.add_task(&a, &task, Stage::Primary, TaskKind::Task);
        assert_eq!(a.pipeline().stages.len(), 1);

        assert!(host.exclusive(&b, &args).boolean);
        assert!(host.finish_pipeline(&b.caller_id, true).is_ok());
        assert_eq!(host.stats().callers, 1);
        assert!(matches!(
            host.finish_pipeline(&b.caller_id, false),
            Err(CoreError::UnknownCaller { .. })
        ));
    }

    #[tokio::test]
    async fn test_sweep_finishes_idle_pipelines() {
        let mut cfg = config();
        cfg.pipeline_idle_timeout = Duration::from_millis(50);
        let host = Host::new(cfg).unwrap();
        let a = caller(&host, "deploy", "alice");
        let b = caller(&host, "deploy", "bob");
        let args = ExclusiveArgs {
            tag: String::new(),
            queue_task: true,
        };
        assert!(host.exclusive(&a, &args).boolean);
        host.sweep();
        assert!(!host.exclusive(&b, &args).boolean);

        tokio::time::sleep(Duration::from_millis(120)).await;
        // Resolving b's id counts as activity; a stays silent.
        let b = host.caller(&b.caller_id).unwrap();
        host.sweep();
        assert_eq!(host.stats().exclusive_tags, 0);
        assert!(host.exclusive(&b, &args).boolean);
        assert!(a.pipeline().is_empty());
        assert_eq!(host.stats().callers, 2);
    }

    #[test]
    fn test_email_return_codes() {
        let host = Host::new(config()).unwrap();
        let alice = caller(&host, "links", "alice");
        let bob = caller(&host, "links", "bob");
        let email = EmailArgs {
            subject: "Report".into(),
            body: "done".into(),
            html: false,
        };
        assert_eq!(host.email(&alice, &email).ret_val, RetVal::NoBotEmail);
        assert_eq!(host.email(&bob, &email).ret_val, RetVal::NoUserEmail);

        let mut cfg = config();
        cfg.bot.email = "floyd@example.com".into();
        let host = Host::new(cfg).unwrap();
        let alice = caller(&host, "links", "alice");
        assert_eq!(host.email(&alice, &email).ret_val, RetVal::Ok);

        let user = |name: &str| EmailUserArgs {
            user: name.into(),
            subject: "Report".into(),
            body: String::new(),
            html: false,
        };
        assert_eq!(host.email_user(&user("bob")).ret_val, RetVal::NoUserEmail);
        assert_eq!(host.email_user(&user("carol")).ret_val, RetVal::NoUserEmail);
        assert_eq!(host.email_user(&user("alice")).ret_val, RetVal::Ok);

        let address = |to: &str| EmailAddressArgs {
            address: to.into(),
            subject: "Report".into(),
            body: "<p>done</p>".into(),
            html: true,
        };
        assert_eq!(host.email_address(&address("nowhere")).ret_val, RetVal::MailError);
        assert_eq!(
            host.email_address(&address("ops@example.com")).ret_val,
            RetVal::Ok
        );

        let mail = host.mail();
        assert_eq!(mail.len(), 3);
        assert_eq!(mail[0].to, "alice@example.com");
        assert_eq!(mail[2].to, "ops@example.com");
        assert!(mail[2].html);
    }

    #[tokio::test]
    async fn test_incoming_routes_to_subscriber() {
        let host = Arc::new(Host::new(config()).unwrap());
        let c = host
            .register_caller(
                CallerSpec::new("links")
                    .with_user("alice")
                    .with_channel("general")
                    .with_thread("t9", true),
            )
            .unwrap();
        let msg = IncomingMessage {
            user: "bob".into(),
            channel: "general".into(),
            thread: "t9".into(),
            message: "anything new?".into(),
            ..Default::default()
        };
        assert_eq!(host.incoming(&msg), IncomingResponse::default());

        assert!(host.subscribe(&c).boolean);
        let routed = host.incoming(&msg);
        assert!(!routed.matched);
        assert_eq!(routed.subscriber, "links");

        let elsewhere = IncomingMessage {
            thread: "t10".into(),
            ..msg.clone()
        };
        assert_eq!(host.incoming(&elsewhere).subscriber, "");

        // A waiting prompt takes precedence over the subscription.
        let args = PromptArgs {
            regex_id: "YesNo".into(),
            user: "bob".into(),
            channel: "general".into(),
            thread: "t9".into(),
            prompt: "Sure?".into(),
        };
        let waiting = {
            let host = host.clone();
            let c = c.clone();
            tokio::spawn(async move { host.prompt(&c, &args, MessageFormat::Variable).await })
        };
        while host.stats().prompt_waiters == 0 {
            tokio::task::yield_now().await;
        }
        let reply = IncomingMessage {
            message: "yes".into(),
            ..msg.clone()
        };
        let routed = host.incoming(&reply);
        assert!(routed.matched);
        assert_eq!(routed.subscriber, "");
        assert_eq!(waiting.await.unwrap(), ReplyResponse::matched("yes"));

        assert!(host.unsubscribe(&c).boolean);
        assert_eq!(host.incoming(&msg).subscriber, "");
    }

    #[test]
    fn test_pipeline_additions() {
        let host = Host::new(config()).unwrap();
        let c = caller(&host, "deploy", "alice");
        let task = |name: &str| TaskArgs {
            name: name.into(),
            cmd_args: vec!["x".into()],
        };
        assert_eq!(
            host.add_task(&c, &task("notify"), Stage::Primary, TaskKind::Task).ret_val,
            RetVal::Ok
        );
        assert_eq!(
            host.add_task(&c, &task("notify"), Stage::Final, TaskKind::Job).ret_val,
            RetVal::InvalidTaskType
        );
        assert_eq!(host.spawn_job(&c, &task("deploy")).ret_val, RetVal::Ok);

        let cmd = |command: &str| CommandArgs {
            plugin: "links".into(),
            command: command.into(),
        };
        assert_eq!(
            host.add_command(&c, &cmd("list all"), Stage::Fail).ret_val,
            RetVal::Ok
        );
        assert_eq!(
            host.add_command(&c, &cmd("delete"), Stage::Fail).ret_val,
            RetVal::CommandNotMatched
        );
        assert_eq!(
            host.add_command(&c, &cmd(""), Stage::Fail).ret_val,
            RetVal::MissingArguments
        );

        let p = c.pipeline();
        assert_eq!(p.stages.len(), 2);
        assert_eq!(p.stages[1].args, vec!["list", "all"]);
        assert_eq!(p.spawned.len(), 1);
    }

    #[test]
    fn test_parameters_and_config() {
        let host = Host::new(config()).unwrap();
        let c = caller(&host, "links", "alice");
        let get = |name: &str| GetParameterArgs {
            parameter: name.into(),
        };
        assert_eq!(host.get_parameter(&c, &get("SITE")).str_val, "wiki");
        let set = SetParameterArgs {
            name: "SITE".into(),
            value: "blog".into(),
        };
        assert!(host.set_parameter(&c, &set).boolean);
        assert_eq!(host.get_parameter(&c, &get("SITE")).str_val, "blog");
        assert_eq!(host.get_parameter(&c, &get("NONE")).str_val, "");

        let cfg = host.task_config(&c);
        assert_eq!(cfg.ret_val, RetVal::Ok);
        assert_eq!(cfg.config["max"], 5);

        let d = caller(&host, "deploy", "alice");
        assert_eq!(host.task_config(&d).ret_val, RetVal::NoConfigFound);
    }

    #[test]
    fn test_admin_and_elevate() {
        let host = Host::new(config()).unwrap();
        let alice = caller(&host, "links", "alice");
        let bob = caller(&host, "links", "bob");
        assert!(host.check_admin(&alice).boolean);
        assert!(!host.check_admin(&bob).boolean);
        assert!(host.elevate(&alice, &ElevateArgs { immediate: false }).boolean);
        assert!(!host.elevate(&bob, &ElevateArgs { immediate: true }).boolean);
    }

    #[test]
    fn test_messaging() {
        let host = Host::new(config()).unwrap();
        let c = caller(&host, "links", "alice");
        let fmt = MessageFormat::Fixed;
        let channel = ChannelThreadMessageArgs {
            channel: "general".into(),
            thread: "t1".into(),
            message: "hi".into(),
        };
        assert_eq!(host.send_channel_thread_message(&c, &channel, fmt).ret_val, RetVal::Ok);
        let dm = UserMessageArgs {
            user: "carol".into(),
            message: "hi".into(),
        };
        assert_eq!(host.send_user_message(&c, &dm, fmt).ret_val, RetVal::UserNotFound);
        let proto = ProtocolUserChannelMessageArgs {
            protocol: "slack".into(),
            user: "alice".into(),
            channel: "general".into(),
            message: "hi".into(),
        };
        assert_eq!(
            host.send_protocol_user_channel_message(&proto, fmt).ret_val,
            RetVal::FailedMessageSend
        );
        let sent = host.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].format, MessageFormat::Fixed);
        assert_eq!(sent[0].thread, "t1");
    }

    #[test]
    fn test_log_levels() {
        let host = Host::new(config()).unwrap();
        let c = caller(&host, "links", "alice");
        let log = |level: &str| LogArgs {
            level: level.into(),
            message: "hello".into(),
        };
        assert_eq!(host.log(&c, &log("warn")).ret_val, RetVal::Ok);
        assert_eq!(host.log(&c, &log("Audit")).ret_val, RetVal::Ok);
        assert_eq!(host.log(&c, &log("loud")).ret_val, RetVal::Failed);
    }
}
