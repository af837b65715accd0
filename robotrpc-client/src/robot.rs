//! The robot API plugins program against.

use crate::context::{Message, RobotContext};
use crate::error::ClientError;
use crate::memory::Memory;
use crate::prompt::{PromptFlow, PromptStep};
use crate::transport::{HttpTransport, Transport, TransportConfig, TransportRequest};
use rand::seq::SliceRandom;
use rand::Rng;
use robotrpc_protocol::message::*;
use robotrpc_protocol::{Decoder, Encoder, LogLevel, MessageFormat, RetVal};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Prefix for memories recorded with [`Robot::remember_context`].
pub const CONTEXT_PREFIX: &str = "context:";

/// Handle for calling the robot host.
///
/// Cheap to clone; derived robots ([`Robot::direct`], [`Robot::threaded`],
/// [`Robot::message_format`]) share the transport.
pub struct Robot<T: Transport = HttpTransport> {
    context: RobotContext,
    transport: Arc<T>,
    format: Option<MessageFormat>,
}

impl<T: Transport> Clone for Robot<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            transport: self.transport.clone(),
            format: self.format,
        }
    }
}

impl Robot<HttpTransport> {
    /// Creates a robot from the process environment with default transport
    /// settings.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::connect(RobotContext::from_env()?, TransportConfig::default())
    }

    /// Creates a robot posting to `context.http_post`.
    pub fn connect(context: RobotContext, config: TransportConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&context.http_post, config)?;
        Ok(Self::with_transport(context, transport))
    }
}

impl<T: Transport> Robot<T> {
    pub fn with_transport(context: RobotContext, transport: T) -> Self {
        Self {
            context,
            transport: Arc::new(transport),
            format: None,
        }
    }

    pub fn context(&self) -> &RobotContext {
        &self.context
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn format(&self) -> Option<MessageFormat> {
        self.format
    }

    // =========================================================================
    // Derived robots
    // =========================================================================

    /// A robot that talks to the user by direct message.
    pub fn direct(&self) -> Self {
        let mut bot = self.clone();
        bot.context.channel.clear();
        bot.context.thread_id.clear();
        bot.context.threaded_message = false;
        bot
    }

    /// A robot that answers in the message's thread.
    pub fn threaded(&self) -> Self {
        let mut bot = self.clone();
        bot.context.threaded_message = !bot.context.channel.is_empty();
        bot
    }

    /// A robot sending messages in the given format.
    pub fn message_format(&self, format: MessageFormat) -> Self {
        let mut bot = self.clone();
        bot.format = Some(format);
        bot
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request<R: DeserializeOwned>(&self, call: FuncCall) -> Result<R, ClientError> {
        let func = call.func_name();
        let format = self.format.map(MessageFormat::as_wire).unwrap_or("");
        let envelope = CallEnvelope::new(self.context.caller_id.as_str(), call).with_format(format);
        let body = Encoder::encode_call(&envelope)?;

        tracing::debug!("Calling {} for {}", func, self.context.caller_id);
        let response = self
            .transport
            .send(TransportRequest {
                caller_id: self.context.caller_id.clone(),
                body,
            })
            .await?;

        Ok(Decoder::new().decode_response(&response)?)
    }

    async fn ret_val(&self, call: FuncCall) -> Result<RetVal, ClientError> {
        let response: RetValResponse = self.request(call).await?;
        Ok(response.ret_val)
    }

    async fn boolean(&self, call: FuncCall) -> Result<bool, ClientError> {
        let response: BoolResponse = self.request(call).await?;
        Ok(response.boolean)
    }

    async fn str_val(&self, call: FuncCall) -> Result<String, ClientError> {
        let response: StrResponse = self.request(call).await?;
        Ok(response.str_val)
    }

    // =========================================================================
    // Identity and privileges
    // =========================================================================

    /// Whether the user is a robot administrator.
    pub async fn check_admin(&self) -> Result<bool, ClientError> {
        self.boolean(FuncCall::CheckAdmin(NoArgs {})).await
    }

    /// Requests privilege elevation for the user.
    pub async fn elevate(&self, immediate: bool) -> Result<bool, ClientError> {
        self.boolean(FuncCall::Elevate(ElevateArgs { immediate }))
            .await
    }

    /// Subscribes the plugin to the current thread, so later messages there
    /// are routed to it.
    pub async fn subscribe(&self) -> Result<bool, ClientError> {
        self.boolean(FuncCall::Subscribe(NoArgs {})).await
    }

    pub async fn unsubscribe(&self) -> Result<bool, ClientError> {
        self.boolean(FuncCall::Unsubscribe(NoArgs {})).await
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub async fn get_sender_attribute(
        &self,
        attribute: &str,
    ) -> Result<AttributeResponse, ClientError> {
        self.request(FuncCall::GetSenderAttribute(AttributeArgs {
            attribute: attribute.to_string(),
        }))
        .await
    }

    pub async fn get_bot_attribute(&self, attribute: &str) -> Result<AttributeResponse, ClientError> {
        self.request(FuncCall::GetBotAttribute(AttributeArgs {
            attribute: attribute.to_string(),
        }))
        .await
    }

    pub async fn get_user_attribute(
        &self,
        user: &str,
        attribute: &str,
    ) -> Result<AttributeResponse, ClientError> {
        self.request(FuncCall::GetUserAttribute(UserAttributeArgs {
            user: user.to_string(),
            attribute: attribute.to_string(),
        }))
        .await
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    pub async fn send_channel_thread_message(
        &self,
        channel: &str,
        thread: &str,
        message: &str,
    ) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::SendChannelThreadMessage(ChannelThreadMessageArgs {
            channel: channel.to_string(),
            thread: thread.to_string(),
            message: message.to_string(),
        }))
        .await
    }

    pub async fn send_channel_message(
        &self,
        channel: &str,
        message: &str,
    ) -> Result<RetVal, ClientError> {
        self.send_channel_thread_message(channel, "", message).await
    }

    pub async fn send_user_message(&self, user: &str, message: &str) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::SendUserMessage(UserMessageArgs {
            user: user.to_string(),
            message: message.to_string(),
        }))
        .await
    }

    /// Sends a message to a channel thread, addressed to a user.
    pub async fn send_user_channel_thread_message(
        &self,
        user: &str,
        channel: &str,
        thread: &str,
        message: &str,
    ) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::SendUserChannelThreadMessage(
            UserChannelThreadMessageArgs {
                user: user.to_string(),
                channel: channel.to_string(),
                thread: thread.to_string(),
                message: message.to_string(),
            },
        ))
        .await
    }

    pub async fn send_user_channel_message(
        &self,
        user: &str,
        channel: &str,
        message: &str,
    ) -> Result<RetVal, ClientError> {
        self.send_user_channel_thread_message(user, channel, "", message)
            .await
    }

    /// Sends a message over a protocol other than the caller's own.
    pub async fn send_protocol_user_channel_message(
        &self,
        protocol: &str,
        user: &str,
        channel: &str,
        message: &str,
    ) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::SendProtocolUserChannelMessage(
            ProtocolUserChannelMessageArgs {
                protocol: protocol.to_string(),
                user: user.to_string(),
                channel: channel.to_string(),
                message: message.to_string(),
            },
        ))
        .await
    }

    /// Posts to the conversation the command came from.
    pub async fn say(&self, message: &str) -> Result<RetVal, ClientError> {
        if self.context.is_direct() {
            return self.send_user_message(&self.context.user, message).await;
        }
        self.send_channel_thread_message(&self.context.channel, self.context.reply_thread(), message)
            .await
    }

    /// Posts to the message's thread, starting one if needed.
    pub async fn say_thread(&self, message: &str) -> Result<RetVal, ClientError> {
        if self.context.is_direct() {
            return self.send_user_message(&self.context.user, message).await;
        }
        self.send_channel_thread_message(&self.context.channel, &self.context.thread_id, message)
            .await
    }

    /// Like [`Robot::say`], addressed to the user.
    pub async fn reply(&self, message: &str) -> Result<RetVal, ClientError> {
        if self.context.is_direct() {
            return self.send_user_message(&self.context.user, message).await;
        }
        self.send_user_channel_thread_message(
            &self.context.user,
            &self.context.channel,
            self.context.reply_thread(),
            message,
        )
        .await
    }

    pub async fn reply_thread(&self, message: &str) -> Result<RetVal, ClientError> {
        if self.context.is_direct() {
            return self.send_user_message(&self.context.user, message).await;
        }
        self.send_user_channel_thread_message(
            &self.context.user,
            &self.context.channel,
            &self.context.thread_id,
            message,
        )
        .await
    }

    // =========================================================================
    // Prompting
    // =========================================================================

    /// Prompts a user and waits for a reply matching `regex_id`.
    ///
    /// An empty `channel` prompts by direct message. `RetryPrompt` answers
    /// are absorbed here; the result carries one of the terminal codes.
    pub async fn prompt_user_channel_thread_for_reply(
        &self,
        regex_id: &str,
        user: &str,
        channel: &str,
        thread: &str,
        prompt: &str,
    ) -> Result<ReplyResponse, ClientError> {
        let call = FuncCall::PromptUserChannelThreadForReply(PromptArgs {
            regex_id: regex_id.to_string(),
            user: user.to_string(),
            channel: channel.to_string(),
            thread: thread.to_string(),
            prompt: prompt.to_string(),
        });

        let mut flow = PromptFlow::new();
        loop {
            let reply: ReplyResponse = self.request(call.clone()).await?;
            match flow.observe(reply) {
                PromptStep::Resend => {
                    tracing::debug!(
                        "Prompt for {} contended, resending (attempt {})",
                        user,
                        flow.attempts() + 1
                    );
                }
                PromptStep::Finished(reply) => return Ok(reply),
            }
        }
    }

    /// Prompts the user where the command was issued.
    pub async fn prompt_for_reply(
        &self,
        regex_id: &str,
        prompt: &str,
    ) -> Result<ReplyResponse, ClientError> {
        self.prompt_user_channel_thread_for_reply(
            regex_id,
            &self.context.user,
            &self.context.channel,
            self.context.reply_thread(),
            prompt,
        )
        .await
    }

    pub async fn prompt_thread_for_reply(
        &self,
        regex_id: &str,
        prompt: &str,
    ) -> Result<ReplyResponse, ClientError> {
        self.prompt_user_channel_thread_for_reply(
            regex_id,
            &self.context.user,
            &self.context.channel,
            &self.context.thread_id,
            prompt,
        )
        .await
    }

    /// Prompts a user by direct message.
    pub async fn prompt_user_for_reply(
        &self,
        regex_id: &str,
        user: &str,
        prompt: &str,
    ) -> Result<ReplyResponse, ClientError> {
        self.prompt_user_channel_thread_for_reply(regex_id, user, "", "", prompt)
            .await
    }

    pub async fn prompt_user_channel_for_reply(
        &self,
        regex_id: &str,
        user: &str,
        channel: &str,
        prompt: &str,
    ) -> Result<ReplyResponse, ClientError> {
        self.prompt_user_channel_thread_for_reply(regex_id, user, channel, "", prompt)
            .await
    }

    // =========================================================================
    // Long-term memory
    // =========================================================================

    /// Checks out a datum. With `rw` the memory holds a lock token that must
    /// be spent on [`Robot::update_datum`] or [`Robot::checkin_datum`].
    pub async fn checkout_datum(&self, key: &str, rw: bool) -> Result<Memory, ClientError> {
        let response: CheckoutResponse = self
            .request(FuncCall::CheckoutDatum(CheckoutArgs {
                key: key.to_string(),
                rw,
            }))
            .await?;
        Ok(Memory::from_checkout(key, response))
    }

    /// Stores the memory's datum and releases its lock.
    ///
    /// `DatumLockExpired` means another writer got the lock first; check the
    /// datum out again to retry.
    pub async fn update_datum(&self, memory: Memory) -> Result<RetVal, ClientError> {
        let (key, token, datum) = memory.into_parts();
        let ret = self
            .ret_val(FuncCall::UpdateDatum(UpdateArgs {
                key: key.clone(),
                token,
                datum,
            }))
            .await?;
        if ret == RetVal::DatumLockExpired {
            tracing::warn!("Lock on datum {} expired before update", key);
        }
        Ok(ret)
    }

    /// Releases the memory's lock without changing the datum.
    pub async fn checkin_datum(&self, memory: Memory) -> Result<(), ClientError> {
        let (key, token, _) = memory.into_parts();
        self.ret_val(FuncCall::CheckinDatum(CheckinArgs { key, token }))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Short-term memory
    // =========================================================================

    /// Remembers a value for the user in this conversation. A threaded
    /// message stores it in the thread.
    pub async fn remember(&self, key: &str, value: &str, shared: bool) -> Result<RetVal, ClientError> {
        let args = RememberArgs {
            key: key.to_string(),
            value: value.to_string(),
            shared,
        };
        if self.context.threaded_message {
            self.ret_val(FuncCall::RememberThread(args)).await
        } else {
            self.ret_val(FuncCall::Remember(args)).await
        }
    }

    /// Remembers a value in the message's thread.
    pub async fn remember_thread(
        &self,
        key: &str,
        value: &str,
        shared: bool,
    ) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::RememberThread(RememberArgs {
            key: key.to_string(),
            value: value.to_string(),
            shared,
        }))
        .await
    }

    /// Remembers what "it" refers to, e.g. `remember_context("server", "web1")`.
    pub async fn remember_context(&self, name: &str, value: &str) -> Result<RetVal, ClientError> {
        self.remember(&format!("{}{}", CONTEXT_PREFIX, name), value, false)
            .await
    }

    pub async fn remember_context_thread(
        &self,
        name: &str,
        value: &str,
    ) -> Result<RetVal, ClientError> {
        self.remember_thread(&format!("{}{}", CONTEXT_PREFIX, name), value, false)
            .await
    }

    /// Recalls a short-term memory; empty when unset or expired.
    pub async fn recall(&self, key: &str, shared: bool) -> Result<String, ClientError> {
        self.str_val(FuncCall::Recall(RecallArgs {
            key: key.to_string(),
            shared,
        }))
        .await
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Claims an exclusive tag for this pipeline. When denied and
    /// `queue_task` is set, the host re-queues the pipeline.
    pub async fn exclusive(&self, tag: &str, queue_task: bool) -> Result<bool, ClientError> {
        self.boolean(FuncCall::Exclusive(ExclusiveArgs {
            tag: tag.to_string(),
            queue_task,
        }))
        .await
    }

    fn task_args(name: &str, args: &[&str]) -> TaskArgs {
        TaskArgs {
            name: name.to_string(),
            cmd_args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn command_args(plugin: &str, command: &str) -> CommandArgs {
        CommandArgs {
            plugin: plugin.to_string(),
            command: command.to_string(),
        }
    }

    pub async fn add_task(&self, name: &str, args: &[&str]) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::AddTask(Self::task_args(name, args)))
            .await
    }

    pub async fn add_job(&self, name: &str, args: &[&str]) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::AddJob(Self::task_args(name, args)))
            .await
    }

    pub async fn final_task(&self, name: &str, args: &[&str]) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::FinalTask(Self::task_args(name, args)))
            .await
    }

    pub async fn fail_task(&self, name: &str, args: &[&str]) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::FailTask(Self::task_args(name, args)))
            .await
    }

    /// Starts a job in a new pipeline of its own.
    pub async fn spawn_job(&self, name: &str, args: &[&str]) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::SpawnJob(Self::task_args(name, args)))
            .await
    }

    pub async fn add_command(&self, plugin: &str, command: &str) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::AddCommand(Self::command_args(plugin, command)))
            .await
    }

    pub async fn final_command(&self, plugin: &str, command: &str) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::FinalCommand(Self::command_args(plugin, command)))
            .await
    }

    pub async fn fail_command(&self, plugin: &str, command: &str) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::FailCommand(Self::command_args(plugin, command)))
            .await
    }

    pub async fn set_parameter(&self, name: &str, value: &str) -> Result<bool, ClientError> {
        self.boolean(FuncCall::SetParameter(SetParameterArgs {
            name: name.to_string(),
            value: value.to_string(),
        }))
        .await
    }

    pub async fn get_parameter(&self, name: &str) -> Result<String, ClientError> {
        self.str_val(FuncCall::GetParameter(GetParameterArgs {
            parameter: name.to_string(),
        }))
        .await
    }

    pub async fn set_working_directory(&self, path: &str) -> Result<bool, ClientError> {
        self.boolean(FuncCall::SetWorkingDirectory(WorkingDirectoryArgs {
            path: path.to_string(),
        }))
        .await
    }

    // =========================================================================
    // Email
    // =========================================================================

    /// Mails the user who started the pipeline.
    pub async fn email(&self, subject: &str, body: &str, html: bool) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::Email(EmailArgs {
            subject: subject.to_string(),
            body: body.to_string(),
            html,
        }))
        .await
    }

    pub async fn email_user(
        &self,
        user: &str,
        subject: &str,
        body: &str,
        html: bool,
    ) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::EmailUser(EmailUserArgs {
            user: user.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            html,
        }))
        .await
    }

    pub async fn email_address(
        &self,
        address: &str,
        subject: &str,
        body: &str,
        html: bool,
    ) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::EmailAddress(EmailAddressArgs {
            address: address.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            html,
        }))
        .await
    }

    // =========================================================================
    // Misc
    // =========================================================================

    /// The message that started the pipeline. Answered locally.
    pub fn get_message(&self) -> Message {
        Message {
            user: self.context.user.clone(),
            channel: self.context.channel.clone(),
            thread_id: self.context.thread_id.clone(),
            protocol: self.context.protocol(),
            format: self.format.unwrap_or(MessageFormat::Variable),
        }
    }

    /// Writes to the robot's log.
    pub async fn log(&self, level: LogLevel, message: &str) -> Result<RetVal, ClientError> {
        self.ret_val(FuncCall::Log(LogArgs {
            level: level.as_str().to_string(),
            message: message.to_string(),
        }))
        .await
    }

    pub async fn get_task_config(&self) -> Result<TaskConfigResponse, ClientError> {
        self.request(FuncCall::GetTaskConfig(NoArgs {})).await
    }

    /// Decodes the task's configuration, `None` when it has none.
    pub async fn task_config<C: DeserializeOwned>(&self) -> Result<Option<C>, ClientError> {
        let response = self.get_task_config().await?;
        if response.ret_val != RetVal::Ok || response.config.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(response.config)?))
    }

    /// Picks one of `choices` at random.
    pub fn random_string<'a>(&self, choices: &[&'a str]) -> Option<&'a str> {
        choices.choose(&mut rand::thread_rng()).copied()
    }

    /// A random number in `0..n`, `None` when `n` is zero.
    pub fn random_int(&self, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..n))
    }

    pub async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
