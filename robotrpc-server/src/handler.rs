//! Robot call handlers.

use crate::error::ServerError;
use crate::metrics::Metrics;
use robotrpc_core::{CallerContext, Host, Stage, TaskKind};
use robotrpc_protocol::{
    Decoder, FinishRequest, FinishResponse, FuncCall, IncomingMessage, IncomingResponse,
    MessageFormat, ProtocolError, RetVal,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Decodes robot calls and carries them out against the host.
pub struct RequestHandler {
    host: Arc<Host>,
    decoder: Decoder,
    metrics: Option<Arc<Metrics>>,
}

fn to_value<T: Serialize>(response: T) -> Result<Value, ServerError> {
    Ok(serde_json::to_value(response)?)
}

impl RequestHandler {
    pub fn new(host: Arc<Host>) -> Self {
        Self {
            host,
            decoder: Decoder::new(),
            metrics: None,
        }
    }

    /// Sets the largest accepted body.
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.decoder = Decoder::new().with_max_body(max_body);
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn max_body(&self) -> usize {
        self.decoder.max_body()
    }

    /// Returns a reference to the metrics, if set.
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Updates gauge metrics from current host state.
    pub fn update_gauge_metrics(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.update_host_stats(self.host.stats());
        }
    }

    fn record_error(&self, err: &ServerError) {
        if let Some(ref metrics) = self.metrics {
            metrics
                .errors_total
                .with_label_values(&[err.error_code()])
                .inc();
        }
    }

    /// Handles a posted call envelope and returns the result record.
    pub async fn handle_call(&self, body: &[u8]) -> Result<Value, ServerError> {
        let result = self.call(body).await;
        if let Err(ref e) = result {
            tracing::debug!("Rejected call: {}", e);
            self.record_error(e);
        }
        result
    }

    async fn call(&self, body: &[u8]) -> Result<Value, ServerError> {
        let envelope = self.decoder.decode_call(body)?;
        let caller = self.host.caller(&envelope.caller_id)?;
        let func = envelope.call.func_name();
        let format = self.host.message_format(&envelope.format);
        tracing::debug!("{} from {} ({})", func, caller.caller_id, caller.task);

        let timer = self.metrics.as_ref().map(|m| {
            m.request_duration
                .with_label_values(&[func.as_str()])
                .start_timer()
        });

        let value = self.dispatch(&caller, envelope.call, format).await?;

        if let Some(ref metrics) = self.metrics {
            metrics
                .requests_total
                .with_label_values(&[func.as_str()])
                .inc();
            if let Some(code) = value.get("RetVal").and_then(Value::as_i64) {
                metrics
                    .retvals_total
                    .with_label_values(&[RetVal::name_of(code)])
                    .inc();
            }
        }
        if let Some(timer) = timer {
            timer.observe_duration();
        }

        Ok(value)
    }

    async fn dispatch(
        &self,
        caller: &CallerContext,
        call: FuncCall,
        format: MessageFormat,
    ) -> Result<Value, ServerError> {
        let host = &self.host;
        match call {
            // Identity and privileges
            FuncCall::CheckAdmin(_) => to_value(host.check_admin(caller)),
            FuncCall::Elevate(args) => to_value(host.elevate(caller, &args)),
            FuncCall::Subscribe(_) => to_value(host.subscribe(caller)),
            FuncCall::Unsubscribe(_) => to_value(host.unsubscribe(caller)),

            // Attributes
            FuncCall::GetSenderAttribute(args) => to_value(host.sender_attribute(caller, &args)),
            FuncCall::GetBotAttribute(args) => to_value(host.bot_attribute(&args)),
            FuncCall::GetUserAttribute(args) => to_value(host.user_attribute(&args)),

            // Messaging
            FuncCall::SendChannelThreadMessage(args) => {
                to_value(host.send_channel_thread_message(caller, &args, format))
            }
            FuncCall::SendUserMessage(args) => {
                to_value(host.send_user_message(caller, &args, format))
            }
            FuncCall::SendUserChannelThreadMessage(args) => {
                to_value(host.send_user_channel_thread_message(caller, &args, format))
            }
            FuncCall::SendProtocolUserChannelMessage(args) => {
                to_value(host.send_protocol_user_channel_message(&args, format))
            }
            FuncCall::PromptUserChannelThreadForReply(args) => {
                to_value(host.prompt(caller, &args, format).await)
            }

            // Long-term memory
            FuncCall::CheckoutDatum(args) => to_value(host.checkout_datum(caller, &args).await),
            FuncCall::UpdateDatum(args) => to_value(host.update_datum(caller, &args)),
            FuncCall::CheckinDatum(args) => to_value(host.checkin_datum(caller, &args)),

            // Short-term memory
            FuncCall::Remember(args) => to_value(host.remember(caller, &args, false)),
            FuncCall::RememberThread(args) => to_value(host.remember(caller, &args, true)),
            FuncCall::Recall(args) => to_value(host.recall(caller, &args)),

            // Email
            FuncCall::Email(args) => to_value(host.email(caller, &args)),
            FuncCall::EmailUser(args) => to_value(host.email_user(&args)),
            FuncCall::EmailAddress(args) => to_value(host.email_address(&args)),

            // Pipelines
            FuncCall::Exclusive(args) => to_value(host.exclusive(caller, &args)),
            FuncCall::AddTask(args) => {
                to_value(host.add_task(caller, &args, Stage::Primary, TaskKind::Task))
            }
            FuncCall::AddJob(args) => {
                to_value(host.add_task(caller, &args, Stage::Primary, TaskKind::Job))
            }
            FuncCall::FinalTask(args) => {
                to_value(host.add_task(caller, &args, Stage::Final, TaskKind::Task))
            }
            FuncCall::FailTask(args) => {
                to_value(host.add_task(caller, &args, Stage::Fail, TaskKind::Task))
            }
            FuncCall::SpawnJob(args) => to_value(host.spawn_job(caller, &args)),
            FuncCall::AddCommand(args) => to_value(host.add_command(caller, &args, Stage::Primary)),
            FuncCall::FinalCommand(args) => to_value(host.add_command(caller, &args, Stage::Final)),
            FuncCall::FailCommand(args) => to_value(host.add_command(caller, &args, Stage::Fail)),
            FuncCall::SetParameter(args) => to_value(host.set_parameter(caller, &args)),
            FuncCall::GetParameter(args) => to_value(host.get_parameter(caller, &args)),
            FuncCall::SetWorkingDirectory(args) => {
                to_value(host.set_working_directory(caller, &args))
            }

            // Misc
            FuncCall::Log(args) => to_value(host.log(caller, &args)),
            FuncCall::GetTaskConfig(_) => to_value(host.task_config(caller)),
        }
    }

    /// Handles a message injected through the test connector.
    pub fn handle_incoming(&self, body: &[u8]) -> Result<IncomingResponse, ServerError> {
        let message: IncomingMessage = self.decoder.decode_response(body)?;
        if message.user.is_empty() {
            let err = ServerError::from(ProtocolError::InvalidArgs {
                func: "incoming".to_string(),
                reason: "missing User".to_string(),
            });
            self.record_error(&err);
            return Err(err);
        }
        let routed = self.host.incoming(&message);
        tracing::debug!(
            "Incoming from {} in {:?}: matched={} subscriber={:?}",
            message.user,
            message.channel,
            routed.matched,
            routed.subscriber
        );
        Ok(routed)
    }

    /// Ends the pipeline of the caller named in the request.
    pub fn handle_finish(&self, body: &[u8]) -> Result<FinishResponse, ServerError> {
        let result = self.finish(body);
        if let Err(ref e) = result {
            tracing::debug!("Rejected finish: {}", e);
            self.record_error(e);
        }
        result
    }

    fn finish(&self, body: &[u8]) -> Result<FinishResponse, ServerError> {
        let request: FinishRequest = self.decoder.decode_response(body)?;
        if request.caller_id.is_empty() {
            return Err(ProtocolError::MissingCallerId.into());
        }
        Ok(self
            .host
            .finish_pipeline(&request.caller_id, request.deregister)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robotrpc_core::{CallerSpec, HostConfig, TaskSpec};
    use serde_json::json;
    use std::time::Duration;

    fn test_handler() -> RequestHandler {
        let mut links = TaskSpec::new("links", TaskKind::Plugin);
        links.commands = vec!["add".into(), "find".into()];
        links.config = json!({"max": 5});
        let mut config = HostConfig::default();
        config.tasks = vec![links, TaskSpec::new("build", TaskKind::Job)];
        config.bot.admins = vec!["alice".into()];
        let host = Arc::new(Host::new(config).unwrap());
        host.register_caller(
            CallerSpec::new("links")
                .with_id("c-1")
                .with_user("alice")
                .with_channel("general"),
        )
        .unwrap();
        RequestHandler::new(host).with_metrics(Arc::new(Metrics::new().unwrap()))
    }

    fn body(func: &str, args: Value) -> Vec<u8> {
        json!({"FuncName": func, "CallerID": "c-1", "Format": "", "FuncArgs": args})
            .to_string()
            .into_bytes()
    }

    #[tokio::test]
    async fn test_check_admin() {
        let handler = test_handler();
        let result = handler
            .handle_call(&body("CheckAdmin", json!({})))
            .await
            .unwrap();
        assert_eq!(result, json!({"Boolean": true}));
    }

    #[tokio::test]
    async fn test_rejects_bad_envelopes() {
        let handler = test_handler();

        let err = handler.handle_call(b"not json").await.unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_REQUEST);

        let err = handler
            .handle_call(&body("Teleport", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_FUNCTION");

        let unknown = json!({"FuncName": "CheckAdmin", "CallerID": "nobody"}).to_string();
        let err = handler.handle_call(unknown.as_bytes()).await.unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_CALLER");

        let missing = json!({"FuncName": "CheckAdmin"}).to_string();
        let err = handler.handle_call(missing.as_bytes()).await.unwrap_err();
        assert_eq!(err.error_code(), "MISSING_CALLER_ID");

        let encoded = String::from_utf8(handler.metrics().unwrap().encode().unwrap()).unwrap();
        assert!(encoded.contains("UNKNOWN_CALLER"));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let handler = test_handler().with_max_body(16);
        let err = handler
            .handle_call(&body("CheckAdmin", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_datum_flow() {
        let handler = test_handler();
        let checkout = handler
            .handle_call(&body("CheckoutDatum", json!({"Key": "ledger", "RW": true})))
            .await
            .unwrap();
        assert_eq!(checkout["Exists"], false);
        assert_eq!(checkout["Datum"], Value::Null);
        let token = checkout["LockToken"].as_str().unwrap().to_string();
        assert!(!token.is_empty());

        let update = handler
            .handle_call(&body(
                "UpdateDatum",
                json!({"Key": "ledger", "Token": token, "Datum": {"n": 1}}),
            ))
            .await
            .unwrap();
        assert_eq!(update["RetVal"], 0);

        let stale = handler
            .handle_call(&body(
                "UpdateDatum",
                json!({"Key": "ledger", "Token": token, "Datum": {"n": 2}}),
            ))
            .await
            .unwrap();
        assert_eq!(stale["RetVal"], RetVal::DatumLockExpired.code());

        let read = handler
            .handle_call(&body("CheckoutDatum", json!({"Key": "ledger", "RW": false})))
            .await
            .unwrap();
        assert_eq!(read["Exists"], true);
        assert_eq!(read["Datum"], json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_remember_recall() {
        let handler = test_handler();
        let r = handler
            .handle_call(&body("Remember", json!({"Key": "k", "Value": "v"})))
            .await
            .unwrap();
        assert_eq!(r["RetVal"], 0);
        let v = handler
            .handle_call(&body("Recall", json!({"Key": "k"})))
            .await
            .unwrap();
        assert_eq!(v["StrVal"], "v");
        let shared = handler
            .handle_call(&body("Recall", json!({"Key": "k", "Shared": true})))
            .await
            .unwrap();
        assert_eq!(shared["StrVal"], "");
    }

    #[tokio::test]
    async fn test_pipeline_and_config() {
        let handler = test_handler();
        let r = handler
            .handle_call(&body("AddJob", json!({"Name": "build"})))
            .await
            .unwrap();
        assert_eq!(r["RetVal"], 0);
        let r = handler
            .handle_call(&body("AddCommand", json!({"Plugin": "links", "Command": "dance"})))
            .await
            .unwrap();
        assert_eq!(r["RetVal"], RetVal::CommandNotMatched.code());
        let r = handler
            .handle_call(&body("GetTaskConfig", json!({})))
            .await
            .unwrap();
        assert_eq!(r["Config"], json!({"max": 5}));
        assert_eq!(r["RetVal"], 0);
    }

    #[tokio::test]
    async fn test_prompt_and_incoming() {
        let handler = Arc::new(test_handler());
        let prompting = handler.clone();
        let waiter = tokio::spawn(async move {
            prompting
                .handle_call(&body(
                    "PromptUserChannelThreadForReply",
                    json!({"RegexID": "YesNo", "User": "alice", "Channel": "general", "Prompt": "Sure?"}),
                ))
                .await
        });

        while handler.host().stats().prompt_waiters == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let sent = handler.host().sent();
        assert_eq!(sent.last().unwrap().message, "Sure?");

        let incoming = json!({"User": "alice", "Channel": "general", "Message": "yes"}).to_string();
        let r = handler.handle_incoming(incoming.as_bytes()).unwrap();
        assert!(r.matched);

        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply, json!({"Reply": "yes", "RetVal": 0}));

        let r = handler.handle_incoming(incoming.as_bytes()).unwrap();
        assert!(!r.matched);
        assert!(handler.handle_incoming(br#"{"Message": "x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_incoming_reports_subscriber() {
        let handler = test_handler();
        handler
            .host()
            .register_caller(
                CallerSpec::new("links")
                    .with_id("c-2")
                    .with_user("alice")
                    .with_channel("general")
                    .with_thread("t1", true),
            )
            .unwrap();
        let subscribe = json!({"FuncName": "Subscribe", "CallerID": "c-2", "FuncArgs": {}});
        let r = handler
            .handle_call(subscribe.to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(r, json!({"Boolean": true}));

        let incoming =
            json!({"User": "bob", "Channel": "general", "Thread": "t1", "Message": "hi"});
        let r = handler
            .handle_incoming(incoming.to_string().as_bytes())
            .unwrap();
        assert!(!r.matched);
        assert_eq!(r.subscriber, "links");
    }

    #[tokio::test]
    async fn test_finish_releases_pipeline() {
        let handler = test_handler();
        let r = handler
            .handle_call(&body("Exclusive", json!({"Tag": "db"})))
            .await
            .unwrap();
        assert_eq!(r, json!({"Boolean": true}));
        handler
            .handle_call(&body("AddJob", json!({"Name": "build"})))
            .await
            .unwrap();

        let done = handler.handle_finish(br#"{"CallerID": "c-1"}"#).unwrap();
        assert_eq!(
            done,
            FinishResponse {
                released_tags: 1,
                stages: 1,
                spawned: 0
            }
        );
        assert_eq!(handler.host().stats().exclusive_tags, 0);

        let done = handler
            .handle_finish(br#"{"CallerID": "c-1", "Deregister": true}"#)
            .unwrap();
        assert_eq!(done.stages, 0);
        assert_eq!(handler.host().stats().callers, 0);

        let err = handler.handle_finish(br#"{"CallerID": "c-1"}"#).unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_CALLER");
        let err = handler.handle_finish(br#"{"CallerID": ""}"#).unwrap_err();
        assert_eq!(err.error_code(), "MISSING_CALLER_ID");
    }

    #[tokio::test]
    async fn test_email_calls() {
        let handler = test_handler();
        let r = handler
            .handle_call(&body("Email", json!({"Subject": "hi"})))
            .await
            .unwrap();
        assert_eq!(r["RetVal"], RetVal::NoUserEmail.code());
        let r = handler
            .handle_call(&body(
                "EmailAddress",
                json!({"Address": "ops@example.com", "Subject": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(r["RetVal"], RetVal::NoBotEmail.code());
    }

    #[tokio::test]
    async fn test_retval_metrics() {
        let handler = test_handler();
        handler
            .handle_call(&body("Log", json!({"Level": "info", "Message": "hello"})))
            .await
            .unwrap();
        handler.update_gauge_metrics();
        let encoded = String::from_utf8(handler.metrics().unwrap().encode().unwrap()).unwrap();
        assert!(encoded.contains(r#"robotrpc_requests_total{func="Log"} 1"#));
        assert!(encoded.contains(r#"robotrpc_retvals_total{retval="Ok"} 1"#));
        assert!(encoded.contains("robotrpc_callers_active 1"));
    }
}
