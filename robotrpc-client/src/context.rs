//! Caller identity read from the environment a plugin is launched with.

use crate::error::ClientError;
use robotrpc_protocol::{MessageFormat, Protocol};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Base URL of the host; calls go to `<base>/json`.
pub const ENV_HTTP_POST: &str = "GOPHER_HTTP_POST";
pub const ENV_CALLER_ID: &str = "GOPHER_CALLER_ID";
/// Older name for the caller id.
pub const ENV_PLUGIN_ID: &str = "GOPHER_PLUGIN_ID";
pub const ENV_USER: &str = "GOPHER_USER";
pub const ENV_CHANNEL: &str = "GOPHER_CHANNEL";
pub const ENV_THREAD_ID: &str = "GOPHER_THREAD_ID";
pub const ENV_THREADED_MESSAGE: &str = "GOPHER_THREADED_MESSAGE";
pub const ENV_PROTOCOL: &str = "GOPHER_PROTOCOL";
pub const ENV_INSTALLDIR: &str = "GOPHER_INSTALLDIR";

/// Caller id value meaning "read the id from the first line of stdin".
pub const CALLER_ID_STDIN: &str = "stdin";

static STDIN_CALLER_ID: OnceLock<String> = OnceLock::new();

/// Where the message that started the pipeline came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub user: String,
    /// Empty for a direct message.
    pub channel: String,
    pub thread_id: String,
    pub protocol: Option<Protocol>,
    pub format: MessageFormat,
}

/// Who is calling and where the conversation is happening.
///
/// Built once per process and shared by every [`crate::Robot`] derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotContext {
    pub http_post: String,
    pub caller_id: String,
    pub user: String,
    /// Empty for a direct message.
    pub channel: String,
    pub thread_id: String,
    /// Whether the triggering message was itself posted in a thread.
    pub threaded_message: bool,
    /// Lowercase protocol name.
    pub protocol: String,
    pub install_dir: Option<PathBuf>,
}

impl RobotContext {
    pub fn new(http_post: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            http_post: http_post.into(),
            caller_id: caller_id.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>, threaded_message: bool) -> Self {
        self.thread_id = thread_id.into();
        self.threaded_message = threaded_message;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Reads the context from the process environment.
    ///
    /// A caller id of `stdin` is read from the first line of standard input,
    /// once per process.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|name| std::env::var(name).ok(), stdin_caller_id)
    }

    /// Builds the context from an arbitrary variable lookup.
    pub fn from_lookup<F, S>(lookup: F, read_stdin: S) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
        S: FnOnce() -> Result<String, ClientError>,
    {
        let var = |name: &str| lookup(name).unwrap_or_default();

        let http_post = var(ENV_HTTP_POST);
        if http_post.is_empty() {
            return Err(ClientError::Environment(ENV_HTTP_POST.to_string()));
        }

        let mut caller_id = var(ENV_CALLER_ID);
        if caller_id.is_empty() {
            caller_id = var(ENV_PLUGIN_ID);
        }
        if caller_id == CALLER_ID_STDIN {
            caller_id = read_stdin()?;
        }
        if caller_id.is_empty() {
            return Err(ClientError::Environment(ENV_CALLER_ID.to_string()));
        }

        Ok(Self {
            http_post,
            caller_id,
            user: var(ENV_USER),
            channel: var(ENV_CHANNEL),
            thread_id: var(ENV_THREAD_ID),
            threaded_message: is_truthy(&var(ENV_THREADED_MESSAGE)),
            protocol: var(ENV_PROTOCOL),
            install_dir: lookup(ENV_INSTALLDIR)
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_wire(&self.protocol)
    }

    pub fn is_direct(&self) -> bool {
        self.channel.is_empty()
    }

    /// Thread to answer in: the message's thread when it was threaded.
    pub fn reply_thread(&self) -> &str {
        if self.threaded_message {
            &self.thread_id
        } else {
            ""
        }
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "false" | "0" | "no"
    )
}

fn stdin_caller_id() -> Result<String, ClientError> {
    if let Some(id) = STDIN_CALLER_ID.get() {
        return Ok(id.clone());
    }
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let id = line.trim().to_string();
    Ok(STDIN_CALLER_ID.get_or_init(|| id).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn no_stdin() -> Result<String, ClientError> {
        panic!("stdin should not be read");
    }

    #[test]
    fn test_from_lookup() {
        let vars = env(&[
            (ENV_HTTP_POST, "http://127.0.0.1:8880"),
            (ENV_CALLER_ID, "c-1"),
            (ENV_USER, "alice"),
            (ENV_CHANNEL, "general"),
            (ENV_THREAD_ID, "t-1"),
            (ENV_THREADED_MESSAGE, "true"),
            (ENV_PROTOCOL, "slack"),
            (ENV_INSTALLDIR, "/opt/robot"),
        ]);
        let ctx = RobotContext::from_lookup(|k| vars.get(k).cloned(), no_stdin).unwrap();
        assert_eq!(ctx.caller_id, "c-1");
        assert_eq!(ctx.user, "alice");
        assert_eq!(ctx.reply_thread(), "t-1");
        assert_eq!(ctx.protocol(), Some(Protocol::Slack));
        assert_eq!(ctx.install_dir, Some(PathBuf::from("/opt/robot")));
        assert!(!ctx.is_direct());
    }

    #[test]
    fn test_plugin_id_fallback() {
        let vars = env(&[(ENV_HTTP_POST, "http://h"), (ENV_PLUGIN_ID, "p-7")]);
        let ctx = RobotContext::from_lookup(|k| vars.get(k).cloned(), no_stdin).unwrap();
        assert_eq!(ctx.caller_id, "p-7");
        assert!(ctx.is_direct());
        assert!(!ctx.threaded_message);
        assert_eq!(ctx.reply_thread(), "");
        assert_eq!(ctx.install_dir, None);
    }

    #[test]
    fn test_caller_id_from_stdin() {
        let vars = env(&[(ENV_HTTP_POST, "http://h"), (ENV_CALLER_ID, "stdin")]);
        let ctx =
            RobotContext::from_lookup(|k| vars.get(k).cloned(), || Ok("c-stdin".into())).unwrap();
        assert_eq!(ctx.caller_id, "c-stdin");
    }

    #[test]
    fn test_missing_environment() {
        let vars = env(&[(ENV_CALLER_ID, "c-1")]);
        let err = RobotContext::from_lookup(|k| vars.get(k).cloned(), no_stdin).unwrap_err();
        assert!(matches!(err, ClientError::Environment(ref v) if v == ENV_HTTP_POST));

        let vars = env(&[(ENV_HTTP_POST, "http://h")]);
        let err = RobotContext::from_lookup(|k| vars.get(k).cloned(), no_stdin).unwrap_err();
        assert!(matches!(err, ClientError::Environment(ref v) if v == ENV_CALLER_ID));
    }

    #[test]
    fn test_truthy() {
        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("False"));
    }

    #[test]
    fn test_builder() {
        let ctx = RobotContext::new("http://h", "c-1")
            .with_user("bob")
            .with_channel("ops")
            .with_thread("t-2", false)
            .with_protocol("terminal");
        assert_eq!(ctx.protocol(), Some(Protocol::Terminal));
        assert_eq!(ctx.reply_thread(), "");
    }
}
