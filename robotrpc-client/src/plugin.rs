//! Plugin argument dispatch.
//!
//! The host runs a plugin as `<plugin> <command> [args...]`. `configure` asks
//! for the plugin's default YAML configuration; any other word names a
//! command the plugin handles.

use robotrpc_protocol::TaskRetVal;
use std::future::Future;
use std::io::Write;

/// Word the host passes to request the default configuration.
pub const CONFIGURE_COMMAND: &str = "configure";

/// How an invocation was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The default configuration was printed.
    Configured,
    Command { command: String, args: Vec<String> },
    NotFound(String),
}

/// A plugin's static description: its default configuration and the
/// commands it answers to.
#[derive(Debug, Clone, Default)]
pub struct Plugin {
    default_config: String,
    commands: Vec<String>,
}

impl Plugin {
    pub fn new(default_config: impl Into<String>) -> Self {
        Self {
            default_config: default_config.into(),
            commands: Vec::new(),
        }
    }

    pub fn with_commands(mut self, commands: &[&str]) -> Self {
        self.commands = commands.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn default_config(&self) -> &str {
        &self.default_config
    }

    pub fn handles(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }

    /// Resolves arguments, excluding the program name. `configure` writes the
    /// default configuration to `out`.
    pub fn dispatch<I, W>(&self, args: I, out: &mut W) -> std::io::Result<Dispatch>
    where
        I: IntoIterator<Item = String>,
        W: Write,
    {
        let mut args = args.into_iter();
        let command = args.next().unwrap_or_default();
        if command == CONFIGURE_COMMAND {
            out.write_all(self.default_config.as_bytes())?;
            if !self.default_config.ends_with('\n') {
                out.write_all(b"\n")?;
            }
            out.flush()?;
            return Ok(Dispatch::Configured);
        }
        if self.handles(&command) {
            return Ok(Dispatch::Command {
                command,
                args: args.collect(),
            });
        }
        Ok(Dispatch::NotFound(command))
    }

    /// Dispatches and runs `handler` for a recognized command, returning the
    /// plugin's exit status.
    pub async fn run<I, F, Fut>(&self, args: I, handler: F) -> TaskRetVal
    where
        I: IntoIterator<Item = String>,
        F: FnOnce(String, Vec<String>) -> Fut,
        Fut: Future<Output = TaskRetVal>,
    {
        let mut stdout = std::io::stdout();
        match self.dispatch(args, &mut stdout) {
            Ok(Dispatch::Configured) => TaskRetVal::Normal,
            Ok(Dispatch::Command { command, args }) => handler(command, args).await,
            Ok(Dispatch::NotFound(command)) => {
                tracing::debug!("Unrecognized plugin command {:?}", command);
                TaskRetVal::NotFound
            }
            Err(e) => {
                tracing::error!("Failed to write default configuration: {}", e);
                TaskRetVal::MechanismFail
            }
        }
    }
}
