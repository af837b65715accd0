//! robotrpc-cli - Command-line interface for robot RPC hosts
//!
//! Issues calls the way a plugin would, either one-shot or from a REPL.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use robotrpc_client::context::{ENV_CALLER_ID, ENV_CHANNEL, ENV_HTTP_POST, ENV_USER};
use robotrpc_client::{Robot, RobotContext, TransportConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "robotrpc-cli")]
#[command(about = "Command-line interface for robot RPC hosts")]
#[command(version)]
struct Cli {
    /// Host base URL
    #[arg(short = 'u', long, env = ENV_HTTP_POST, default_value = "http://127.0.0.1:8880")]
    url: String,

    /// Caller id registered with the host
    #[arg(short, long, env = ENV_CALLER_ID)]
    caller_id: String,

    /// User the calls are made on behalf of
    #[arg(long, env = ENV_USER, default_value = "")]
    user: String,

    /// Channel the calls are made in (empty for direct messages)
    #[arg(long, env = ENV_CHANNEL, default_value = "")]
    channel: String,

    /// Thread id
    #[arg(long, default_value = "")]
    thread: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "60")]
    timeout: u64,

    /// Fail on non-2xx responses instead of decoding their return code
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Check whether the user is a robot administrator
    CheckAdmin,

    /// Request elevated privileges
    Elevate {
        /// Ask again even if already elevated
        #[arg(long)]
        immediate: bool,
    },

    /// Send a message where the command was issued
    Say {
        /// Message text
        message: String,
    },

    /// Send a direct message to a user
    SendUser {
        user: String,
        message: String,
    },

    /// Send a message to a channel
    SendChannel {
        channel: String,
        message: String,

        /// Thread to post in
        #[arg(short, long, default_value = "")]
        thread: String,
    },

    /// Look up an attribute of the robot, the sender or another user
    Attribute {
        /// Attribute name (name, email, fullname, ...)
        attribute: String,

        /// Look up the robot instead of the sender
        #[arg(long, conflicts_with = "of")]
        bot: bool,

        /// Look up another user
        #[arg(long)]
        of: Option<String>,
    },

    /// Prompt the user and wait for a reply
    Prompt {
        /// Reply matcher id (e.g. YesNo)
        regex_id: String,

        /// Prompt text
        prompt: String,
    },

    /// Read a datum from long-term memory
    GetDatum {
        key: String,
    },

    /// Replace a datum in long-term memory
    SetDatum {
        key: String,

        /// Datum JSON (or @file.json to read from file)
        datum: String,
    },

    /// Store a short-term memory
    Remember {
        key: String,
        value: String,

        /// Visible to the whole channel
        #[arg(long)]
        shared: bool,
    },

    /// Recall a short-term memory
    Recall {
        key: String,

        #[arg(long)]
        shared: bool,
    },

    /// Send an email to the sender, another user or an address
    Email {
        subject: String,
        body: String,

        /// Mail this user instead of the sender
        #[arg(long, conflicts_with = "address")]
        user: Option<String>,

        /// Mail this address instead of the sender
        #[arg(long)]
        address: Option<String>,

        /// Send the body as HTML
        #[arg(long)]
        html: bool,
    },

    /// Add a job to the pipeline
    AddJob {
        name: String,
        args: Vec<String>,
    },

    /// Add a task to the pipeline
    AddTask {
        name: String,
        args: Vec<String>,
    },

    /// Add a plugin command to the pipeline
    AddCommand {
        plugin: String,
        command: String,
    },

    /// Set a pipeline parameter
    SetParameter {
        name: String,
        value: String,
    },

    /// Read a pipeline parameter
    GetParameter {
        name: String,
    },

    /// Write to the robot's log
    Log {
        /// Level (trace, debug, info, audit, warn, error, fatal)
        level: String,
        message: String,
    },

    /// Show the caller task's configuration
    TaskConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!("Calling {} as {}", cli.url, cli.caller_id);

    let context = RobotContext::new(&cli.url, &cli.caller_id)
        .with_user(&cli.user)
        .with_channel(&cli.channel)
        .with_thread(&cli.thread, !cli.thread.is_empty());
    let config = TransportConfig::new()
        .with_timeout(Duration::from_secs(cli.timeout))
        .with_throw_on_http_error(cli.strict);
    let robot = Robot::connect(context, config).map_err(|e| {
        eprintln!("{}: {}", "Invalid host".red(), e);
        e
    })?;

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(robot).await?;
        }
        Some(cmd) => match commands::execute(&robot, cmd).await {
            Ok(output) => {
                println!("{}", output);
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
