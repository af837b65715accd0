//! Interactive REPL.

use crate::commands;
use crate::Commands;
use clap::Parser;
use colored::Colorize;
use robotrpc_client::Robot;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Available commands:
  help                            Show this help

  check-admin                     Is the user an administrator
  elevate [--immediate]           Request elevated privileges
  attribute <name> [--bot | --of <user>]  Look up an attribute

  say <message>                   Send where the command was issued
  send-user <user> <message>      Send a direct message
  send-channel <channel> <message> [--thread <id>]
  prompt <regex_id> <prompt>      Prompt the user and wait for a reply

  get-datum <key>                 Read long-term memory
  set-datum <key> <json>          Replace long-term memory
  remember <key> <value> [--shared]
  recall <key> [--shared]

  email <subject> <body> [--user <user> | --address <addr>] [--html]

  add-job <name> [args...]        Add a job to the pipeline
  add-task <name> [args...]       Add a task to the pipeline
  add-command <plugin> <command>  Add a plugin command to the pipeline
  set-parameter <name> <value>
  get-parameter <name>

  log <level> <message>           Write to the robot's log
  task-config                     Show the task configuration

  quit, exit                      Exit the REPL

Quote arguments containing spaces: say "hello there"
"#;

#[derive(Parser)]
#[command(name = "robot", no_binary_name = true, disable_help_flag = true)]
struct ReplLine {
    #[command(subcommand)]
    command: Commands,
}

pub async fn run(robot: Robot) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "robotrpc CLI".bold().cyan());
    println!(
        "Calling {} as {}",
        robot.context().http_post,
        robot.context().caller_id.cyan()
    );

    // Create readline editor
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    // Load history
    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".robotrpc_history"))
        .unwrap_or_else(|_| ".robotrpc_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "robot>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&robot, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break, // Exit command
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    // Save history
    let _ = rl.save_history(&history_path);

    Ok(())
}

async fn execute_repl_command(
    robot: &Robot,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let words = split_args(line)?;
    let Some(first) = words.first() else {
        return Ok(Some(String::new()));
    };

    match first.to_lowercase().as_str() {
        "help" | "?" => return Ok(Some(HELP_TEXT.to_string())),
        "quit" | "exit" | "q" => return Ok(None),
        _ => {}
    }

    match parse_command(&words) {
        Ok(Commands::Repl) => Ok(Some("Already in the REPL".yellow().to_string())),
        Ok(cmd) => commands::execute(robot, cmd).await.map(Some),
        Err(e) => Ok(Some(e.to_string())),
    }
}

fn parse_command(words: &[String]) -> Result<Commands, clap::Error> {
    ReplLine::try_parse_from(words).map(|line| line.command)
}

/// Splits a line into words, keeping double-quoted runs together.
fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
