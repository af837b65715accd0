//! Command execution.

use crate::Commands;
use colored::Colorize;
use robotrpc_client::{LogLevel, RetVal, Robot};
use serde_json::Value;

/// Executes a command and returns the formatted output.
pub async fn execute(robot: &Robot, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::CheckAdmin => Ok(format_bool(robot.check_admin().await?)),

        Commands::Elevate { immediate } => Ok(format_bool(robot.elevate(immediate).await?)),

        Commands::Say { message } => Ok(format_ret(robot.say(&message).await?)),

        Commands::SendUser { user, message } => {
            Ok(format_ret(robot.send_user_message(&user, &message).await?))
        }

        Commands::SendChannel {
            channel,
            message,
            thread,
        } => Ok(format_ret(
            robot
                .send_channel_thread_message(&channel, &thread, &message)
                .await?,
        )),

        Commands::Attribute { attribute, bot, of } => {
            let attr = match (bot, of) {
                (true, _) => robot.get_bot_attribute(&attribute).await?,
                (false, Some(user)) => robot.get_user_attribute(&user, &attribute).await?,
                (false, None) => robot.get_sender_attribute(&attribute).await?,
            };
            if attr.ret_val == RetVal::Ok {
                Ok(attr.attribute)
            } else {
                Ok(format_ret(attr.ret_val))
            }
        }

        Commands::Prompt { regex_id, prompt } => {
            let reply = robot.prompt_for_reply(&regex_id, &prompt).await?;
            if reply.ret_val == RetVal::Ok {
                Ok(reply.reply)
            } else {
                Ok(format_ret(reply.ret_val))
            }
        }

        Commands::GetDatum { key } => {
            let memory = robot.checkout_datum(&key, false).await?;
            if !memory.exists() {
                return Ok(format!("{} {}", "No datum".yellow(), key.cyan()));
            }
            Ok(format_json(memory.datum()))
        }

        Commands::SetDatum { key, datum } => {
            let datum = parse_json_arg(&datum)?;
            let mut memory = robot.checkout_datum(&key, true).await?;
            if !memory.is_locked() {
                return Ok(format_ret(memory.ret_val()));
            }
            memory.set_datum(datum);
            Ok(format_ret(robot.update_datum(memory).await?))
        }

        Commands::Remember { key, value, shared } => {
            Ok(format_ret(robot.remember(&key, &value, shared).await?))
        }

        Commands::Recall { key, shared } => {
            let value = robot.recall(&key, shared).await?;
            if value.is_empty() {
                Ok(format!("{} {}", "Nothing remembered for".yellow(), key.cyan()))
            } else {
                Ok(value)
            }
        }

        Commands::Email {
            subject,
            body,
            user,
            address,
            html,
        } => {
            let ret = match (user, address) {
                (Some(user), _) => robot.email_user(&user, &subject, &body, html).await?,
                (None, Some(address)) => {
                    robot.email_address(&address, &subject, &body, html).await?
                }
                (None, None) => robot.email(&subject, &body, html).await?,
            };
            Ok(format_ret(ret))
        }

        Commands::AddJob { name, args } => {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            Ok(format_ret(robot.add_job(&name, &args).await?))
        }

        Commands::AddTask { name, args } => {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            Ok(format_ret(robot.add_task(&name, &args).await?))
        }

        Commands::AddCommand { plugin, command } => {
            Ok(format_ret(robot.add_command(&plugin, &command).await?))
        }

        Commands::SetParameter { name, value } => {
            Ok(format_bool(robot.set_parameter(&name, &value).await?))
        }

        Commands::GetParameter { name } => Ok(robot.get_parameter(&name).await?),

        Commands::Log { level, message } => {
            let level = LogLevel::from_wire(&level)
                .ok_or_else(|| format!("unknown log level: {}", level))?;
            Ok(format_ret(robot.log(level, &message).await?))
        }

        Commands::TaskConfig => {
            let config = robot.get_task_config().await?;
            if config.ret_val != RetVal::Ok {
                return Ok(format_ret(config.ret_val));
            }
            Ok(format_json(&config.config))
        }
    }
}

/// Formats a return code, green for `Ok`.
pub(crate) fn format_ret(ret: RetVal) -> String {
    if ret == RetVal::Ok {
        ret.as_str().green().to_string()
    } else {
        format!("{} ({})", ret.as_str().red(), ret.code())
    }
}

pub(crate) fn format_bool(value: bool) -> String {
    if value {
        "true".green().to_string()
    } else {
        "false".yellow().to_string()
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
pub(crate) fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
pub(crate) fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
