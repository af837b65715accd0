//! Users, channels and the robot's own identity.

use robotrpc_protocol::{AttributeResponse, Protocol, RetVal};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The robot's own identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotIdentity {
    pub name: String,
    pub alias: String,
    pub email: String,
    pub full_name: String,
    /// Lowercase protocol name the robot is connected with.
    pub protocol: String,
    /// Users allowed to run administrative commands.
    pub admins: Vec<String>,
}

impl Default for BotIdentity {
    fn default() -> Self {
        Self {
            name: "floyd".to_string(),
            alias: ";".to_string(),
            email: String::new(),
            full_name: "Floyd Gopher".to_string(),
            protocol: "test".to_string(),
            admins: Vec::new(),
        }
    }
}

impl BotIdentity {
    pub fn protocol(&self) -> Protocol {
        Protocol::from_wire(&self.protocol).unwrap_or(Protocol::Test)
    }
}

/// A chat user known to the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    pub name: String,
    /// Free-form attributes, e.g. `email`, `firstname`, `phone`.
    pub attributes: HashMap<String, String>,
}

/// Directory configuration.
///
/// An empty user or channel list means the directory is open: any user or
/// channel is accepted for messaging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub users: Vec<UserRecord>,
    pub channels: Vec<String>,
}

/// Attribute names that all resolve to the user's handle.
const HANDLE_ATTRIBUTES: &[&str] = &["name", "username", "handle", "user"];

/// Lookup of users, channels and attributes.
#[derive(Debug, Clone)]
pub struct Directory {
    users: HashMap<String, HashMap<String, String>>,
    channels: HashSet<String>,
    admins: HashSet<String>,
    bot: BotIdentity,
}

impl Directory {
    pub fn new(bot: BotIdentity, config: &DirectoryConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| {
                let attrs = u
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.to_lowercase(), v.clone()))
                    .collect();
                (u.name.clone(), attrs)
            })
            .collect();
        Self {
            users,
            channels: config.channels.iter().cloned().collect(),
            admins: bot.admins.iter().cloned().collect(),
            bot,
        }
    }

    pub fn bot(&self) -> &BotIdentity {
        &self.bot
    }

    /// Whether `user` may be messaged.
    pub fn has_user(&self, user: &str) -> bool {
        !user.is_empty() && (self.users.is_empty() || self.users.contains_key(user))
    }

    /// Whether `channel` may be messaged.
    pub fn has_channel(&self, channel: &str) -> bool {
        !channel.is_empty() && (self.channels.is_empty() || self.channels.contains(channel))
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.contains(user)
    }

    /// Looks up an attribute of a user. Attribute names are case-insensitive.
    pub fn user_attribute(&self, user: &str, attribute: &str) -> AttributeResponse {
        let attribute = attribute.to_lowercase();
        let is_handle = HANDLE_ATTRIBUTES.contains(&attribute.as_str());
        let Some(attrs) = self.users.get(user) else {
            if is_handle && self.has_user(user) {
                return AttributeResponse::found(user);
            }
            return AttributeResponse::missing(RetVal::UserNotFound);
        };
        if is_handle {
            return AttributeResponse::found(user);
        }
        match attrs.get(&attribute) {
            Some(value) if !value.is_empty() => AttributeResponse::found(value.clone()),
            _ => AttributeResponse::missing(RetVal::AttributeNotFound),
        }
    }

    /// Looks up an attribute of the robot itself.
    pub fn bot_attribute(&self, attribute: &str) -> AttributeResponse {
        let value = match attribute.to_lowercase().as_str() {
            "name" | "handle" => self.bot.name.clone(),
            "alias" => self.bot.alias.clone(),
            "email" => self.bot.email.clone(),
            "fullname" | "realname" => self.bot.full_name.clone(),
            "protocol" => self.bot.protocol().as_wire().to_string(),
            _ => String::new(),
        };
        if value.is_empty() {
            AttributeResponse::missing(RetVal::AttributeNotFound)
        } else {
            AttributeResponse::found(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Directory {
        let mut attributes = HashMap::new();
        attributes.insert("Email".to_string(), "alice@example.com".to_string());
        attributes.insert("firstName".to_string(), "Alice".to_string());
        let config = DirectoryConfig {
            users: vec![UserRecord {
                name: "alice".to_string(),
                attributes,
            }],
            channels: vec!["general".to_string()],
        };
        let bot = BotIdentity {
            admins: vec!["alice".to_string()],
            ..Default::default()
        };
        Directory::new(bot, &config)
    }

    #[test]
    fn test_user_attribute() {
        let dir = directory();
        assert_eq!(
            dir.user_attribute("alice", "EMAIL"),
            AttributeResponse::found("alice@example.com")
        );
        assert_eq!(
            dir.user_attribute("alice", "firstname"),
            AttributeResponse::found("Alice")
        );
        assert_eq!(dir.user_attribute("alice", "handle"), AttributeResponse::found("alice"));
        assert_eq!(
            dir.user_attribute("alice", "phone").ret_val,
            RetVal::AttributeNotFound
        );
        assert_eq!(dir.user_attribute("bob", "email").ret_val, RetVal::UserNotFound);
    }

    #[test]
    fn test_bot_attribute() {
        let dir = directory();
        assert_eq!(dir.bot_attribute("name"), AttributeResponse::found("floyd"));
        assert_eq!(dir.bot_attribute("fullName"), AttributeResponse::found("Floyd Gopher"));
        assert_eq!(dir.bot_attribute("protocol"), AttributeResponse::found("test"));
        assert_eq!(dir.bot_attribute("email").ret_val, RetVal::AttributeNotFound);
        assert_eq!(dir.bot_attribute("shoe_size").ret_val, RetVal::AttributeNotFound);
    }

    #[test]
    fn test_membership() {
        let dir = directory();
        assert!(dir.has_user("alice"));
        assert!(!dir.has_user("bob"));
        assert!(dir.has_channel("general"));
        assert!(!dir.has_channel("random"));
        assert!(dir.is_admin("alice"));
        assert!(!dir.is_admin("bob"));
    }

    #[test]
    fn test_open_directory() {
        let dir = Directory::new(BotIdentity::default(), &DirectoryConfig::default());
        assert!(dir.has_user("anyone"));
        assert!(dir.has_channel("anywhere"));
        assert!(!dir.has_user(""));
        assert_eq!(dir.user_attribute("anyone", "name"), AttributeResponse::found("anyone"));
        assert_eq!(dir.user_attribute("anyone", "email").ret_val, RetVal::UserNotFound);
    }
}
