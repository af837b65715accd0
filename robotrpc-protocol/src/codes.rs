//! Integer code enums shared by every binding.
//!
//! Each enum supports a reverse lookup from integer to symbolic name. Values
//! outside the defined range map to an `Unknown<Category>` sentinel; plugin
//! logs and tests key off these names, so they must not change.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error returned when parsing a symbolic name that is not defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName {
    pub category: &'static str,
    pub name: String,
}

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} name: {}", self.category, self.name)
    }
}

impl std::error::Error for UnknownName {}

macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident ($sentinel:literal) {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            /// Every defined value, in code order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Name reported for codes outside the defined range.
            pub const UNKNOWN: &'static str = $sentinel;

            /// Returns the integer code.
            pub fn code(self) -> i64 {
                self as i64
            }

            /// Looks up a value by integer code.
            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $( $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Returns the symbolic name.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => stringify!($variant), )+
                }
            }

            /// Reverse lookup: integer code to symbolic name, or the sentinel.
            pub fn name_of(code: i64) -> &'static str {
                Self::from_code(code).map(Self::as_str).unwrap_or($sentinel)
            }

            /// Forward lookup: symbolic name to value.
            pub fn code_of(name: &str) -> Option<Self> {
                match name {
                    $( stringify!($variant) => Some($name::$variant), )+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::code_of(s).ok_or_else(|| UnknownName {
                    category: stringify!($name),
                    name: s.to_string(),
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_i64(self.code())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let code = i64::deserialize(deserializer)?;
                Self::from_code(code).ok_or_else(|| {
                    de::Error::custom(format!("{} is not a valid {}", code, stringify!($name)))
                })
            }
        }
    };
}

code_enum! {
    /// Return value of a robot method call; `Ok` is the only success value.
    pub enum RetVal ("UnknownRetVal") {
        Ok = 0,

        // Connector issues
        UserNotFound = 1,
        ChannelNotFound = 2,
        AttributeNotFound = 3,
        FailedMessageSend = 4,
        FailedChannelJoin = 5,

        // Brain maladies
        DatumNotFound = 6,
        DatumLockExpired = 7,
        DataFormatError = 8,
        BrainFailed = 9,
        InvalidDatumKey = 10,

        // Task configuration
        InvalidConfigPointer = 11,
        ConfigUnmarshalError = 12,
        NoConfigFound = 13,

        // Prompting
        RetryPrompt = 14,
        ReplyNotMatched = 15,
        UseDefaultValue = 16,
        TimeoutExpired = 17,
        Interrupted = 18,
        MatcherNotFound = 19,

        // Email
        NoUserEmail = 20,
        NoBotEmail = 21,
        MailError = 22,

        // Pipeline
        TaskNotFound = 23,
        MissingArguments = 24,
        InvalidStage = 25,
        InvalidTaskType = 26,
        CommandNotMatched = 27,
        TaskDisabled = 28,
        PrivilegeViolation = 29,

        /// Generic failure, should be accompanied by a log.
        Failed = 63,
    }
}

impl RetVal {
    pub fn is_ok(self) -> bool {
        self == RetVal::Ok
    }

    /// Returns whether this code may legitimately terminate a prompt flow.
    pub fn is_prompt_outcome(self) -> bool {
        matches!(
            self,
            RetVal::Ok
                | RetVal::RetryPrompt
                | RetVal::ReplyNotMatched
                | RetVal::UseDefaultValue
                | RetVal::TimeoutExpired
                | RetVal::Interrupted
                | RetVal::MatcherNotFound
        )
    }

    /// Returns whether a message could not be delivered to a user or channel.
    pub fn is_connector_issue(self) -> bool {
        (1..=5).contains(&self.code())
    }

    /// Returns whether a host may answer a prompt with this code: a prompt
    /// outcome, a connector issue from sending the prompt, or `Failed`.
    pub fn is_reply_code(self) -> bool {
        self.is_prompt_outcome() || self.is_connector_issue() || self == RetVal::Failed
    }
}

code_enum! {
    /// Exit status of a plugin, job or task.
    pub enum TaskRetVal ("UnknownTaskRetVal") {
        Normal = 0,
        Fail = 1,
        MechanismFail = 2,
        ConfigurationError = 3,
        PipelineAborted = 4,
        RobotStopping = 5,
        NotFound = 6,
        /// Three bits set, so an auth plugin can't succeed by accident.
        Success = 7,
    }
}

code_enum! {
    /// Log levels, most to least verbose.
    pub enum LogLevel ("UnknownLogLevel") {
        Trace = 0,
        Debug = 1,
        Info = 2,
        Audit = 3,
        Warn = 4,
        Error = 5,
        Fatal = 6,
    }
}

impl LogLevel {
    /// Parses a level name case-insensitively, as scripts send it.
    pub fn from_wire(level: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|l| l.as_str().eq_ignore_ascii_case(level.trim()))
    }
}

code_enum! {
    /// How the connector should render an outgoing message.
    pub enum MessageFormat ("UnknownMessageFormat") {
        Raw = 0,
        Fixed = 1,
        Variable = 2,
    }
}

impl MessageFormat {
    /// Lowercase name used in the envelope `Format` field.
    pub fn as_wire(self) -> &'static str {
        match self {
            MessageFormat::Raw => "raw",
            MessageFormat::Fixed => "fixed",
            MessageFormat::Variable => "variable",
        }
    }

    pub fn from_wire(format: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_wire().eq_ignore_ascii_case(format.trim()))
    }
}

code_enum! {
    /// Chat protocols a robot can be connected to.
    pub enum Protocol ("UnknownProtocol") {
        Slack = 0,
        Rocket = 1,
        Terminal = 2,
        Test = 3,
        Null = 4,
    }
}

impl Protocol {
    /// Lowercase name as carried in `GOPHER_PROTOCOL`.
    pub fn as_wire(self) -> &'static str {
        match self {
            Protocol::Slack => "slack",
            Protocol::Rocket => "rocket",
            Protocol::Terminal => "terminal",
            Protocol::Test => "test",
            Protocol::Null => "null",
        }
    }

    pub fn from_wire(protocol: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_wire().eq_ignore_ascii_case(protocol.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ret_val_codes() {
        assert_eq!(RetVal::Ok.code(), 0);
        assert_eq!(RetVal::FailedChannelJoin.code(), 5);
        assert_eq!(RetVal::DatumLockExpired.code(), 7);
        assert_eq!(RetVal::NoConfigFound.code(), 13);
        assert_eq!(RetVal::MatcherNotFound.code(), 19);
        assert_eq!(RetVal::MailError.code(), 22);
        assert_eq!(RetVal::PrivilegeViolation.code(), 29);
        assert_eq!(RetVal::Failed.code(), 63);
        assert_eq!(RetVal::ALL.len(), 31);
    }

    #[test]
    fn test_name_of_sentinels() {
        assert_eq!(RetVal::name_of(30), "UnknownRetVal");
        assert_eq!(RetVal::name_of(-1), "UnknownRetVal");
        assert_eq!(TaskRetVal::name_of(8), "UnknownTaskRetVal");
        assert_eq!(LogLevel::name_of(7), "UnknownLogLevel");
        assert_eq!(MessageFormat::name_of(3), "UnknownMessageFormat");
        assert_eq!(Protocol::name_of(5), "UnknownProtocol");
    }

    #[test]
    fn test_every_value_round_trips() {
        for v in RetVal::ALL {
            assert_eq!(RetVal::code_of(RetVal::name_of(v.code())), Some(*v));
        }
        for v in TaskRetVal::ALL {
            assert_eq!(TaskRetVal::code_of(TaskRetVal::name_of(v.code())), Some(*v));
        }
        for v in LogLevel::ALL {
            assert_eq!(LogLevel::code_of(LogLevel::name_of(v.code())), Some(*v));
        }
        for v in MessageFormat::ALL {
            assert_eq!(
                MessageFormat::code_of(MessageFormat::name_of(v.code())),
                Some(*v)
            );
        }
        for v in Protocol::ALL {
            assert_eq!(Protocol::code_of(Protocol::name_of(v.code())), Some(*v));
        }
    }

    #[test]
    fn test_from_str() {
        assert_eq!("DatumLockExpired".parse::<RetVal>(), Ok(RetVal::DatumLockExpired));
        let err = "NoSuchThing".parse::<RetVal>().unwrap_err();
        assert_eq!(err.category, "RetVal");
        assert!(err.to_string().contains("NoSuchThing"));
    }

    #[test]
    fn test_serialize_as_integer() {
        assert_eq!(serde_json::to_string(&RetVal::Interrupted).unwrap(), "18");
        assert_eq!(serde_json::to_string(&TaskRetVal::Success).unwrap(), "7");
        let parsed: RetVal = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, RetVal::DatumLockExpired);
        assert!(serde_json::from_str::<RetVal>("42").is_err());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(MessageFormat::from_wire("Fixed"), Some(MessageFormat::Fixed));
        assert_eq!(MessageFormat::Variable.as_wire(), "variable");
        assert_eq!(Protocol::from_wire("SLACK"), Some(Protocol::Slack));
        assert_eq!(Protocol::from_wire("irc"), None);
        assert_eq!(LogLevel::from_wire("warn"), Some(LogLevel::Warn));
    }

    #[test]
    fn test_prompt_outcomes() {
        assert!(RetVal::Ok.is_prompt_outcome());
        assert!(RetVal::TimeoutExpired.is_prompt_outcome());
        assert!(!RetVal::DatumLockExpired.is_prompt_outcome());
        assert!(!RetVal::TaskNotFound.is_prompt_outcome());
    }

    #[test]
    fn test_reply_codes() {
        assert!(RetVal::RetryPrompt.is_reply_code());
        assert!(RetVal::UserNotFound.is_reply_code());
        assert!(RetVal::FailedMessageSend.is_reply_code());
        assert!(RetVal::Failed.is_reply_code());
        assert!(!RetVal::DatumNotFound.is_connector_issue());
        for rv in [
            RetVal::DatumLockExpired,
            RetVal::NoConfigFound,
            RetVal::MailError,
            RetVal::TaskNotFound,
            RetVal::PrivilegeViolation,
        ] {
            assert!(!rv.is_reply_code(), "{} is not a reply code", rv);
        }
    }

    proptest! {
        #[test]
        fn prop_ret_val_reverse_lookup(code in -1000i64..1000) {
            let name = RetVal::name_of(code);
            match RetVal::from_code(code) {
                Some(v) => {
                    prop_assert_eq!(name, v.as_str());
                    prop_assert_eq!(RetVal::name_of(RetVal::code_of(name).unwrap().code()), name);
                }
                None => prop_assert_eq!(name, "UnknownRetVal"),
            }
        }

        #[test]
        fn prop_task_ret_val_reverse_lookup(code in -100i64..100) {
            let name = TaskRetVal::name_of(code);
            if (0..=7).contains(&code) {
                prop_assert_eq!(TaskRetVal::code_of(name).map(TaskRetVal::code), Some(code));
            } else {
                prop_assert_eq!(name, "UnknownTaskRetVal");
            }
        }
    }
}
