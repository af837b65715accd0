//! JSON message types for robot calls and their results.
//!
//! Every function the host understands is a variant of [`FuncCall`], carrying a
//! typed argument record. The result shape of each function is fixed by
//! [`FuncName::response_kind`].

use crate::codes::RetVal;
use crate::error::ProtocolError;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Result shape returned by a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    RetVal,
    Boolean,
    StrVal,
    Attribute,
    Reply,
    Checkout,
    TaskConfig,
}

macro_rules! functions {
    ( $( $(#[$doc:meta])* $name:ident ($args:ty) => $kind:ident; )+ ) => {
        /// A robot method call: `FuncName` plus typed `FuncArgs`.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "FuncName", content = "FuncArgs")]
        pub enum FuncCall {
            $( $(#[$doc])* $name($args), )+
        }

        /// Function names, without arguments.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum FuncName {
            $( $name, )+
        }

        impl FuncName {
            pub const ALL: &'static [FuncName] = &[$(FuncName::$name),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $( FuncName::$name => stringify!($name), )+
                }
            }

            pub fn parse(name: &str) -> Option<Self> {
                match name {
                    $( stringify!($name) => Some(FuncName::$name), )+
                    _ => None,
                }
            }

            /// Result shape the host answers this function with.
            pub fn response_kind(self) -> ResponseKind {
                match self {
                    $( FuncName::$name => ResponseKind::$kind, )+
                }
            }
        }

        impl FuncCall {
            pub fn func_name(&self) -> FuncName {
                match self {
                    $( FuncCall::$name(_) => FuncName::$name, )+
                }
            }
        }
    };
}

functions! {
    // Identity and privileges
    CheckAdmin(NoArgs) => Boolean;
    Elevate(ElevateArgs) => Boolean;
    Subscribe(NoArgs) => Boolean;
    Unsubscribe(NoArgs) => Boolean;

    // Attributes
    GetSenderAttribute(AttributeArgs) => Attribute;
    GetBotAttribute(AttributeArgs) => Attribute;
    GetUserAttribute(UserAttributeArgs) => Attribute;

    // Messaging
    SendChannelThreadMessage(ChannelThreadMessageArgs) => RetVal;
    SendUserMessage(UserMessageArgs) => RetVal;
    SendUserChannelThreadMessage(UserChannelThreadMessageArgs) => RetVal;
    SendProtocolUserChannelMessage(ProtocolUserChannelMessageArgs) => RetVal;
    /// The only prompting primitive; every prompt variant is built on it.
    PromptUserChannelThreadForReply(PromptArgs) => Reply;

    // Long-term memory
    CheckoutDatum(CheckoutArgs) => Checkout;
    UpdateDatum(UpdateArgs) => RetVal;
    CheckinDatum(CheckinArgs) => RetVal;

    // Short-term memory
    Remember(RememberArgs) => RetVal;
    RememberThread(RememberArgs) => RetVal;
    Recall(RecallArgs) => StrVal;

    // Email
    Email(EmailArgs) => RetVal;
    EmailUser(EmailUserArgs) => RetVal;
    EmailAddress(EmailAddressArgs) => RetVal;

    // Pipelines
    Exclusive(ExclusiveArgs) => Boolean;
    AddTask(TaskArgs) => RetVal;
    AddJob(TaskArgs) => RetVal;
    FinalTask(TaskArgs) => RetVal;
    FailTask(TaskArgs) => RetVal;
    SpawnJob(TaskArgs) => RetVal;
    AddCommand(CommandArgs) => RetVal;
    FinalCommand(CommandArgs) => RetVal;
    FailCommand(CommandArgs) => RetVal;
    SetParameter(SetParameterArgs) => Boolean;
    GetParameter(GetParameterArgs) => StrVal;
    SetWorkingDirectory(WorkingDirectoryArgs) => Boolean;

    // Misc
    Log(LogArgs) => RetVal;
    GetTaskConfig(NoArgs) => TaskConfig;
}

impl std::fmt::Display for FuncName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FuncCall {
    /// Builds a call from a function name and an untyped argument object.
    ///
    /// A null argument value is treated as `{}`.
    pub fn from_parts(name: &str, args: Value) -> Result<Self, ProtocolError> {
        let func = FuncName::parse(name)
            .ok_or_else(|| ProtocolError::UnknownFunction(name.to_string()))?;
        let args = match args {
            Value::Null => json!({}),
            other => other,
        };
        serde_json::from_value(json!({ "FuncName": func.as_str(), "FuncArgs": args })).map_err(
            |e| ProtocolError::InvalidArgs {
                func: func.as_str().to_string(),
                reason: e.to_string(),
            },
        )
    }

    pub fn response_kind(&self) -> ResponseKind {
        self.func_name().response_kind()
    }
}

/// Call envelope posted to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallEnvelope {
    #[serde(rename = "CallerID")]
    pub caller_id: String,

    /// Lowercase message format name, empty for the host default.
    #[serde(rename = "Format")]
    pub format: String,

    #[serde(flatten)]
    pub call: FuncCall,
}

impl CallEnvelope {
    pub fn new(caller_id: impl Into<String>, call: FuncCall) -> Self {
        Self {
            caller_id: caller_id.into(),
            format: String::new(),
            call,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }
}

/// Envelope as read off the wire, before the function is resolved.
#[derive(Debug, Deserialize)]
pub(crate) struct RawEnvelope {
    #[serde(rename = "FuncName")]
    pub func_name: String,

    #[serde(rename = "CallerID", default)]
    pub caller_id: String,

    #[serde(rename = "Format", default)]
    pub format: String,

    #[serde(rename = "FuncArgs", default)]
    pub func_args: Value,
}

// ============================================================================
// Argument records
// ============================================================================

/// Arguments for functions that take none; encodes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoArgs {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ElevateArgs {
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeArgs {
    pub attribute: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserAttributeArgs {
    pub user: String,
    pub attribute: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelThreadMessageArgs {
    pub channel: String,
    #[serde(default)]
    pub thread: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserMessageArgs {
    pub user: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserChannelThreadMessageArgs {
    pub user: String,
    pub channel: String,
    #[serde(default)]
    pub thread: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProtocolUserChannelMessageArgs {
    /// Lowercase protocol name, e.g. `slack`.
    pub protocol: String,
    pub user: String,
    pub channel: String,
    pub message: String,
}

/// Arguments for `PromptUserChannelThreadForReply`.
///
/// An empty `channel` prompts the user by direct message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PromptArgs {
    #[serde(rename = "RegexID")]
    pub regex_id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub thread: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckoutArgs {
    pub key: String,
    #[serde(rename = "RW", default)]
    pub rw: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateArgs {
    pub key: String,
    pub token: String,
    pub datum: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckinArgs {
    pub key: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RememberArgs {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub shared: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecallArgs {
    pub key: String,
    #[serde(default)]
    pub shared: bool,
}

/// Mail to the user who issued the command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmailArgs {
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "HTML", default)]
    pub html: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmailUserArgs {
    pub user: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "HTML", default)]
    pub html: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmailAddressArgs {
    pub address: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "HTML", default)]
    pub html: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExclusiveArgs {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub queue_task: bool,
}

/// Arguments for adding a job or task to the running pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskArgs {
    pub name: String,
    #[serde(default)]
    pub cmd_args: Vec<String>,
}

/// Arguments for adding a plugin command to the running pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandArgs {
    pub plugin: String,
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetParameterArgs {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetParameterArgs {
    pub parameter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkingDirectoryArgs {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogArgs {
    /// Level name, matched case-insensitively (`Debug`, `warn`, ...).
    pub level: String,
    pub message: String,
}

// ============================================================================
// Result records
// ============================================================================
//
// Decoding is forgiving: a missing or unknown `RetVal` reads as `Failed`,
// missing or null strings read as "", missing booleans as false.

fn failed() -> RetVal {
    RetVal::Failed
}

fn ret_val_or_failed<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RetVal, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_i64()
        .and_then(RetVal::from_code)
        .unwrap_or(RetVal::Failed))
}

fn string_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn bool_or_false<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetValResponse {
    #[serde(rename = "RetVal", default = "failed", deserialize_with = "ret_val_or_failed")]
    pub ret_val: RetVal,
}

impl RetValResponse {
    pub fn new(ret_val: RetVal) -> Self {
        Self { ret_val }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolResponse {
    #[serde(rename = "Boolean", default, deserialize_with = "bool_or_false")]
    pub boolean: bool,
}

impl BoolResponse {
    pub fn new(boolean: bool) -> Self {
        Self { boolean }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrResponse {
    #[serde(rename = "StrVal", default, deserialize_with = "string_or_empty")]
    pub str_val: String,
}

impl StrResponse {
    pub fn new(str_val: impl Into<String>) -> Self {
        Self {
            str_val: str_val.into(),
        }
    }
}

/// An attribute lookup result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeResponse {
    #[serde(rename = "Attribute", default, deserialize_with = "string_or_empty")]
    pub attribute: String,
    #[serde(rename = "RetVal", default = "failed", deserialize_with = "ret_val_or_failed")]
    pub ret_val: RetVal,
}

impl AttributeResponse {
    pub fn found(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ret_val: RetVal::Ok,
        }
    }

    pub fn missing(ret_val: RetVal) -> Self {
        Self {
            attribute: String::new(),
            ret_val,
        }
    }
}

/// A prompt result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyResponse {
    #[serde(rename = "Reply", default, deserialize_with = "string_or_empty")]
    pub reply: String,
    #[serde(rename = "RetVal", default = "failed", deserialize_with = "ret_val_or_failed")]
    pub ret_val: RetVal,
}

impl ReplyResponse {
    pub fn matched(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            ret_val: RetVal::Ok,
        }
    }

    pub fn failed(ret_val: RetVal) -> Self {
        Self {
            reply: String::new(),
            ret_val,
        }
    }
}

/// A datum checkout result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutResponse {
    #[serde(rename = "LockToken", default, deserialize_with = "string_or_empty")]
    pub lock_token: String,
    #[serde(rename = "Exists", default, deserialize_with = "bool_or_false")]
    pub exists: bool,
    #[serde(rename = "Datum", default)]
    pub datum: Value,
    #[serde(rename = "RetVal", default = "failed", deserialize_with = "ret_val_or_failed")]
    pub ret_val: RetVal,
}

impl CheckoutResponse {
    pub fn failed(ret_val: RetVal) -> Self {
        Self {
            lock_token: String::new(),
            exists: false,
            datum: Value::Null,
            ret_val,
        }
    }
}

/// The calling task's configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfigResponse {
    #[serde(rename = "Config", default)]
    pub config: Value,
    #[serde(rename = "RetVal", default = "failed", deserialize_with = "ret_val_or_failed")]
    pub ret_val: RetVal,
}

// ============================================================================
// Host control
// ============================================================================

/// A message injected into the reference host as if a user had typed it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub user: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub thread: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingResponse {
    /// Whether the message was delivered to a waiting prompt.
    pub matched: bool,
    /// Task subscribed to the message's thread, when no prompt took it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subscriber: String,
}

/// Ends the pipeline a caller is running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FinishRequest {
    #[serde(rename = "CallerID")]
    pub caller_id: String,
    /// Also forget the caller id.
    #[serde(default)]
    pub deregister: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FinishResponse {
    /// Exclusive tags the pipeline held.
    pub released_tags: usize,
    /// Entries added to the pipeline's stages.
    pub stages: usize,
    /// Jobs spawned into new pipelines.
    pub spawned: usize,
}

/// Decodes a result record, requiring a JSON object.
pub fn decode_result<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}
