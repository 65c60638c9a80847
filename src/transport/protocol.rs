//! Host protocol message types.
//!
//! Host → plugin frames carry a list of tool calls; plugin → host responses
//! are a flat success envelope followed by the `<<END>>` sentinel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One decoded host frame.
///
/// Fields are kept loosely typed so that a frame with a malformed
/// `tool_calls` member still decodes and can be answered with a
/// failure envelope instead of being dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandFrame {
    /// Conversation context, passed through to handlers untouched.
    #[serde(default)]
    pub messages: Option<Value>,
    /// Host system information, passed through to handlers untouched.
    #[serde(default)]
    pub system_info: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Value>,
}

/// A single command extracted from a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub parameters: Map<String, Value>,
    pub context: Option<Value>,
    pub system_info: Option<Value>,
}

/// Result of extracting one tool call from a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Command(Command),
    /// Missing `tool_calls`, or a call without a `func` name.
    Malformed,
}

impl CommandFrame {
    /// Split the frame into its calls, in order.
    ///
    /// A frame without a usable `tool_calls` list yields a single
    /// [`Call::Malformed`].
    pub fn into_calls(self) -> Vec<Call> {
        let Some(Value::Array(tool_calls)) = self.tool_calls else {
            return vec![Call::Malformed];
        };
        if tool_calls.is_empty() {
            return vec![Call::Malformed];
        }

        tool_calls
            .into_iter()
            .map(|call| {
                let Some(name) = call.get("func").and_then(Value::as_str) else {
                    return Call::Malformed;
                };
                let parameters = match call.get("params") {
                    Some(Value::Object(params)) => params.clone(),
                    _ => Map::new(),
                };
                Call::Command(Command {
                    name: name.to_string(),
                    parameters,
                    context: self.messages.clone(),
                    system_info: self.system_info.clone(),
                })
            })
            .collect()
    }
}

/// Progress indicator carried by generation acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Processing,
    Success,
    Error,
}

/// Response envelope sent back for every frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            status: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            status: None,
        }
    }

    /// Acknowledgment for work that continues in the background.
    pub fn processing(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            status: Some(Status::Processing),
        }
    }
}
