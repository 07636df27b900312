use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::tool::{Tool, ToolCall};

/// A message in a prompt or a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// Tool calls requested by the assistant in this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Message {
    /// Create a simple text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: text.into(),
            tool_calls: vec![],
            timestamp: Utc::now(),
        }
    }

    /// An assistant message that only requests tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::text(Role::Assistant, "")
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A named, ordered list of messages sent to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub messages: Vec<Message>,
}

impl Prompt {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: vec![],
        }
    }

    pub fn system(mut self, text: impl Into<String>) -> Self {
        self.messages.push(Message::text(Role::System, text));
        self
    }

    pub fn user(mut self, text: impl Into<String>) -> Self {
        self.messages.push(Message::text(Role::User, text));
        self
    }

    pub fn assistant(mut self, text: impl Into<String>) -> Self {
        self.messages.push(Message::text(Role::Assistant, text));
        self
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// One frame of a streaming model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Content text delta.
    Append { text: String },
    /// A tool call was decided.
    ToolCall { call: ToolCall },
    /// Stream is done.
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    /// An error occurred mid-stream.
    Error { message: String },
}

/// The reasoning-model client, seen from the runtime.
///
/// The wire protocol lives behind this trait; the runtime only fires model-call
/// events around it.
#[async_trait]
pub trait PromptExecutor: Send + Sync {
    /// Send a non-streaming request and return the response messages.
    async fn execute(
        &self,
        prompt: &Prompt,
        model: &str,
        tools: &[Tool],
    ) -> crate::Result<Vec<Message>>;

    /// Send a streaming request. Returns a receiver for frames.
    async fn execute_streaming(
        &self,
        prompt: &Prompt,
        model: &str,
        tools: &[Tool],
    ) -> crate::Result<mpsc::Receiver<StreamFrame>>;
}
