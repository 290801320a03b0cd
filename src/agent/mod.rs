//! Agent Execution Core
//!
//! A tool-calling loop over a [`ModelProvider`]. Each round the model either
//! answers (the run is done) or asks for tool calls, which are dispatched
//! through the [`PrimitiveRegistry`](crate::primitives::PrimitiveRegistry)
//! filtered to the run's mode and appended to the history for the next round.
//!
//! This module is the only caller of the model provider.

#[cfg(feature = "openai")]
mod openai;
pub mod prompt;
mod runner;

#[cfg(feature = "openai")]
pub use openai::OpenAIChatProvider;
pub use runner::{AgentRunner, RunOutcome};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::primitives::ToolDefinition;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::assistant(content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, output: &Value) -> Self {
        Self {
            role: Role::Tool,
            content: output.to_string(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Everything a single model call sees
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    /// Empty on forced completion
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// A final answer when `tool_calls` is empty, otherwise a request for tools
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tools(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: String::new(),
            tool_calls,
        }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// Progress of a streaming chat run, for UI display
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },
    ToolStarted {
        round: u32,
        name: String,
        arguments: Value,
    },
    ToolFinished {
        round: u32,
        name: String,
        is_error: bool,
    },
    Done {
        text: String,
        rounds: u32,
        ceiling_truncated: bool,
    },
    /// Conversational description of a fatal failure
    Failed {
        message: String,
    },
}

/// Model inference provider
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Single-shot call
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Streaming call: text is pushed to `deltas` as it arrives and the
    /// assembled response is returned at the end.
    async fn complete_streaming(
        &self,
        request: &ModelRequest,
        deltas: &mpsc::UnboundedSender<String>,
    ) -> Result<ModelResponse> {
        let response = self.complete(request).await?;
        if !response.text.is_empty() {
            let _ = deltas.send(response.text.clone());
        }
        Ok(response)
    }
}
