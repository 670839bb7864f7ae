//! Model provider seam.
//!
//! The coordinator drives a [`ModelProvider`] turn by turn and consumes its
//! events as a stream. Cancellation is cooperative through the token passed
//! to [`ModelProvider::stream`].

mod openai;

pub use openai::OpenAiProvider;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parley_protocol::Role;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tools::ToolDefinition;

/// One part of a provider-side message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },
}

/// A message in the conversation sent to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ProviderMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text(text.into())],
        }
    }

    /// Concatenated text parts.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Everything needed for one model turn.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ProviderMessage>,
    pub tools: Vec<ToolDefinition>,
    pub thinking_enabled: bool,
}

/// Incremental output of a model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    Finished {
        stop_reason: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode provider output: {0}")]
    Decode(String),

    #[error("provider stream cancelled")]
    Cancelled,
}

pub type ProviderStream = BoxStream<'static, Result<ProviderEvent, ProviderError>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Start a model turn. The returned stream ends after
    /// [`ProviderEvent::Finished`] or an error.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError>;
}
