//! Chunk payloads.
//!
//! A chunk is the atomic unit appended to a message. Single-shot actions
//! (control, tool result, approval response, config) always occupy seq 0 of
//! their own message; streamed agent output shares one message per run with
//! monotonically increasing seq.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Enums
// ============================================================================

/// Who authored a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// How tool calls made by the agent are gated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Every tool call needs an explicit approval.
    #[default]
    Default,
    /// Edit/write tools run without asking; everything else needs approval.
    AcceptEdits,
    /// No approvals at all.
    BypassPermissions,
    /// Read-only planning: every tool call is denied without asking.
    Plan,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Default => write!(f, "default"),
            PermissionMode::AcceptEdits => write!(f, "accept-edits"),
            PermissionMode::BypassPermissions => write!(f, "bypass-permissions"),
            PermissionMode::Plan => write!(f, "plan"),
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "default" => Ok(PermissionMode::Default),
            "accept-edits" | "acceptedits" => Ok(PermissionMode::AcceptEdits),
            "bypass-permissions" | "bypasspermissions" => Ok(PermissionMode::BypassPermissions),
            "plan" => Ok(PermissionMode::Plan),
            _ => Err(format!("unknown permission mode: {}", s)),
        }
    }
}

/// Control actions a client can append to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Cancel the active agent run.
    Stop,
    /// Close the stream; tailing consumers stop waiting.
    Close,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlAction::Stop => write!(f, "stop"),
            ControlAction::Close => write!(f, "close"),
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// A complete conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Session-level settings and metadata. Every field is optional; later
/// config chunks override earlier ones field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slash_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl SessionConfig {
    /// Overlay `other` onto `self`: fields set in `other` win.
    pub fn merge(&mut self, other: &SessionConfig) {
        if other.model.is_some() {
            self.model.clone_from(&other.model);
        }
        if other.permission_mode.is_some() {
            self.permission_mode = other.permission_mode;
        }
        if other.thinking_enabled.is_some() {
            self.thinking_enabled = other.thinking_enabled;
        }
        if other.cwd.is_some() {
            self.cwd.clone_from(&other.cwd);
        }
        if other.available_models.is_some() {
            self.available_models.clone_from(&other.available_models);
        }
        if other.slash_commands.is_some() {
            self.slash_commands.clone_from(&other.slash_commands);
        }
        if other.title.is_some() {
            self.title.clone_from(&other.title);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == SessionConfig::default()
    }
}

/// Streamed agent output. All chunks of one run share a message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    /// Incremental assistant text.
    TextDelta { delta: String },

    /// The agent invoked a tool that needs no approval.
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },

    /// The agent wants to invoke a tool and the run is paused until a
    /// decision arrives.
    #[serde(rename_all = "camelCase")]
    ApprovalRequested {
        approval_id: String,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },

    /// Result of a tool call made inside the run.
    #[serde(rename_all = "camelCase")]
    ToolOutput {
        tool_call_id: String,
        output: String,
        is_error: bool,
    },

    /// Run finished normally.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Run failed.
    Error { message: String },

    /// Run was cancelled or superseded.
    Aborted { reason: String },
}

impl StreamChunk {
    /// Whether this chunk ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamChunk::Done { .. } | StreamChunk::Error { .. } | StreamChunk::Aborted { .. }
        )
    }
}

/// The content of a chunk, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChunkPayload {
    /// A complete message (typically user input).
    WholeMessage { message: Message },

    /// A tool result delivered by a client-side tool callback.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A human decision for a pending approval.
    #[serde(rename_all = "camelCase")]
    ApprovalResponse {
        approval_id: String,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answers: Option<Value>,
    },

    /// A control signal such as `stop`.
    Control { action: ControlAction },

    /// A config/metadata update.
    Config(SessionConfig),

    /// Streamed agent output.
    Stream { chunk: StreamChunk },
}

impl ChunkPayload {
    /// Stable name of the payload kind, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ChunkPayload::WholeMessage { .. } => "whole-message",
            ChunkPayload::ToolResult { .. } => "tool-result",
            ChunkPayload::ApprovalResponse { .. } => "approval-response",
            ChunkPayload::Control { .. } => "control",
            ChunkPayload::Config(_) => "config",
            ChunkPayload::Stream { .. } => "stream",
        }
    }

    /// Whether this payload is a run's terminal marker.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkPayload::Stream { chunk } if chunk.is_terminal())
    }
}
