//! Tool execution seam.
//!
//! The coordinator hands tool calls to a [`ToolExecutor`]. Tools the server
//! cannot run itself report [`ToolError::Unsupported`], and the run then
//! waits for a client to post the result.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// A tool advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool input.
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The tool runs on a client; its result arrives as a tool-result chunk.
    #[error("tool {0} is executed by a client")]
    Unsupported(String),

    #[error("tool failed: {0}")]
    Failed(String),

    #[error("tool execution cancelled")]
    Cancelled,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools offered to the model on every turn.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run a tool and return its textual output.
    async fn execute(
        &self,
        name: &str,
        input: &Value,
        cwd: &str,
        cancel: CancellationToken,
    ) -> Result<String, ToolError>;

    /// Whether the tool modifies files. Edit tools skip approval under
    /// the accept-edits permission mode.
    fn is_edit_tool(&self, name: &str) -> bool {
        is_edit_tool_name(name)
    }
}

/// Name-based classification of file-modifying tools.
pub fn is_edit_tool_name(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "edit" | "multiedit" | "write" | "notebookedit" | "edit_file" | "write_file" | "apply_patch"
    )
}

/// Advertises tool definitions but runs nothing server-side; every call is
/// answered by a client.
#[derive(Debug, Clone, Default)]
pub struct ClientSideTools {
    definitions: Vec<ToolDefinition>,
}

impl ClientSideTools {
    pub fn new(definitions: Vec<ToolDefinition>) -> Self {
        Self { definitions }
    }

    /// Load definitions from a JSON file containing a list of tools.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading tool definitions: {}", path.display()))?;
        let definitions: Vec<ToolDefinition> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing tool definitions: {}", path.display()))?;
        Ok(Self::new(definitions))
    }
}

#[async_trait]
impl ToolExecutor for ClientSideTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }

    async fn execute(
        &self,
        name: &str,
        _input: &Value,
        _cwd: &str,
        _cancel: CancellationToken,
    ) -> Result<String, ToolError> {
        Err(ToolError::Unsupported(name.to_string()))
    }
}
