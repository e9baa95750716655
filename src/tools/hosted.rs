//! Tools executed by the service: file search and remote MCP servers.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// File search over one or more vector stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSearchTool {
    pub vector_store_ids: Vec<String>,
}

impl FileSearchTool {
    pub const NAME: &'static str = "file_search";

    pub fn new(vector_store_ids: Vec<String>) -> Self {
        Self { vector_store_ids }
    }
}

/// When the service must ask before calling an MCP tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpApprovalMode {
    /// Every call surfaces as a request for approval
    Always,
    /// Calls run without asking
    Never,
}

impl McpApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Never => "never",
        }
    }
}

impl FromStr for McpApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("expected `always` or `never`, got: {}", other)),
        }
    }
}

/// A remote MCP server the agent may call through the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpTool {
    pub server_label: String,
    pub server_url: String,
    /// Empty means every tool the server exposes
    pub allowed_tools: Vec<String>,
    pub approval_mode: McpApprovalMode,
    /// Headers forwarded to the server with each approved call
    pub headers: BTreeMap<String, String>,
}

impl McpTool {
    pub fn new(
        server_label: impl Into<String>,
        server_url: impl Into<String>,
        allowed_tools: Vec<String>,
    ) -> Self {
        Self {
            server_label: server_label.into(),
            server_url: server_url.into(),
            allowed_tools,
            approval_mode: McpApprovalMode::Always,
            headers: BTreeMap::new(),
        }
    }

    pub fn set_approval_mode(&mut self, mode: McpApprovalMode) {
        self.approval_mode = mode;
    }

    pub fn update_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub(super) fn definition(&self) -> Value {
        json!({
            "type": "mcp",
            "server_label": self.server_label,
            "server_url": self.server_url,
            "allowed_tools": self.allowed_tools,
        })
    }

    pub(super) fn resources(&self) -> Value {
        json!({
            "server_label": self.server_label,
            "headers": self.headers,
            "require_approval": self.approval_mode.as_str(),
        })
    }
}
