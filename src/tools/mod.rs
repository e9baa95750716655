//! Tool registry: everything the agent is allowed to call.
//!
//! Three kinds of tools are registered:
//! - function tools, executed locally when a run asks for their output
//! - file search, executed by the service against a vector store
//! - MCP servers, executed by the service and optionally gated on approval
//!
//! The registry is built once during setup and is read-only afterwards.

mod hosted;
mod pizza;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::RegistryError;

pub use hosted::{FileSearchTool, McpApprovalMode, McpTool};
pub use pizza::CalculatePizzaForPeople;

/// A locally executed function tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model calls the tool by.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. The returned string is sent back to the run as the tool output.
    async fn execute(&self, args: Value) -> anyhow::Result<String>;
}

/// A registered tool of any kind.
#[derive(Clone)]
pub enum ToolEntry {
    Function(Arc<dyn Tool>),
    FileSearch(FileSearchTool),
    Mcp(McpTool),
}

impl ToolEntry {
    /// Registry key: the function name, `file_search`, or the MCP server label.
    pub fn name(&self) -> &str {
        match self {
            Self::Function(tool) => tool.name(),
            Self::FileSearch(_) => FileSearchTool::NAME,
            Self::Mcp(mcp) => &mcp.server_label,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Function(tool) => tool.description().to_string(),
            Self::FileSearch(_) => "Search the uploaded store documents".to_string(),
            Self::Mcp(mcp) => format!("Remote tools served by {}", mcp.server_url),
        }
    }

    /// Whether calls to this tool resolve without going through the approval policy.
    pub fn auto_execute(&self) -> bool {
        match self {
            Self::Function(_) | Self::FileSearch(_) => true,
            Self::Mcp(mcp) => mcp.approval_mode == McpApprovalMode::Never,
        }
    }

    /// Tool definition in the agent creation payload.
    pub fn definition(&self) -> Value {
        match self {
            Self::Function(tool) => json!({
                "type": "function",
                "function": {
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema(),
                }
            }),
            Self::FileSearch(_) => json!({ "type": "file_search" }),
            Self::Mcp(mcp) => mcp.definition(),
        }
    }
}

impl std::fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function(tool) => f.debug_tuple("Function").field(&tool.name()).finish(),
            Self::FileSearch(fs) => f.debug_tuple("FileSearch").field(fs).finish(),
            Self::Mcp(mcp) => f.debug_tuple("Mcp").field(mcp).finish(),
        }
    }
}

impl From<FileSearchTool> for ToolEntry {
    fn from(tool: FileSearchTool) -> Self {
        Self::FileSearch(tool)
    }
}

impl From<McpTool> for ToolEntry {
    fn from(tool: McpTool) -> Self {
        Self::Mcp(tool)
    }
}

impl<T: Tool + 'static> From<T> for ToolEntry {
    fn from(tool: T) -> Self {
        Self::Function(Arc::new(tool))
    }
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Name-keyed collection of tools, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    entries: Vec<ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Fails without touching the registry if the name is taken.
    pub fn register(&mut self, tool: impl Into<ToolEntry>) -> Result<(), RegistryError> {
        let entry = tool.into();
        if self.entries.iter().any(|e| e.name() == entry.name()) {
            return Err(RegistryError::DuplicateName(entry.name().to_string()));
        }
        tracing::debug!(tool = entry.name(), "Registered tool");
        self.entries.push(entry);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolEntry, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.name() == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The MCP server registered under `server_label`, if any.
    pub fn mcp_server(&self, server_label: &str) -> Option<&McpTool> {
        match self.lookup(server_label) {
            Ok(ToolEntry::Mcp(mcp)) => Some(mcp),
            _ => None,
        }
    }

    pub fn mcp_servers(&self) -> impl Iterator<Item = &McpTool> {
        self.entries.iter().filter_map(|e| match e {
            ToolEntry::Mcp(mcp) => Some(mcp),
            _ => None,
        })
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.entries
            .iter()
            .map(|e| ToolInfo {
                name: e.name().to_string(),
                description: e.description(),
            })
            .collect()
    }

    /// Tool definitions for agent creation.
    pub fn definitions(&self) -> Vec<Value> {
        self.entries.iter().map(ToolEntry::definition).collect()
    }

    /// `tool_resources` object for agent creation (vector stores, MCP headers).
    pub fn tool_resources(&self) -> Value {
        let mut resources = serde_json::Map::new();

        let vector_store_ids: Vec<&String> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                ToolEntry::FileSearch(fs) => Some(&fs.vector_store_ids),
                _ => None,
            })
            .flatten()
            .collect();
        if !vector_store_ids.is_empty() {
            resources.insert(
                "file_search".to_string(),
                json!({ "vector_store_ids": vector_store_ids }),
            );
        }

        let mcp: Vec<Value> = self.mcp_servers().map(McpTool::resources).collect();
        if !mcp.is_empty() {
            resources.insert("mcp".to_string(), Value::Array(mcp));
        }

        Value::Object(resources)
    }

    /// Execute a function tool by name.
    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<String> {
        match self.lookup(name)? {
            ToolEntry::Function(tool) => tool.execute(args).await,
            other => Err(anyhow::anyhow!(
                "Tool '{}' is executed by the service, not locally",
                other.name()
            )),
        }
    }
}
