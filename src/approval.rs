//! Approval of tool calls that the service will not run on its own.
//!
//! When an MCP server is registered with [`McpApprovalMode::Always`], every
//! call the agent makes to it pauses the run and surfaces here as a
//! [`ToolCallRequest`]. An [`ApprovalPolicy`] turns each request into an
//! [`ApprovalDecision`].
//!
//! [`McpApprovalMode::Always`]: crate::tools::McpApprovalMode::Always

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ApprovalTimeout;
use crate::tools::ToolRegistry;

/// A remote tool call waiting for a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// MCP server the tool belongs to
    pub server_label: String,
    /// JSON-encoded arguments
    pub arguments: String,
    pub requires_approval: bool,
}

/// Outcome of an approval policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Let the call run, forwarding `headers` to the tool server
    Approve { headers: BTreeMap<String, String> },
    /// Reject the call; the run continues without it
    Deny { reason: String },
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self::Approve {
            headers: BTreeMap::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve { .. })
    }
}

/// A decision bound to the call it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolApproval {
    pub tool_call_id: String,
    pub decision: ApprovalDecision,
}

impl ToolApproval {
    pub fn approve(&self) -> bool {
        self.decision.is_approved()
    }

    /// Wire form: `{ tool_call_id, approve, headers }`.
    pub fn to_wire(&self) -> WireApproval<'_> {
        let headers = match &self.decision {
            ApprovalDecision::Approve { headers } if !headers.is_empty() => Some(headers),
            _ => None,
        };
        WireApproval {
            tool_call_id: &self.tool_call_id,
            approve: self.approve(),
            headers,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WireApproval<'a> {
    pub tool_call_id: &'a str,
    pub approve: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<&'a BTreeMap<String, String>>,
}

/// Decides whether a remote tool call may run.
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    async fn decide(&self, request: &ToolCallRequest) -> ApprovalDecision;
}

/// Approves every call, attaching the headers configured for its MCP server.
#[derive(Debug, Clone, Default)]
pub struct ApproveAll {
    headers: HashMap<String, BTreeMap<String, String>>,
}

impl ApproveAll {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick up the headers of every MCP server in the registry.
    pub fn from_registry(registry: &ToolRegistry) -> Self {
        let headers = registry
            .mcp_servers()
            .map(|mcp| (mcp.server_label.clone(), mcp.headers.clone()))
            .collect();
        Self { headers }
    }
}

#[async_trait]
impl ApprovalPolicy for ApproveAll {
    async fn decide(&self, request: &ToolCallRequest) -> ApprovalDecision {
        tracing::info!(
            tool_call_id = %request.id,
            tool = %request.name,
            server = %request.server_label,
            "Approving MCP tool call"
        );
        ApprovalDecision::Approve {
            headers: self
                .headers
                .get(&request.server_label)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Denies every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalPolicy for DenyAll {
    async fn decide(&self, request: &ToolCallRequest) -> ApprovalDecision {
        tracing::info!(
            tool_call_id = %request.id,
            tool = %request.name,
            "Denying MCP tool call"
        );
        ApprovalDecision::deny(format!("calls to {} are not allowed", request.name))
    }
}

/// Bounds another policy's deliberation; a request still undecided at the
/// deadline is denied.
pub struct TimeoutPolicy<P> {
    inner: P,
    timeout: Duration,
}

impl<P> TimeoutPolicy<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<P: ApprovalPolicy> ApprovalPolicy for TimeoutPolicy<P> {
    async fn decide(&self, request: &ToolCallRequest) -> ApprovalDecision {
        match tokio::time::timeout(self.timeout, self.inner.decide(request)).await {
            Ok(decision) => decision,
            Err(_) => {
                let err = ApprovalTimeout {
                    tool_call_id: request.id.clone(),
                    timeout: self.timeout,
                };
                tracing::warn!("{}; denying", err);
                ApprovalDecision::deny(err.to_string())
            }
        }
    }
}
