//! Session store: the hosted service that owns agents, threads and runs.
//!
//! The store is an external collaborator. This module defines the data model
//! exchanged with it and the [`SessionStore`] trait; [`HttpSessionStore`]
//! talks to the real service and [`InMemorySessionStore`] is a local,
//! non-persistent stand-in.

mod http;
mod memory;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{ToolApproval, ToolCallRequest};
use crate::error::ServiceError;

pub use http::HttpSessionStore;
pub use memory::{InMemorySessionStore, PlannedCall};

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    #[serde(rename = "assistant")]
    Agent,
}

/// One piece of a turn's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSegment {
    Text(String),
    /// Anything else the service attaches (images, annotations, ...)
    Other(String),
}

/// A role-tagged message in a session. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentSegment>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// First text segment, if the turn has one.
    pub fn text(&self) -> Option<&str> {
        self.content.iter().find_map(|segment| match segment {
            ContentSegment::Text(text) => Some(text.as_str()),
            ContentSegment::Other(_) => None,
        })
    }
}

/// Agent settings sent when the session is created.
#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    pub model: String,
    pub name: String,
    pub instructions: String,
    pub temperature: f32,
    pub top_p: f32,
    pub tools: Vec<Value>,
    pub tool_resources: Value,
}

/// A live conversation: the agent plus the thread holding its turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
}

/// Run lifecycle as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Completed | Self::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A function call the run is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, as produced by the model
    pub arguments: String,
}

/// What a `requires_action` run is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequiredAction {
    SubmitToolApproval(Vec<ToolCallRequest>),
    SubmitToolOutputs(Vec<FunctionCall>),
}

/// One processing pass of the agent over a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub required_action: Option<RequiredAction>,
    pub last_error: Option<String>,
}

/// Result of a locally executed function call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upload a document for file search, returning its file id.
    async fn upload_file(&self, path: &Path) -> Result<String, ServiceError>;

    /// Create a vector store indexing `file_ids` and wait until indexing finishes.
    async fn create_vector_store(
        &self,
        name: &str,
        file_ids: &[String],
    ) -> Result<String, ServiceError>;

    async fn create_session(&self, config: &AgentConfig) -> Result<Session, ServiceError>;

    async fn append_turn(
        &self,
        session: &Session,
        role: Role,
        content: &str,
    ) -> Result<Turn, ServiceError>;

    async fn create_run(&self, session: &Session) -> Result<Run, ServiceError>;

    async fn get_run(&self, session: &Session, run_id: &str) -> Result<Run, ServiceError>;

    /// Resume a `requires_action` run.
    async fn submit_tool_outputs(
        &self,
        session: &Session,
        run_id: &str,
        outputs: Vec<ToolOutput>,
        approvals: Vec<ToolApproval>,
    ) -> Result<Run, ServiceError>;

    async fn cancel_run(&self, session: &Session, run_id: &str) -> Result<(), ServiceError>;

    /// Turns of the session, newest first.
    async fn list_turns(&self, session: &Session) -> Result<Vec<Turn>, ServiceError>;

    /// Delete the agent and thread. Deleting an already deleted session succeeds.
    async fn delete_session(&self, session: &Session) -> Result<(), ServiceError>;
}
