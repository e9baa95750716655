//! In-memory session store (non-persistent).
//!
//! Plays the part of the hosted service without a network: the agent echoes
//! the user, and runs can be scripted to call tools so the approval and
//! function-output paths are exercised end to end.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AgentConfig, ContentSegment, FunctionCall, RequiredAction, Role, Run, RunStatus, Session,
    SessionStore, ToolOutput, Turn,
};
use crate::approval::{ToolApproval, ToolCallRequest};
use crate::error::ServiceError;

/// A tool call the simulated agent makes during every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedCall {
    /// Call a tool on a registered MCP server
    Mcp {
        server_label: String,
        name: String,
        arguments: String,
    },
    /// Call a locally executed function tool
    Function { name: String, arguments: String },
}

#[derive(Debug)]
struct SessionState {
    agent: AgentConfig,
    turns: Vec<Turn>,
}

#[derive(Debug)]
struct RunState {
    session_id: String,
    run: Run,
    /// Actions still to surface, in order
    pending: Vec<RequiredAction>,
    /// Lines collected for the final reply
    notes: Vec<String>,
    prompt: String,
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionState>>>,
    runs: Arc<RwLock<HashMap<String, RunState>>>,
    files: Arc<RwLock<HashMap<String, String>>>,
    plan: Arc<RwLock<Vec<PlannedCall>>>,
    fail_next_run: Arc<RwLock<Option<String>>>,
    runs_created: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Have every subsequent run make `calls` before replying.
    pub async fn set_plan(&self, calls: Vec<PlannedCall>) {
        *self.plan.write().await = calls;
    }

    /// Make the next run end in `failed` with `message`.
    pub async fn fail_next_run(&self, message: impl Into<String>) {
        *self.fail_next_run.write().await = Some(message.into());
    }

    pub fn runs_created(&self) -> usize {
        self.runs_created.load(Ordering::SeqCst)
    }

    /// Number of `delete_session` calls, including repeated ones.
    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn agent_config(&self, session: &Session) -> Option<AgentConfig> {
        self.sessions
            .read()
            .await
            .get(&session.id)
            .map(|s| s.agent.clone())
    }

    fn new_id(prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::new_v4().simple())
    }

    /// Whether the agent was created with approvals switched off for `server_label`.
    fn approval_skipped(agent: &AgentConfig, server_label: &str) -> bool {
        agent.tool_resources["mcp"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|m| m["server_label"].as_str() == Some(server_label))
            .map(|m| m["require_approval"].as_str() == Some("never"))
            .unwrap_or(false)
    }

    /// Finish a run whose actions are all resolved, writing the agent's reply.
    async fn complete(&self, state: &mut RunState) -> Result<(), ServiceError> {
        let mut reply = format!("You said: {}", state.prompt);
        for note in &state.notes {
            reply.push('\n');
            reply.push_str(note);
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&state.session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {}", state.session_id)))?;
        session.turns.push(Turn {
            id: Self::new_id("msg"),
            role: Role::Agent,
            content: vec![ContentSegment::Text(reply)],
            created_at: Utc::now(),
        });

        state.run.status = RunStatus::Completed;
        state.run.required_action = None;
        Ok(())
    }

    async fn advance(&self, state: &mut RunState) -> Result<(), ServiceError> {
        if state.pending.is_empty() {
            self.complete(state).await
        } else {
            state.run.status = RunStatus::RequiresAction;
            state.run.required_action = Some(state.pending.remove(0));
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn upload_file(&self, path: &Path) -> Result<String, ServiceError> {
        let contents = tokio::fs::read_to_string(path).await?;
        let id = Self::new_id("file");
        self.files.write().await.insert(id.clone(), contents);
        tracing::debug!(file_id = %id, path = %path.display(), "Stored file");
        Ok(id)
    }

    async fn create_vector_store(
        &self,
        name: &str,
        file_ids: &[String],
    ) -> Result<String, ServiceError> {
        let files = self.files.read().await;
        if let Some(missing) = file_ids.iter().find(|id| !files.contains_key(*id)) {
            return Err(ServiceError::NotFound(format!("file {}", missing)));
        }
        let id = Self::new_id("vs");
        tracing::debug!(vector_store_id = %id, name, files = file_ids.len(), "Created vector store");
        Ok(id)
    }

    async fn create_session(&self, config: &AgentConfig) -> Result<Session, ServiceError> {
        let session = Session {
            id: Self::new_id("thread"),
            agent_id: Self::new_id("asst"),
        };
        self.sessions.write().await.insert(
            session.id.clone(),
            SessionState {
                agent: config.clone(),
                turns: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn append_turn(
        &self,
        session: &Session,
        role: Role,
        content: &str,
    ) -> Result<Turn, ServiceError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(&session.id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {}", session.id)))?;
        let turn = Turn {
            id: Self::new_id("msg"),
            role,
            content: vec![ContentSegment::Text(content.to_string())],
            created_at: Utc::now(),
        };
        state.turns.push(turn.clone());
        Ok(turn)
    }

    async fn create_run(&self, session: &Session) -> Result<Run, ServiceError> {
        self.runs_created.fetch_add(1, Ordering::SeqCst);

        let (agent, prompt) = {
            let sessions = self.sessions.read().await;
            let state = sessions
                .get(&session.id)
                .ok_or_else(|| ServiceError::NotFound(format!("session {}", session.id)))?;
            let prompt = state
                .turns
                .iter()
                .rev()
                .find(|t| t.role == Role::User)
                .and_then(|t| t.text())
                .unwrap_or_default()
                .to_string();
            (state.agent.clone(), prompt)
        };

        let mut state = RunState {
            session_id: session.id.clone(),
            run: Run {
                id: Self::new_id("run"),
                status: RunStatus::Queued,
                required_action: None,
                last_error: None,
            },
            pending: Vec::new(),
            notes: Vec::new(),
            prompt,
        };

        if let Some(message) = self.fail_next_run.write().await.take() {
            state.run.status = RunStatus::Failed;
            state.run.last_error = Some(message);
        } else {
            let mut approvals = Vec::new();
            let mut functions = Vec::new();
            for call in self.plan.read().await.iter() {
                match call {
                    PlannedCall::Mcp {
                        server_label,
                        name,
                        arguments,
                    } => {
                        if Self::approval_skipped(&agent, server_label) {
                            state.notes.push(format!("{} ran without approval", name));
                        } else {
                            approvals.push(ToolCallRequest {
                                id: Self::new_id("call"),
                                name: name.clone(),
                                server_label: server_label.clone(),
                                arguments: arguments.clone(),
                                requires_approval: true,
                            });
                        }
                    }
                    PlannedCall::Function { name, arguments } => functions.push(FunctionCall {
                        id: Self::new_id("call"),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    }),
                }
            }
            if !approvals.is_empty() {
                state.pending.push(RequiredAction::SubmitToolApproval(approvals));
            }
            if !functions.is_empty() {
                state.pending.push(RequiredAction::SubmitToolOutputs(functions));
            }
            self.advance(&mut state).await?;
        }

        let run = state.run.clone();
        self.runs.write().await.insert(run.id.clone(), state);
        Ok(run)
    }

    async fn get_run(&self, session: &Session, run_id: &str) -> Result<Run, ServiceError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .filter(|r| r.session_id == session.id)
            .map(|r| r.run.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("run {}", run_id)))
    }

    async fn submit_tool_outputs(
        &self,
        session: &Session,
        run_id: &str,
        outputs: Vec<ToolOutput>,
        approvals: Vec<ToolApproval>,
    ) -> Result<Run, ServiceError> {
        let mut runs = self.runs.write().await;
        let state = runs
            .get_mut(run_id)
            .filter(|r| r.session_id == session.id)
            .ok_or_else(|| ServiceError::NotFound(format!("run {}", run_id)))?;

        let Some(action) = state.run.required_action.clone() else {
            return Err(ServiceError::Status {
                status: 400,
                body: format!("run {} is {}, not requires_action", run_id, state.run.status),
            });
        };

        match action {
            RequiredAction::SubmitToolApproval(requests) => {
                for request in &requests {
                    let approval = approvals
                        .iter()
                        .find(|a| a.tool_call_id == request.id)
                        .ok_or_else(|| ServiceError::Status {
                            status: 400,
                            body: format!("missing approval for {}", request.id),
                        })?;
                    let note = if approval.approve() {
                        format!("{} approved: {}", request.name, request.arguments)
                    } else {
                        format!("{} was declined", request.name)
                    };
                    state.notes.push(note);
                }
            }
            RequiredAction::SubmitToolOutputs(calls) => {
                for call in &calls {
                    let output = outputs
                        .iter()
                        .find(|o| o.tool_call_id == call.id)
                        .ok_or_else(|| ServiceError::Status {
                            status: 400,
                            body: format!("missing output for {}", call.id),
                        })?;
                    state.notes.push(format!("{} returned: {}", call.name, output.output));
                }
            }
        }

        self.advance(state).await?;
        Ok(state.run.clone())
    }

    async fn cancel_run(&self, session: &Session, run_id: &str) -> Result<(), ServiceError> {
        let mut runs = self.runs.write().await;
        if let Some(state) = runs
            .get_mut(run_id)
            .filter(|r| r.session_id == session.id)
        {
            if !state.run.status.is_terminal() {
                state.run.status = RunStatus::Cancelled;
                state.run.required_action = None;
            }
        }
        Ok(())
    }

    async fn list_turns(&self, session: &Session) -> Result<Vec<Turn>, ServiceError> {
        let sessions = self.sessions.read().await;
        let state = sessions
            .get(&session.id)
            .ok_or_else(|| ServiceError::NotFound(format!("session {}", session.id)))?;
        Ok(state.turns.iter().rev().cloned().collect())
    }

    async fn delete_session(&self, session: &Session) -> Result<(), ServiceError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.sessions.write().await.remove(&session.id).is_some() {
            self.runs
                .write()
                .await
                .retain(|_, r| r.session_id != session.id);
        }
        Ok(())
    }
}

/// Tool resources advertising one MCP server with the given approval setting.
#[cfg(test)]
pub(crate) fn mcp_resources(server_label: &str, require_approval: &str) -> serde_json::Value {
    serde_json::json!({
        "mcp": [{ "server_label": server_label, "headers": {}, "require_approval": require_approval }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn agent(tool_resources: Value) -> AgentConfig {
        AgentConfig {
            model: "gpt-4o".to_string(),
            name: "test".to_string(),
            instructions: String::new(),
            temperature: 0.7,
            top_p: 0.7,
            tools: vec![],
            tool_resources,
        }
    }

    #[tokio::test]
    async fn echo_run_completes_immediately() {
        let store = InMemorySessionStore::new();
        let session = store.create_session(&agent(Value::Null)).await.unwrap();
        store.append_turn(&session, Role::User, "hi").await.unwrap();

        let run = store.create_run(&session).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let turns = store.list_turns(&session).await.unwrap();
        assert_eq!(turns[0].role, Role::Agent);
        assert_eq!(turns[0].text(), Some("You said: hi"));
        assert_eq!(turns[1].role, Role::User);
    }

    #[tokio::test]
    async fn mcp_calls_without_approval_never_surface() {
        let store = InMemorySessionStore::new();
        store
            .set_plan(vec![PlannedCall::Mcp {
                server_label: "pizza".to_string(),
                name: "get_menu".to_string(),
                arguments: "{}".to_string(),
            }])
            .await;
        let session = store
            .create_session(&agent(mcp_resources("pizza", "never")))
            .await
            .unwrap();
        store.append_turn(&session, Role::User, "menu?").await.unwrap();

        let run = store.create_run(&session).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let turns = store.list_turns(&session).await.unwrap();
        assert!(turns[0].text().unwrap().contains("get_menu ran without approval"));
    }

    #[tokio::test]
    async fn submitting_without_pending_action_is_rejected() {
        let store = InMemorySessionStore::new();
        let session = store.create_session(&agent(Value::Null)).await.unwrap();
        store.append_turn(&session, Role::User, "hi").await.unwrap();
        let run = store.create_run(&session).await.unwrap();

        let err = store
            .submit_tool_outputs(&session, &run.id, vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 400, .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemorySessionStore::new();
        let session = store.create_session(&agent(Value::Null)).await.unwrap();

        store.delete_session(&session).await.unwrap();
        store.delete_session(&session).await.unwrap();

        assert_eq!(store.session_count().await, 0);
        assert_eq!(store.delete_calls(), 2);
    }
}
