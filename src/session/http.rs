//! REST client for the hosted agents service (Assistants-style API).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    AgentConfig, ContentSegment, FunctionCall, RequiredAction, Role, Run, RunStatus, Session,
    SessionStore, ToolOutput, Turn,
};
use crate::approval::{ToolApproval, ToolCallRequest};
use crate::config::ServiceConfig;
use crate::error::ServiceError;

/// How often to check on vector store indexing.
const INDEX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Give up on a file batch that is still indexing after this long.
const INDEX_TIMEOUT: Duration = Duration::from_secs(600);

pub struct HttpSessionStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    api_version: String,
    index_timeout: Duration,
}

impl HttpSessionStore {
    pub fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("agent-console/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &ServiceConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
            index_timeout: INDEX_TIMEOUT,
        }
    }

    /// Override how long vector store indexing may take.
    pub fn with_index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout = timeout;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.endpoint, path))
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(&self.api_key)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ServiceError> {
        let response = check(request.send().await?).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ServiceError::Decode(format!("{}: {}", e, body)))
    }

    async fn delete(&self, path: &str) -> Result<(), ServiceError> {
        match check(self.request(Method::DELETE, path).send().await?).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!("{} already deleted", path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn check(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ServiceError::NotFound(body));
    }
    Err(ServiceError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ListObject<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    role: Role,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    created_at: i64,
}

impl From<WireMessage> for Turn {
    fn from(message: WireMessage) -> Self {
        let content = message
            .content
            .iter()
            .map(|item| match item["type"].as_str() {
                Some("text") => ContentSegment::Text(
                    item["text"]["value"].as_str().unwrap_or_default().to_string(),
                ),
                other => ContentSegment::Other(other.unwrap_or("unknown").to_string()),
            })
            .collect();
        let created_at: DateTime<Utc> = Utc
            .timestamp_opt(message.created_at, 0)
            .single()
            .unwrap_or_else(Utc::now);

        Turn {
            id: message.id,
            role: message.role,
            content,
            created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRun {
    id: String,
    status: RunStatus,
    #[serde(default)]
    required_action: Option<Value>,
    #[serde(default)]
    last_error: Option<Value>,
}

impl WireRun {
    fn into_run(self) -> Result<Run, ServiceError> {
        let required_action = self
            .required_action
            .filter(|v| !v.is_null())
            .map(|action| parse_required_action(&action))
            .transpose()?;
        let last_error = self.last_error.filter(|v| !v.is_null()).map(|e| {
            e["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string())
        });

        Ok(Run {
            id: self.id,
            status: self.status,
            required_action,
            last_error,
        })
    }
}

/// A non-empty string field of a tool call.
fn tool_call_field<'a>(call: &'a Value, pointer: &str) -> Result<&'a str, ServiceError> {
    call.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServiceError::Decode(format!("tool call without {}: {}", pointer, call)))
}

fn parse_required_action(action: &Value) -> Result<RequiredAction, ServiceError> {
    let kind = action["type"].as_str().unwrap_or_default();
    let calls = action[kind]["tool_calls"]
        .as_array()
        .ok_or_else(|| ServiceError::Decode(format!("required_action without tool_calls: {}", action)))?;

    match kind {
        "submit_tool_approval" => Ok(RequiredAction::SubmitToolApproval(
            calls
                .iter()
                .map(|call| {
                    Ok(ToolCallRequest {
                        id: tool_call_field(call, "/id")?.to_string(),
                        name: tool_call_field(call, "/name")?.to_string(),
                        server_label: call["server_label"].as_str().unwrap_or_default().to_string(),
                        arguments: call["arguments"].as_str().unwrap_or("{}").to_string(),
                        requires_approval: true,
                    })
                })
                .collect::<Result<_, ServiceError>>()?,
        )),
        "submit_tool_outputs" => Ok(RequiredAction::SubmitToolOutputs(
            calls
                .iter()
                .filter(|call| call["type"].as_str().unwrap_or("function") == "function")
                .map(|call| {
                    Ok(FunctionCall {
                        id: tool_call_field(call, "/id")?.to_string(),
                        name: tool_call_field(call, "/function/name")?.to_string(),
                        arguments: call["function"]["arguments"]
                            .as_str()
                            .unwrap_or("{}")
                            .to_string(),
                    })
                })
                .collect::<Result<_, ServiceError>>()?,
        )),
        other => Err(ServiceError::Decode(format!(
            "unsupported required_action type: {}",
            other
        ))),
    }
}

#[async_trait]
impl SessionStore for HttpSessionStore {
    async fn upload_file(&self, path: &Path) -> Result<String, ServiceError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());

        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let file: IdObject = self
            .send(self.request(Method::POST, "/files").multipart(form))
            .await?;
        tracing::debug!(file_id = %file.id, path = %path.display(), "Uploaded file");
        Ok(file.id)
    }

    async fn create_vector_store(
        &self,
        name: &str,
        file_ids: &[String],
    ) -> Result<String, ServiceError> {
        let store: IdObject = self
            .send(
                self.request(Method::POST, "/vector_stores")
                    .json(&json!({ "name": name, "file_ids": [] })),
            )
            .await?;

        if file_ids.is_empty() {
            return Ok(store.id);
        }

        let batches_path = format!("/vector_stores/{}/file_batches", store.id);
        let mut batch: BatchObject = self
            .send(
                self.request(Method::POST, &batches_path)
                    .json(&json!({ "file_ids": file_ids })),
            )
            .await?;

        let batch_path = format!("{}/{}", batches_path, batch.id);
        let batch_id = batch.id.clone();
        let indexing = async move {
            while batch.status == "in_progress" || batch.status == "queued" {
                tokio::time::sleep(INDEX_POLL_INTERVAL).await;
                batch = self.send(self.request(Method::GET, &batch_path)).await?;
            }
            Ok::<_, ServiceError>(batch)
        };
        let batch = tokio::time::timeout(self.index_timeout, indexing)
            .await
            .map_err(|_| ServiceError::Timeout {
                what: format!("Indexing of file batch {}", batch_id),
                timeout: self.index_timeout,
            })??;

        if batch.status != "completed" {
            return Err(ServiceError::Decode(format!(
                "file batch {} ended with status {}",
                batch.id, batch.status
            )));
        }
        Ok(store.id)
    }

    async fn create_session(&self, config: &AgentConfig) -> Result<Session, ServiceError> {
        let agent: IdObject = self
            .send(self.request(Method::POST, "/assistants").json(config))
            .await?;

        let thread: IdObject = match self
            .send(self.request(Method::POST, "/threads").json(&json!({})))
            .await
        {
            Ok(thread) => thread,
            Err(e) => {
                // The agent is useless without a thread; don't leak it.
                if let Err(cleanup) = self.delete(&format!("/assistants/{}", agent.id)).await {
                    tracing::warn!("Failed to delete agent {}: {}", agent.id, cleanup);
                }
                return Err(e);
            }
        };

        Ok(Session {
            id: thread.id,
            agent_id: agent.id,
        })
    }

    async fn append_turn(
        &self,
        session: &Session,
        role: Role,
        content: &str,
    ) -> Result<Turn, ServiceError> {
        let message: WireMessage = self
            .send(
                self.request(Method::POST, &format!("/threads/{}/messages", session.id))
                    .json(&json!({ "role": role, "content": content })),
            )
            .await?;
        Ok(message.into())
    }

    async fn create_run(&self, session: &Session) -> Result<Run, ServiceError> {
        let run: WireRun = self
            .send(
                self.request(Method::POST, &format!("/threads/{}/runs", session.id))
                    .json(&json!({ "assistant_id": session.agent_id })),
            )
            .await?;
        run.into_run()
    }

    async fn get_run(&self, session: &Session, run_id: &str) -> Result<Run, ServiceError> {
        let run: WireRun = self
            .send(self.request(
                Method::GET,
                &format!("/threads/{}/runs/{}", session.id, run_id),
            ))
            .await?;
        run.into_run()
    }

    async fn submit_tool_outputs(
        &self,
        session: &Session,
        run_id: &str,
        outputs: Vec<ToolOutput>,
        approvals: Vec<ToolApproval>,
    ) -> Result<Run, ServiceError> {
        let mut body = serde_json::Map::new();
        if !outputs.is_empty() {
            body.insert("tool_outputs".to_string(), json!(outputs));
        }
        if !approvals.is_empty() {
            let wire: Vec<_> = approvals.iter().map(ToolApproval::to_wire).collect();
            body.insert("tool_approvals".to_string(), json!(wire));
        }

        let run: WireRun = self
            .send(
                self.request(
                    Method::POST,
                    &format!(
                        "/threads/{}/runs/{}/submit_tool_outputs",
                        session.id, run_id
                    ),
                )
                .json(&body),
            )
            .await?;
        run.into_run()
    }

    async fn cancel_run(&self, session: &Session, run_id: &str) -> Result<(), ServiceError> {
        let _: Value = self
            .send(self.request(
                Method::POST,
                &format!("/threads/{}/runs/{}/cancel", session.id, run_id),
            ))
            .await?;
        Ok(())
    }

    async fn list_turns(&self, session: &Session) -> Result<Vec<Turn>, ServiceError> {
        let list: ListObject<WireMessage> = self
            .send(
                self.request(Method::GET, &format!("/threads/{}/messages", session.id))
                    .query(&[("order", "desc")]),
            )
            .await?;
        Ok(list.data.into_iter().map(Turn::from).collect())
    }

    async fn delete_session(&self, session: &Session) -> Result<(), ServiceError> {
        // The thread goes even when the agent could not be deleted
        let agent = self
            .delete(&format!("/assistants/{}", session.agent_id))
            .await;
        let thread = self.delete(&format!("/threads/{}", session.id)).await;
        if let (Err(_), Err(e)) = (&agent, &thread) {
            tracing::warn!("Failed to delete thread {}: {}", session.id, e);
        }
        agent.and(thread)
    }
}
