//! Provisioning: everything that has to exist before the first turn.
//!
//! 1. Index the store documents for file search (or reuse a vector store)
//! 2. Register the tools
//! 3. Create the agent and its thread
//!
//! Any failure here is a [`SetupError`] and aborts the program.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::agent::{load_instructions, AgentContext, RunOptions, TurnDriver};
use crate::approval::{ApprovalPolicy, ApproveAll, TimeoutPolicy};
use crate::config::{Backend, Config, ConfigError};
use crate::error::SetupError;
use crate::session::{AgentConfig, HttpSessionStore, InMemorySessionStore, SessionStore};
use crate::tools::{CalculatePizzaForPeople, FileSearchTool, McpTool, ToolRegistry};

/// Build the session store the config selects.
pub fn build_store(config: &Config) -> Result<Arc<dyn SessionStore>, SetupError> {
    match config.backend {
        Backend::Http => {
            let service = config.service.as_ref().ok_or_else(|| {
                ConfigError::MissingEnvVar("PROJECT_CONNECTION_STRING".to_string())
            })?;
            Ok(Arc::new(HttpSessionStore::new(service)?))
        }
        Backend::Memory => Ok(Arc::new(InMemorySessionStore::new())),
    }
}

/// Regular files directly inside `dir`, sorted by name. A missing directory has none.
fn document_paths(dir: &Path) -> Result<Vec<PathBuf>, SetupError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SetupError::Read {
                path: dir.display().to_string(),
                source,
            })
        }
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| SetupError::Read {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Vector store backing file search, or `None` when there is nothing to search.
pub async fn prepare_vector_store(
    config: &Config,
    store: &dyn SessionStore,
) -> Result<Option<String>, SetupError> {
    if let Some(id) = &config.vector_store_id {
        tracing::info!("Using existing vector store {}", id);
        return Ok(Some(id.clone()));
    }

    let paths = document_paths(&config.documents_dir)?;
    if paths.is_empty() {
        tracing::warn!(
            "No documents in {}, file search disabled",
            config.documents_dir.display()
        );
        return Ok(None);
    }

    tracing::info!("Uploading files from {} ...", config.documents_dir.display());
    let mut file_ids = Vec::with_capacity(paths.len());
    for path in &paths {
        file_ids.push(store.upload_file(path).await?);
    }
    tracing::info!("Uploaded {} files", file_ids.len());

    let id = store
        .create_vector_store(&config.vector_store_name, &file_ids)
        .await?;
    tracing::info!("Created vector store, vector store ID: {}", id);
    Ok(Some(id))
}

/// Register file search (when available), the function tools and the MCP server.
pub fn build_registry(
    config: &Config,
    vector_store_id: Option<String>,
) -> Result<ToolRegistry, SetupError> {
    let mut registry = ToolRegistry::new();

    if let Some(id) = vector_store_id {
        registry.register(FileSearchTool::new(vec![id]))?;
    }
    registry.register(CalculatePizzaForPeople)?;

    if let Some(mcp) = &config.mcp {
        let mut tool = McpTool::new(
            mcp.server_label.clone(),
            mcp.server_url.clone(),
            mcp.allowed_tools.clone(),
        );
        tool.set_approval_mode(mcp.approval_mode);
        registry.register(tool)?;
    }

    Ok(registry)
}

/// Provision everything and hand back a driver holding the new session.
pub async fn start(config: &Config) -> Result<TurnDriver, SetupError> {
    let store = build_store(config)?;
    start_with_store(config, store).await
}

pub async fn start_with_store(
    config: &Config,
    store: Arc<dyn SessionStore>,
) -> Result<TurnDriver, SetupError> {
    let vector_store_id = prepare_vector_store(config, store.as_ref()).await?;
    let registry = build_registry(config, vector_store_id)?;
    let instructions = load_instructions(&config.instructions_path, &registry)?;

    let agent = AgentConfig {
        model: config.model.clone(),
        name: config.agent_name.clone(),
        instructions,
        temperature: config.temperature,
        top_p: config.top_p,
        tools: registry.definitions(),
        tool_resources: registry.tool_resources(),
    };
    let session = store.create_session(&agent).await?;
    tracing::info!("Created agent, ID: {}", session.agent_id);
    tracing::info!("Created thread, ID: {}", session.id);

    let policy: Arc<dyn ApprovalPolicy> = Arc::new(TimeoutPolicy::new(
        ApproveAll::from_registry(&registry),
        config.approval_timeout,
    ));

    Ok(TurnDriver::new(
        AgentContext {
            store,
            registry: Arc::new(registry),
            policy,
            options: RunOptions {
                poll_interval: config.poll_interval,
                run_timeout: config.run_timeout,
            },
        },
        session,
    ))
}
