//! Configuration management for Agent Console.
//!
//! Configuration is read from environment variables (a `.env` file in the
//! working directory is loaded first by the binary):
//! - `PROJECT_CONNECTION_STRING` - Required for the `http` backend. Agents service endpoint.
//! - `PROJECT_API_KEY` - Required for the `http` backend. Bearer token for the service.
//! - `AGENT_BACKEND` - Optional. `http` or `memory`. Defaults to `http`.
//! - `AGENT_API_VERSION` - Optional. Service api-version. Defaults to `2025-05-01`.
//! - `AGENT_MODEL` - Optional. Model deployment name. Defaults to `gpt-4o`.
//! - `AGENT_NAME` - Optional. Defaults to `my-agent`.
//! - `AGENT_INSTRUCTIONS` - Optional. Instructions file. Defaults to `instructions.txt`.
//! - `AGENT_TEMPERATURE` / `AGENT_TOP_P` - Optional. Default to `0.7`.
//! - `DOCUMENTS_DIR` - Optional. Files indexed for file search. Defaults to `./documents`.
//! - `VECTOR_STORE_ID` - Optional. Reuse an existing vector store instead of uploading.
//! - `VECTOR_STORE_NAME` - Optional. Defaults to `contoso-pizza-store-information`.
//! - `MCP_SERVER_URL` - Optional. Enables the remote MCP tool.
//! - `MCP_SERVER_LABEL` - Optional. Defaults to `contoso_pizza`.
//! - `MCP_ALLOWED_TOOLS` - Optional. Comma-separated allow list (empty = all).
//! - `MCP_REQUIRE_APPROVAL` - Optional. `always` or `never`. Defaults to `always`.
//! - `APPROVAL_TIMEOUT_SECS` - Optional. Defaults to `30`.
//! - `RUN_POLL_INTERVAL_MS` - Optional. Defaults to `500`, must be greater than 0.
//! - `RUN_TIMEOUT_SECS` - Optional. Defaults to `300`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::tools::McpApprovalMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which session store implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Hosted agents service over HTTPS
    Http,
    /// Local non-persistent store (no network)
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "memory" => Ok(Self::Memory),
            other => Err(format!("expected `http` or `memory`, got: {}", other)),
        }
    }
}

/// Connection settings for the hosted agents service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Project endpoint
    pub endpoint: String,

    /// Bearer token
    pub api_key: String,

    /// `api-version` query parameter
    pub api_version: String,
}

/// Remote MCP server settings.
#[derive(Debug, Clone)]
pub struct McpConfig {
    pub server_label: String,
    pub server_url: String,
    pub allowed_tools: Vec<String>,
    pub approval_mode: McpApprovalMode,
}

/// Agent Console configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,

    /// Present when `backend` is `Http`
    pub service: Option<ServiceConfig>,

    pub model: String,
    pub agent_name: String,
    pub instructions_path: PathBuf,
    pub temperature: f32,
    pub top_p: f32,

    /// Directory whose files are uploaded for file search
    pub documents_dir: PathBuf,

    /// Existing vector store to reuse; skips the upload step
    pub vector_store_id: Option<String>,
    pub vector_store_name: String,

    pub mcp: Option<McpConfig>,

    /// How long the approval policy may deliberate before a request is denied
    pub approval_timeout: Duration,

    pub poll_interval: Duration,

    /// Upper bound for a single run, approvals included
    pub run_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if the `http` backend is selected and
    /// `PROJECT_CONNECTION_STRING` or `PROJECT_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = parse_var(&lookup, "AGENT_BACKEND")?.unwrap_or(Backend::Http);

        let service = match backend {
            Backend::Http => {
                let endpoint = lookup("PROJECT_CONNECTION_STRING").ok_or_else(|| {
                    ConfigError::MissingEnvVar("PROJECT_CONNECTION_STRING".to_string())
                })?;
                url::Url::parse(&endpoint).map_err(|e| {
                    ConfigError::InvalidValue("PROJECT_CONNECTION_STRING".to_string(), e.to_string())
                })?;
                let api_key = lookup("PROJECT_API_KEY")
                    .ok_or_else(|| ConfigError::MissingEnvVar("PROJECT_API_KEY".to_string()))?;
                Some(ServiceConfig {
                    endpoint,
                    api_key,
                    api_version: lookup("AGENT_API_VERSION")
                        .unwrap_or_else(|| "2025-05-01".to_string()),
                })
            }
            Backend::Memory => None,
        };

        let mcp = match lookup("MCP_SERVER_URL").filter(|v| !v.trim().is_empty()) {
            Some(server_url) => {
                url::Url::parse(&server_url).map_err(|e| {
                    ConfigError::InvalidValue("MCP_SERVER_URL".to_string(), e.to_string())
                })?;
                Some(McpConfig {
                    server_label: lookup("MCP_SERVER_LABEL")
                        .unwrap_or_else(|| "contoso_pizza".to_string()),
                    server_url,
                    allowed_tools: lookup("MCP_ALLOWED_TOOLS")
                        .map(|v| split_list(&v))
                        .unwrap_or_default(),
                    approval_mode: parse_var(&lookup, "MCP_REQUIRE_APPROVAL")?
                        .unwrap_or(McpApprovalMode::Always),
                })
            }
            None => None,
        };

        let poll_interval_ms: u64 = parse_var(&lookup, "RUN_POLL_INTERVAL_MS")?.unwrap_or(500);
        if poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "RUN_POLL_INTERVAL_MS".to_string(),
                "must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            backend,
            service,
            model: lookup("AGENT_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            agent_name: lookup("AGENT_NAME").unwrap_or_else(|| "my-agent".to_string()),
            instructions_path: lookup("AGENT_INSTRUCTIONS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("instructions.txt")),
            temperature: parse_var(&lookup, "AGENT_TEMPERATURE")?.unwrap_or(0.7),
            top_p: parse_var(&lookup, "AGENT_TOP_P")?.unwrap_or(0.7),
            documents_dir: lookup("DOCUMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./documents")),
            vector_store_id: lookup("VECTOR_STORE_ID").filter(|v| !v.trim().is_empty()),
            vector_store_name: lookup("VECTOR_STORE_NAME")
                .unwrap_or_else(|| "contoso-pizza-store-information".to_string()),
            mcp,
            approval_timeout: Duration::from_secs(
                parse_var(&lookup, "APPROVAL_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            poll_interval: Duration::from_millis(poll_interval_ms),
            run_timeout: Duration::from_secs(parse_var(&lookup, "RUN_TIMEOUT_SECS")?.unwrap_or(300)),
        })
    }

    /// A config for the local backend with default values (useful for testing).
    pub fn local() -> Self {
        Self {
            backend: Backend::Memory,
            service: None,
            model: "gpt-4o".to_string(),
            agent_name: "my-agent".to_string(),
            instructions_path: PathBuf::from("instructions.txt"),
            temperature: 0.7,
            top_p: 0.7,
            documents_dir: PathBuf::from("./documents"),
            vector_store_id: None,
            vector_store_name: "contoso-pizza-store-information".to_string(),
            mcp: None,
            approval_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            run_timeout: Duration::from_secs(300),
        }
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e)))
        })
        .transpose()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
