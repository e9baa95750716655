//! # Agent Console
//!
//! An interactive console for a conversational agent hosted by an agents
//! service.
//!
//! This library provides:
//! - Provisioning of the agent: document upload, vector store indexing for
//!   file search, local function tools and remote MCP tools
//! - A turn driver that submits each user utterance, processes the run and
//!   prints the agent's reply
//! - Approval policies for MCP tool calls that the service will not run
//!   without consent
//!
//! ## Architecture
//!
//! Each turn follows the same loop:
//! 1. Append the user's text to the session
//! 2. Start a run and poll it
//! 3. Answer approval requests through the [`approval::ApprovalPolicy`] and
//!    function calls through the [`tools::ToolRegistry`]
//! 4. Read the newest agent message back as the reply
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_console::{config::Config, setup};
//!
//! let config = Config::from_env()?;
//! let mut driver = setup::start(&config).await?;
//! let reply = driver.handle_input("Which stores are open on Sunday?").await;
//! driver.shutdown().await?;
//! ```

pub mod agent;
pub mod approval;
pub mod config;
pub mod error;
pub mod session;
pub mod setup;
pub mod tools;

pub use config::Config;
