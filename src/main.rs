//! Agent Console - interactive entry point
//!
//! Provisions the agent, then chats over stdin/stdout until `exit` or `quit`.

use agent_console::{config::Config, setup};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Values from .env override the environment
    if let Err(e) = dotenvy::dotenv_override() {
        if !e.not_found() {
            return Err(e.into());
        }
    }

    // Logs go to stderr so stdout stays a clean transcript
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_console=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    info!("Loaded configuration: backend={:?}, model={}", config.backend, config.model);

    let driver = setup::start(&config).await?;

    // The session is deleted however the loop ends, Ctrl-C included
    let result = driver
        .run_guarded(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown_signal(),
        )
        .await;

    // An interrupted stdin read would keep the runtime from shutting down
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1)
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
