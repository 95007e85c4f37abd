//! # Journal Replication Agent
//!
//! Keeps local `SQLite` journals in step with a journal origin.
//!
//! ## Architecture
//!
//! The agent runs three concurrent activities:
//! 1. **Replication**: the client's background task applies deltas from the origin
//! 2. **Commit**: a ticker makes replicated rows durable at a fixed interval
//! 3. **Supervision**: waits for Ctrl+C or a terminal disconnect, then halts

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod persistence;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting journal replication agent"
    );

    let config = AgentConfig::from_env()?;
    let client_id = config.client_id.unwrap_or_else(Uuid::new_v4);

    tracing::info!(
        %client_id,
        node = %config.connection.node,
        journals = config.subscriptions.len(),
        "Agent initialized"
    );

    let agent = Agent::new(config, client_id)?;
    agent.run().await?;

    Ok(())
}
