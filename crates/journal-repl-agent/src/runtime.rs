//! Agent runtime orchestration.

use crate::config::AgentConfig;
use crate::persistence::SqliteWriterFactory;
use anyhow::{Context, Result};
use journal_repl_client::{DisconnectReason, JournalClient, StaticTokenProvider};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    client_id: Uuid,
    factory: Arc<SqliteWriterFactory>,
    #[cfg(test)]
    connector: Option<Arc<dyn journal_repl_client::Connector>>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened.
    pub fn new(config: AgentConfig, client_id: Uuid) -> Result<Self> {
        let factory = SqliteWriterFactory::open(&config.persistence.db_path)
            .context("Failed to open SQLite database")?;

        Ok(Self {
            config,
            client_id,
            factory: Arc::new(factory),
            #[cfg(test)]
            connector: None,
        })
    }

    #[cfg(test)]
    fn with_connector(mut self, connector: Arc<dyn journal_repl_client::Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replicate until Ctrl+C or a terminal disconnect.
    ///
    /// # Errors
    ///
    /// Returns error if replication cannot start or ends on its own.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Replicate until `shutdown` resolves or a terminal disconnect.
    ///
    /// # Errors
    ///
    /// Returns error if replication cannot start or ends on its own.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tracing::info!(client_id = %self.client_id, "Starting agent runtime");

        let mut client = self.client()?;
        let (disconnect_tx, mut disconnects) = mpsc::unbounded_channel();
        client.on_disconnect(move |reason: DisconnectReason| {
            let _ = disconnect_tx.send(reason);
        });

        for sub in &self.config.subscriptions {
            let (remote, local) = sub.keys();
            if let Some(state) = self.factory.state(local.derived_location())? {
                tracing::info!(
                    journal = %local.derived_location(),
                    tx = state.tx,
                    rows = state.rows,
                    "Resuming journal"
                );
            }
            client
                .subscribe(remote, local, None)
                .with_context(|| format!("Failed to subscribe {}", sub.class))?;
        }

        client
            .start()
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.connection.node))?;

        tracing::info!(
            node = %self.config.connection.node,
            journals = client.subscriptions(),
            "Agent running, press Ctrl+C to stop"
        );

        let mut ticker = tokio::time::interval(self.config.persistence.commit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let terminal = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break None;
                }
                Some(reason) = disconnects.recv() => {
                    tracing::error!(%reason, "Replication stopped");
                    break Some(reason);
                }
                _ = ticker.tick() => self.commit(),
            }
        };

        // rows not committed before halt are discarded
        self.commit();
        client.halt().await;

        let metrics = client.metrics().snapshot();
        tracing::info!(
            metrics = %serde_json::to_string(&metrics)?,
            "Agent stopped"
        );

        match terminal {
            Some(reason) => anyhow::bail!("replication disconnected: {reason}"),
            None => Ok(()),
        }
    }

    fn client(&self) -> Result<JournalClient> {
        let mut client = JournalClient::new(self.config.client_config(), self.factory.clone());

        if let Some(token) = &self.config.connection.token {
            let provider =
                StaticTokenProvider::from_base64(token).context("Invalid JOURNAL_REPL_TOKEN")?;
            client = client.with_credentials(Arc::new(provider));
        }

        #[cfg(test)]
        if let Some(connector) = &self.connector {
            client = client.with_connector(connector.clone());
        }

        Ok(client)
    }

    fn commit(&self) {
        match self.factory.commit_all() {
            Ok(0) => {}
            Ok(journals) => tracing::debug!(journals, "Committed replicated rows"),
            Err(err) => tracing::warn!(error = %err, "Failed to commit replicated rows"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionConfig;
    use journal_repl_client::MemoryConnector;
    use journal_repl_core::{ColumnMetadata, ColumnType, ColumnValue, JournalStructure};
    use journal_repl_proto::{codec, Command, JournalDelta, ACK_OK};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;

    fn trades() -> JournalStructure {
        JournalStructure::new("trades")
            .column(ColumnMetadata::new("sym", ColumnType::Symbol))
            .column(ColumnMetadata::new("px", ColumnType::Double))
    }

    fn config(dir: &tempfile::TempDir) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.persistence.db_path = dir.path().join("journals.db");
        config.persistence.commit_interval = Duration::from_millis(10);
        config.connection.reconnect.retry_count = 0;
        config.subscriptions = vec![SubscriptionConfig {
            class: "Trade".to_string(),
            remote: Some("trades".to_string()),
            local: Some("replica".to_string()),
            record_hint: 0,
        }];
        config
    }

    async fn expect(stream: &mut DuplexStream, command: Command) {
        assert_eq!(codec::read_command(stream).await.unwrap(), command);
    }

    async fn serve_state(stream: &mut DuplexStream) {
        expect(stream, Command::DeltaRequest).await;
        codec::read_state(stream).await.unwrap();
        codec::write_text(stream, ACK_OK).await.unwrap();
        expect(stream, Command::ClientReady).await;
    }

    async fn serve_handshake(stream: &mut DuplexStream) {
        expect(stream, Command::ProtocolVersion).await;
        codec::read_int(stream).await.unwrap();
        codec::write_text(stream, ACK_OK).await.unwrap();

        expect(stream, Command::SetKey).await;
        codec::read_key(stream).await.unwrap();
        codec::write_text(stream, ACK_OK).await.unwrap();
        codec::write_metadata(stream, &trades()).await.unwrap();

        expect(stream, Command::HandshakeComplete).await;
        codec::write_text(stream, ACK_OK).await.unwrap();
        serve_state(stream).await;
    }

    #[tokio::test]
    async fn replicated_rows_committed_to_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let path = config.persistence.db_path.clone();

        let connector = Arc::new(MemoryConnector::new());
        let mut server = connector.push();
        let agent = Agent::new(config, Uuid::new_v4())
            .unwrap()
            .with_connector(connector);

        let (stop, stopped) = oneshot::channel::<()>();
        let run = tokio::spawn(agent.run_until(async {
            let _ = stopped.await;
        }));

        serve_handshake(&mut server).await;
        let delta = JournalDelta::new(3, 2)
            .row(vec![
                Some(ColumnValue::Symbol("ABC".to_string())),
                Some(ColumnValue::Double(1.5)),
            ])
            .row(vec![Some(ColumnValue::Symbol("XYZ".to_string())), None]);
        codec::write_command(&mut server, Command::JournalDelta).await.unwrap();
        codec::write_delta(&mut server, 0, &delta).await.unwrap();
        codec::write_command(&mut server, Command::ServerReady).await.unwrap();
        serve_state(&mut server).await;

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let store = SqliteWriterFactory::open(&path).unwrap();
        let rows = store.rows("replica").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].len(), 1);
        let state = store.state("replica").unwrap().unwrap();
        assert_eq!((state.tx, state.tx_pin, state.rows), (3, 2, 2));
        assert!(store.state("trades").unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_disconnect_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MemoryConnector::new());
        let mut server = connector.push();
        let agent = Agent::new(config(&dir), Uuid::new_v4())
            .unwrap()
            .with_connector(connector);

        let run = tokio::spawn(agent.run_until(std::future::pending()));

        serve_handshake(&mut server).await;
        codec::write_command(&mut server, Command::ServerShutdown).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("broken-channel"));
    }

    #[tokio::test]
    async fn unreachable_origin_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::new(config(&dir), Uuid::new_v4())
            .unwrap()
            .with_connector(Arc::new(MemoryConnector::new()));

        let err = agent.run_until(std::future::pending()).await.unwrap_err();
        assert!(err.to_string().contains("Failed to connect"));
    }
}
