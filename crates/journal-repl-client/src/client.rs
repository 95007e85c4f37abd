//! Public replication client.

use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::disconnect::{DisconnectCallback, DisconnectCallbacks};
use crate::error::ReplicationError;
use crate::metrics::ClientMetrics;
use crate::reconnect::supervise;
use crate::registry::SubscriptionRegistry;
use crate::session::{handshake, Link, Session};
use crate::transport::{Connector, TcpConnector};
use journal_repl_core::{JournalKey, PartitionBy, TxListener, WriterFactory, WriterHandle};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Subscriber side of a journal replication link.
///
/// Register journals with the `subscribe*` methods, then [`start`](Self::start).
/// `start` runs the handshake on the calling task and, once it succeeds,
/// serves the connection in the background, reconnecting on channel failures
/// within the configured budget. [`halt`](Self::halt) stops the background
/// work and closes local writers.
///
/// Replicated rows are appended but never committed by the client; commit
/// the writers produced by the factory to make them visible.
pub struct JournalClient {
    config: ClientConfig,
    factory: Arc<dyn WriterFactory>,
    connector: Arc<dyn Connector>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    metrics: Arc<ClientMetrics>,
    callbacks: DisconnectCallbacks,
    registry: SubscriptionRegistry,
    running: Arc<AtomicBool>,
    sessions: Arc<AtomicUsize>,
    shutdown: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<SubscriptionRegistry>>,
}

impl JournalClient {
    /// Create a client opening local journals through `factory`.
    #[must_use]
    pub fn new(config: ClientConfig, factory: Arc<dyn WriterFactory>) -> Self {
        Self {
            config,
            factory,
            connector: Arc::new(TcpConnector::new()),
            credentials: None,
            metrics: Arc::new(ClientMetrics::new()),
            callbacks: DisconnectCallbacks::default(),
            registry: SubscriptionRegistry::default(),
            running: Arc::new(AtomicBool::new(false)),
            sessions: Arc::new(AtomicUsize::new(0)),
            shutdown: None,
            supervisor: None,
        }
    }

    /// Present tokens from `provider` when the origin demands authorization.
    #[must_use]
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Open channels through `connector` instead of plain TCP.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Record counters into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Append an observer of terminal disconnects.
    ///
    /// Observers registered while running take effect on the next `start`.
    pub fn on_disconnect(&mut self, callback: impl DisconnectCallback + 'static) {
        self.callbacks.push(Arc::new(callback));
    }

    /// Replicate the remote journal `remote` into the local journal `local`.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::Configuration` unless the client is halted.
    pub fn subscribe(
        &mut self,
        remote: JournalKey,
        local: JournalKey,
        listener: Option<Arc<dyn TxListener>>,
    ) -> Result<u32, ReplicationError> {
        self.check_halted()?;
        self.registry.subscribe(remote, local, listener)
    }

    /// Replicate `class` stored at `location` on both sides.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::Configuration` unless the client is halted.
    pub fn subscribe_location(&mut self, class: &str, location: &str) -> Result<u32, ReplicationError> {
        self.subscribe(
            JournalKey::with_location(class, location),
            JournalKey::with_location(class, location),
            None,
        )
    }

    /// Replicate `class` from `remote` into a different local location.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::Configuration` unless the client is halted.
    pub fn subscribe_relocated(
        &mut self,
        class: &str,
        remote: &str,
        local: &str,
        record_hint: i32,
    ) -> Result<u32, ReplicationError> {
        self.subscribe(
            JournalKey::with_location(class, remote).partitioned(PartitionBy::Default, record_hint),
            JournalKey::with_location(class, local).partitioned(PartitionBy::Default, record_hint),
            None,
        )
    }

    /// Replicate `remote` into an already open local writer.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::Configuration` unless the client is halted,
    /// or a store error if the writer cannot be locked.
    pub fn subscribe_writer(
        &mut self,
        remote: JournalKey,
        writer: WriterHandle,
        listener: Option<Arc<dyn TxListener>>,
    ) -> Result<u32, ReplicationError> {
        self.check_halted()?;
        let local = {
            let guard = journal_repl_core::store::lock_writer(&writer)?;
            let structure = guard.structure();
            JournalKey::with_location(remote.class.clone(), structure.location.clone())
                .partitioned(structure.partition_by, structure.record_hint)
        };
        let index = self.registry.subscribe(remote, local, listener)?;
        self.registry.bind(index, writer)?;
        Ok(index)
    }

    /// Connect, run the handshake, and serve the connection in the background.
    ///
    /// Does nothing if the client is already running.
    ///
    /// # Errors
    ///
    /// Returns the handshake failure. The client is left halted with its
    /// subscriptions intact, so `start` may be retried.
    pub async fn start(&mut self) -> Result<(), ReplicationError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.reap().await {
            // left over from a terminal disconnect
            self.registry.release();
        }

        let link = Arc::new(self.link());
        match handshake(&link, &mut self.registry).await {
            Ok(channel) => {
                // the copy stands in until the supervisor hands the registry back
                let unbound = self.registry.unbound();
                let registry = std::mem::replace(&mut self.registry, unbound);
                let session = Session::new(link.clone(), channel, registry);
                let (shutdown, signal) = watch::channel(false);
                self.supervisor = Some(tokio::spawn(supervise(
                    link,
                    session,
                    signal,
                    self.callbacks.clone(),
                )));
                self.shutdown = Some(shutdown);
                Ok(())
            }
            Err(err) => {
                tracing::error!(node = %self.config.node, error = %err, "Handshake failed");
                self.running.store(false, Ordering::SeqCst);
                self.registry.release();
                Err(err)
            }
        }
    }

    /// Stop background work and close local writers.
    ///
    /// Uncommitted replicated rows are discarded. Subscriptions are kept.
    /// Safe to call at any time, any number of times.
    pub async fn halt(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(node = %self.config.node, "Halting client");
        }
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send_replace(true);
        }
        self.reap().await;
        self.registry.release();
    }

    /// Whether the client is started and has not disconnected for good.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connections currently served by this client, zero or one.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Counters this client records into.
    #[must_use]
    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Number of subscribed journals.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.registry.len()
    }

    fn link(&self) -> Link {
        Link {
            config: self.config.clone(),
            connector: self.connector.clone(),
            factory: self.factory.clone(),
            credentials: self.credentials.clone(),
            metrics: self.metrics.clone(),
            running: self.running.clone(),
            sessions: self.sessions.clone(),
        }
    }

    /// Wait for the supervisor, if any, and take the registry back.
    async fn reap(&mut self) -> bool {
        let Some(supervisor) = self.supervisor.take() else {
            return false;
        };
        match supervisor.await {
            Ok(registry) => self.registry = registry,
            Err(err) => {
                // writers went down with the task; subscriptions survive unbound
                tracing::error!(
                    error = %err,
                    subscriptions = self.registry.len(),
                    "Exception while waiting for client to shutdown gracefully"
                );
            }
        }
        true
    }

    fn check_halted(&self) -> Result<(), ReplicationError> {
        if self.is_running() || self.supervisor.is_some() {
            return Err(ReplicationError::Configuration(
                "subscriptions can only change while the client is halted".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for JournalClient {
    fn drop(&mut self) {
        // a closed channel halts the supervisor, which then releases writers
        drop(self.shutdown.take());
    }
}
