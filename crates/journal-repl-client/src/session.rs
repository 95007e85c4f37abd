//! Connection bring-up and the per-connection command loop.

use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::disconnect::DisconnectReason;
use crate::error::ReplicationError;
use crate::metrics::ClientMetrics;
use crate::registry::SubscriptionRegistry;
use crate::transport::{BoxedChannel, Connector, StatsReader};
use journal_repl_core::WriterFactory;
use journal_repl_proto::codec;
use journal_repl_proto::{
    Command, IndexedJournalKey, IndexedJournalState, ScratchBuffer, ACK_OK, AUTH_REQUIRED,
    PROTOCOL_VERSION,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Everything a connection needs from its client.
pub(crate) struct Link {
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) factory: Arc<dyn WriterFactory>,
    pub(crate) credentials: Option<Arc<dyn CredentialProvider>>,
    pub(crate) metrics: Arc<ClientMetrics>,
    pub(crate) running: Arc<AtomicBool>,
    /// Live sessions of this client; never more than one.
    pub(crate) sessions: Arc<AtomicUsize>,
}

impl Link {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Open a fresh channel and run the handshake over it.
///
/// The registry is borrowed exclusively for the duration, and no session can
/// exist while it is, so handshake and command loop never overlap.
pub(crate) async fn handshake(
    link: &Link,
    registry: &mut SubscriptionRegistry,
) -> Result<BoxedChannel, ReplicationError> {
    debug_assert_eq!(
        link.sessions.load(Ordering::SeqCst),
        0,
        "handshake overlapping a live session"
    );

    let mut channel = link
        .connector
        .connect(&link.config.node, &link.config.ssl)
        .await?;

    send_protocol_version(&mut channel).await?;
    send_keys(link, &mut channel, registry).await?;
    debug_assert!(registry.all_bound());
    check_auth_and_send_credential(link, &mut channel).await?;
    send_state(&mut channel, registry).await?;

    tracing::info!(node = %link.config.node, journals = registry.len(), "Handshake complete");
    Ok(channel)
}

async fn send_protocol_version(channel: &mut BoxedChannel) -> Result<(), ReplicationError> {
    codec::write_command(channel, Command::ProtocolVersion).await?;
    codec::write_int(channel, PROTOCOL_VERSION).await?;
    check_ack(channel).await
}

async fn send_keys(
    link: &Link,
    channel: &mut BoxedChannel,
    registry: &mut SubscriptionRegistry,
) -> Result<(), ReplicationError> {
    let mut scratch = ScratchBuffer::new(link.config.max_metadata_bytes);

    for index in 0..registry.len() {
        let index = u32::try_from(index)
            .map_err(|_| ReplicationError::Configuration("too many subscriptions".to_string()))?;
        let key = match registry.get(index) {
            Some(subscription) => subscription.remote_key.clone(),
            None => break,
        };

        codec::write_command(channel, Command::SetKey).await?;
        codec::write_key(channel, &IndexedJournalKey { index, key }).await?;
        check_ack(channel).await?;

        let remote = scratch.read_metadata(channel).await?;
        registry.open(index, &remote, link.factory.as_ref())?;
    }

    scratch.free();
    Ok(())
}

async fn check_auth_and_send_credential(
    link: &Link,
    channel: &mut BoxedChannel,
) -> Result<(), ReplicationError> {
    codec::write_command(channel, Command::HandshakeComplete).await?;
    let response = codec::read_text(channel).await?;

    if response == AUTH_REQUIRED {
        let provider = link.credentials.as_ref().ok_or_else(|| {
            ReplicationError::Configuration(
                "origin requires authorization but no credential provider is configured"
                    .to_string(),
            )
        })?;
        let token = provider
            .create_token()
            .map_err(|e| ReplicationError::AuthFailure(e.to_string()))?;

        codec::write_command(channel, Command::Authorization).await?;
        codec::write_blob(channel, &token).await?;

        let response = codec::read_text(channel).await?;
        if response != ACK_OK {
            return Err(ReplicationError::AuthFailure(response));
        }
        tracing::debug!("Authorized");
    } else if response != ACK_OK {
        return Err(ReplicationError::Protocol(format!(
            "unknown server response: {response}"
        )));
    }

    Ok(())
}

/// Announce state of every journal not yet announced, then signal readiness.
async fn send_state(
    channel: &mut BoxedChannel,
    registry: &mut SubscriptionRegistry,
) -> Result<(), ReplicationError> {
    for subscription in registry.iter_mut() {
        if subscription.state_sent || subscription.applier.is_none() {
            continue;
        }

        let state = IndexedJournalState {
            index: subscription.index,
            state: subscription.local_state()?,
        };
        codec::write_command(channel, Command::DeltaRequest).await?;
        codec::write_state(channel, &state).await?;
        check_ack(channel).await?;
        subscription.state_sent = true;
    }

    send_ready(channel).await
}

async fn send_ready(channel: &mut BoxedChannel) -> Result<(), ReplicationError> {
    codec::write_command(channel, Command::ClientReady).await?;
    tracing::debug!("Client ready");
    Ok(())
}

async fn check_ack(channel: &mut BoxedChannel) -> Result<(), ReplicationError> {
    let response = codec::read_text(channel).await?;
    if response == ACK_OK {
        Ok(())
    } else {
        Err(ReplicationError::Network(response))
    }
}

/// One live connection: the channel a handshake produced plus the registry
/// it was produced for.
pub(crate) struct Session {
    link: Arc<Link>,
    channel: BoxedChannel,
    registry: SubscriptionRegistry,
    peer: String,
}

impl Session {
    pub(crate) fn new(link: Arc<Link>, channel: BoxedChannel, registry: SubscriptionRegistry) -> Self {
        let previous = link.sessions.fetch_add(1, Ordering::SeqCst);
        debug_assert_eq!(previous, 0, "overlapping sessions");
        link.metrics.connection_opened();

        let peer = link.config.node.to_string();
        Self {
            link,
            channel,
            registry,
            peer,
        }
    }

    /// Serve commands until the connection ends.
    ///
    /// Returns the registry for the next handshake and the reason the
    /// connection ended. The channel is closed on return.
    pub(crate) async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> (SubscriptionRegistry, DisconnectReason) {
        let reason = loop {
            let step = tokio::select! {
                biased;
                () = halted(&mut shutdown) => break DisconnectReason::ClientHalted,
                step = self.step() => step,
            };

            match step {
                Ok(None) => {}
                Ok(Some(reason)) => break reason,
                Err(err) => break self.classify(&err),
            }
        };

        tracing::debug!(peer = %self.peer, %reason, "Connection closed");
        (std::mem::take(&mut self.registry), reason)
    }

    /// Read and dispatch one command. `Some` ends the connection.
    async fn step(&mut self) -> Result<Option<DisconnectReason>, ReplicationError> {
        let opcode = codec::read_opcode(&mut self.channel).await?;

        match Command::from_opcode(opcode) {
            Some(Command::JournalDelta) => {
                self.receive_delta().await?;
                Ok(None)
            }
            Some(Command::ServerReady) => {
                if self.link.is_running() {
                    send_state(&mut self.channel, &mut self.registry).await?;
                    Ok(None)
                } else {
                    self.send_disconnect().await?;
                    Ok(Some(DisconnectReason::ClientHalted))
                }
            }
            Some(Command::ServerHeartbeat) => {
                if self.link.is_running() {
                    send_ready(&mut self.channel).await?;
                    Ok(None)
                } else {
                    self.send_disconnect().await?;
                    Ok(Some(DisconnectReason::ClientHalted))
                }
            }
            Some(Command::ServerShutdown) => {
                tracing::info!(peer = %self.peer, "Server shutdown");
                Ok(Some(DisconnectReason::BrokenChannel))
            }
            _ => {
                tracing::info!(opcode, "Unknown command");
                Ok(None)
            }
        }
    }

    async fn receive_delta(&mut self) -> Result<(), ReplicationError> {
        let mut stats = StatsReader::new(&mut self.channel);
        let index = codec::read_index(&mut stats).await?;
        let delta = codec::read_delta_body(&mut stats).await?;

        let subscription = self
            .registry
            .get_mut(index)
            .ok_or_else(|| {
                ReplicationError::Protocol(format!("delta for unknown journal {index}"))
            })?;
        let applier = subscription.applier.as_ref().ok_or_else(|| {
            ReplicationError::Protocol(format!("delta for unbound journal {index}"))
        })?;
        applier.apply(delta, &self.link.metrics)?;
        subscription.state_sent = false;

        self.link.metrics.bytes_received(stats.bytes());
        stats.log_stats(&self.peer, index);
        Ok(())
    }

    async fn send_disconnect(&mut self) -> Result<(), ReplicationError> {
        codec::write_command(&mut self.channel, Command::ClientDisconnect).await?;
        Ok(())
    }

    fn classify(&self, err: &ReplicationError) -> DisconnectReason {
        if !self.link.is_running() {
            tracing::debug!(error = %err, "Channel closed after halt");
            return DisconnectReason::ClientHalted;
        }

        let reason = err.disconnect_reason();
        match reason {
            DisconnectReason::BrokenChannel => {
                tracing::error!(peer = %self.peer, "Network error. Server died?");
                tracing::debug!(error = %err, "Network error details");
            }
            DisconnectReason::IncompatibleJournal => {
                tracing::error!(error = %err, "Incompatible journal");
            }
            _ => {
                tracing::error!(error = %err, "Unhandled exception in client");
            }
        }
        reason
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.link.sessions.fetch_sub(1, Ordering::SeqCst);
        self.link.metrics.connection_closed();
    }
}

/// Resolve once the client asks to halt, or is dropped.
pub(crate) async fn halted(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let halt = *shutdown.borrow_and_update();
        if halt {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerNode, SslConfig};
    use crate::credentials::StaticTokenProvider;
    use crate::transport::BoxFuture;
    use journal_repl_core::{
        ColumnMetadata, ColumnType, JournalKey, JournalStructure, MemoryWriterFactory, PartitionBy,
    };
    use std::sync::Mutex;
    use tokio_test::io::{Builder, Mock};

    /// Connector handing out one scripted mock channel.
    struct ScriptConnector(Mutex<Option<Mock>>);

    impl Connector for ScriptConnector {
        fn connect<'a>(
            &'a self,
            _node: &'a ServerNode,
            _ssl: &'a SslConfig,
        ) -> BoxFuture<'a, Result<BoxedChannel, ReplicationError>> {
            Box::pin(async move {
                let mock = self.0.lock().unwrap().take();
                match mock {
                    Some(mock) => {
                        let channel: BoxedChannel = Box::new(mock);
                        Ok(channel)
                    }
                    None => Err(ReplicationError::Network("refused".into())),
                }
            })
        }
    }

    fn link(mock: Mock, credentials: Option<Arc<dyn CredentialProvider>>) -> Link {
        Link {
            config: ClientConfig::default(),
            connector: Arc::new(ScriptConnector(Mutex::new(Some(mock)))),
            factory: Arc::new(MemoryWriterFactory::new()),
            credentials,
            metrics: Arc::new(ClientMetrics::new()),
            running: Arc::new(AtomicBool::new(true)),
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn structure() -> JournalStructure {
        JournalStructure::new("trades").column(ColumnMetadata::new("px", ColumnType::Double))
    }

    fn cmd(command: Command) -> [u8; 1] {
        [command.opcode()]
    }

    fn text(value: &str) -> Vec<u8> {
        let mut bytes = (value.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(value.as_bytes());
        bytes
    }

    fn int(value: i32) -> [u8; 4] {
        value.to_le_bytes()
    }

    fn key_record(index: u32, class: &str) -> Vec<u8> {
        let mut bytes = index.to_le_bytes().to_vec();
        bytes.extend_from_slice(&text(class));
        bytes.extend_from_slice(&text(""));
        bytes.push(PartitionBy::Default.to_byte());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes
    }

    fn state_record(index: u32) -> Vec<u8> {
        let mut bytes = index.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 24]);
        bytes
    }

    fn metadata() -> Vec<u8> {
        let body = structure().to_cbor().unwrap();
        let mut bytes = (body.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&body);
        bytes
    }

    fn registry() -> SubscriptionRegistry {
        let mut registry = SubscriptionRegistry::default();
        registry
            .subscribe(JournalKey::new("trades"), JournalKey::new("trades"), None)
            .unwrap();
        registry
    }

    fn bring_up(builder: &mut Builder) -> &mut Builder {
        builder
            .write(&cmd(Command::ProtocolVersion))
            .write(&int(PROTOCOL_VERSION))
            .read(&text(ACK_OK))
            .write(&cmd(Command::SetKey))
            .write(&key_record(0, "trades"))
            .read(&text(ACK_OK))
            .read(&metadata())
            .write(&cmd(Command::HandshakeComplete))
    }

    #[tokio::test]
    async fn handshake_without_authorization() {
        let mut builder = Builder::new();
        bring_up(&mut builder)
            .read(&text(ACK_OK))
            .write(&cmd(Command::DeltaRequest))
            .write(&state_record(0))
            .read(&text(ACK_OK))
            .write(&cmd(Command::ClientReady));
        let link = link(builder.build(), None);
        let mut registry = registry();

        let channel = handshake(&link, &mut registry).await.unwrap();
        drop(channel);

        assert!(registry.get(0).unwrap().state_sent);
    }

    #[tokio::test]
    async fn handshake_with_authorization() {
        let mut builder = Builder::new();
        bring_up(&mut builder)
            .read(&text(AUTH_REQUIRED))
            .write(&cmd(Command::Authorization))
            .write(&[5, 0, 0, 0])
            .write(b"token")
            .read(&text(ACK_OK))
            .write(&cmd(Command::DeltaRequest))
            .write(&state_record(0))
            .read(&text(ACK_OK))
            .write(&cmd(Command::ClientReady));
        let provider: Arc<dyn CredentialProvider> = Arc::new(StaticTokenProvider::new("token"));
        let link = link(builder.build(), Some(provider));

        let channel = handshake(&link, &mut registry()).await.unwrap();
        drop(channel);
    }

    #[tokio::test]
    async fn rejected_credential_is_auth_failure() {
        let mut builder = Builder::new();
        bring_up(&mut builder)
            .read(&text(AUTH_REQUIRED))
            .write(&cmd(Command::Authorization))
            .write(&[5, 0, 0, 0])
            .write(b"token")
            .read(&text("bad credentials"));
        let provider: Arc<dyn CredentialProvider> = Arc::new(StaticTokenProvider::new("token"));
        let link = link(builder.build(), Some(provider));

        let err = handshake(&link, &mut registry())
            .await
            .err()
            .expect("handshake should fail");

        assert!(err.is_auth());
        assert!(err.to_string().contains("bad credentials"));
    }

    #[tokio::test]
    async fn refused_version_carries_server_text() {
        let mock = Builder::new()
            .write(&cmd(Command::ProtocolVersion))
            .write(&int(PROTOCOL_VERSION))
            .read(&text("Unsupported protocol version"))
            .build();
        let link = link(mock, None);

        let err = handshake(&link, &mut registry())
            .await
            .err()
            .expect("handshake should fail");

        match err {
            ReplicationError::Network(message) => {
                assert_eq!(message, "Unsupported protocol version");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unexpected_handshake_response_is_protocol_error() {
        let mut builder = Builder::new();
        bring_up(&mut builder).read(&text("MAYBE"));
        let link = link(builder.build(), None);

        let err = handshake(&link, &mut registry())
            .await
            .err()
            .expect("handshake should fail");
        assert!(matches!(err, ReplicationError::Protocol(_)));
    }

    /// Serve `script` on a link whose client has stopped running.
    async fn serve_halted(script: Mock) -> DisconnectReason {
        let link = link(Builder::new().build(), None);
        link.running.store(false, Ordering::SeqCst);
        let session = Session::new(Arc::new(link), Box::new(script), registry());

        let (_halt, signal) = watch::channel(false);
        let (registry, reason) = session.run(signal).await;
        assert_eq!(registry.len(), 1);
        reason
    }

    #[tokio::test]
    async fn heartbeat_after_halt_answered_with_disconnect() {
        let script = Builder::new()
            .read(&cmd(Command::ServerHeartbeat))
            .write(&cmd(Command::ClientDisconnect))
            .build();

        assert_eq!(serve_halted(script).await, DisconnectReason::ClientHalted);
    }

    #[tokio::test]
    async fn server_ready_after_halt_answered_with_disconnect() {
        let script = Builder::new()
            .read(&cmd(Command::ServerReady))
            .write(&cmd(Command::ClientDisconnect))
            .build();

        assert_eq!(serve_halted(script).await, DisconnectReason::ClientHalted);
    }

    #[tokio::test]
    async fn heartbeat_while_running_answered_with_ready() {
        let script = Builder::new()
            .read(&cmd(Command::ServerHeartbeat))
            .write(&cmd(Command::ClientReady))
            .read(&cmd(Command::ServerShutdown))
            .build();
        let link = Arc::new(link(Builder::new().build(), None));
        let session = Session::new(link, Box::new(script), registry());

        let (_halt, signal) = watch::channel(false);
        let (_, reason) = session.run(signal).await;

        assert_eq!(reason, DisconnectReason::BrokenChannel);
    }

    #[tokio::test]
    async fn halted_resolves_on_signal_and_on_drop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        halted(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        halted(&mut rx).await;
    }
}
