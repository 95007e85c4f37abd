//! Scripted origin for driving a real client over memory channels.

#![allow(dead_code)]

use journal_repl_client::{
    ClientConfig, DisconnectReason, JournalClient, MemoryConnector, ReconnectPolicy,
};
use journal_repl_core::{ColumnMetadata, ColumnType, JournalStructure, MemoryWriterFactory};
use journal_repl_proto::codec;
use journal_repl_proto::{
    Command, IndexedJournalKey, IndexedJournalState, JournalDelta, ACK_OK, AUTH_REQUIRED,
    PROTOCOL_VERSION,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fail the test instead of hanging.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out")
}

pub fn trades() -> JournalStructure {
    JournalStructure::new("trades")
        .column(ColumnMetadata::new("sym", ColumnType::Symbol))
        .column(ColumnMetadata::new("px", ColumnType::Double))
}

/// Client wired to an in-memory connector and store, retrying quickly.
pub fn client(retry_count: u32, login_retry_count: u32) -> Harness {
    let connector = Arc::new(MemoryConnector::new());
    let factory = Arc::new(MemoryWriterFactory::new());
    let config = ClientConfig {
        reconnect: ReconnectPolicy {
            retry_count,
            login_retry_count,
            sleep_between_retries: Duration::from_millis(10),
        },
        ..ClientConfig::default()
    };
    let client = JournalClient::new(config, factory.clone()).with_connector(connector.clone());
    Harness {
        client,
        connector,
        factory,
    }
}

/// Record terminal disconnects of `client`.
pub fn observe(client: &mut JournalClient) -> mpsc::UnboundedReceiver<DisconnectReason> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_disconnect(move |reason: DisconnectReason| {
        let _ = tx.send(reason);
    });
    rx
}

pub struct Harness {
    pub client: JournalClient,
    pub connector: Arc<MemoryConnector>,
    pub factory: Arc<MemoryWriterFactory>,
}

impl Harness {
    /// Queue a connection and return a server for it.
    pub fn server(&self) -> MockServer {
        MockServer {
            stream: self.connector.push(),
        }
    }
}

/// What the client sent during a handshake.
#[derive(Debug, Default)]
pub struct Transcript {
    pub keys: Vec<IndexedJournalKey>,
    pub states: Vec<IndexedJournalState>,
    pub token: Option<Vec<u8>>,
}

pub struct MockServer {
    pub stream: DuplexStream,
}

impl MockServer {
    pub async fn expect(&mut self, command: Command) {
        let got = codec::read_command(&mut self.stream).await.unwrap();
        assert_eq!(got, command);
    }

    pub async fn reply(&mut self, text: &str) {
        codec::write_text(&mut self.stream, text).await.unwrap();
    }

    pub async fn send(&mut self, command: Command) {
        codec::write_command(&mut self.stream, command).await.unwrap();
    }

    pub async fn send_delta(&mut self, index: u32, delta: &JournalDelta) {
        self.send(Command::JournalDelta).await;
        codec::write_delta(&mut self.stream, index, delta).await.unwrap();
    }

    /// Accept version and keys, serving `structure` for every journal.
    pub async fn accept_keys(
        &mut self,
        journals: usize,
        structure: &JournalStructure,
    ) -> Vec<IndexedJournalKey> {
        self.expect(Command::ProtocolVersion).await;
        assert_eq!(codec::read_int(&mut self.stream).await.unwrap(), PROTOCOL_VERSION);
        self.reply(ACK_OK).await;

        let mut keys = Vec::new();
        for _ in 0..journals {
            self.expect(Command::SetKey).await;
            keys.push(codec::read_key(&mut self.stream).await.unwrap());
            self.reply(ACK_OK).await;
            codec::write_metadata(&mut self.stream, structure).await.unwrap();
        }
        self.expect(Command::HandshakeComplete).await;
        keys
    }

    /// Acknowledge delta requests until the client reports ready.
    pub async fn accept_state(&mut self) -> Vec<IndexedJournalState> {
        let mut states = Vec::new();
        loop {
            match codec::read_command(&mut self.stream).await.unwrap() {
                Command::DeltaRequest => {
                    states.push(codec::read_state(&mut self.stream).await.unwrap());
                    self.reply(ACK_OK).await;
                }
                Command::ClientReady => return states,
                other => panic!("unexpected {other}"),
            }
        }
    }

    /// Full handshake without authorization.
    pub async fn accept(&mut self, journals: usize, structure: &JournalStructure) -> Transcript {
        let keys = self.accept_keys(journals, structure).await;
        self.reply(ACK_OK).await;
        let states = self.accept_state().await;
        Transcript {
            keys,
            states,
            token: None,
        }
    }

    /// Full handshake demanding authorization; the token is accepted.
    pub async fn accept_with_auth(
        &mut self,
        journals: usize,
        structure: &JournalStructure,
    ) -> Transcript {
        let keys = self.accept_keys(journals, structure).await;
        let token = self.challenge().await;
        self.reply(ACK_OK).await;
        let states = self.accept_state().await;
        Transcript {
            keys,
            states,
            token: Some(token),
        }
    }

    /// Handshake up to authorization, then reject the token.
    pub async fn deny(&mut self, journals: usize, structure: &JournalStructure) {
        self.accept_keys(journals, structure).await;
        self.challenge().await;
        self.reply("invalid token").await;
    }

    async fn challenge(&mut self) -> Vec<u8> {
        self.reply(AUTH_REQUIRED).await;
        self.expect(Command::Authorization).await;
        codec::read_blob(&mut self.stream, 1024).await.unwrap()
    }

    /// Whether the client closed its end.
    pub async fn closed(&mut self) -> bool {
        codec::read_opcode(&mut self.stream).await.is_err()
    }
}
