//! # Journal Replication Client
//!
//! Subscriber side of a journal replication link. A [`JournalClient`] keeps a
//! set of local journals in step with an origin:
//!
//! - `start` connects and runs the handshake on the caller's task: protocol
//!   version, one key exchange and metadata transfer per journal, optional
//!   authorization, then a delta request per journal.
//! - A background task applies incoming deltas, answers heartbeats and
//!   re-announces local state whenever the origin finishes a round.
//! - Channel failures trigger a bounded reconnect; anything else, or an
//!   exhausted budget, ends in one call of each disconnect callback.
//!
//! Rows are appended to local writers but never committed by the client.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod credentials;
pub mod delta;
pub mod disconnect;
pub mod error;
pub mod metrics;
pub mod transport;

mod reconnect;
mod registry;
mod session;

pub use client::JournalClient;
pub use config::{ClientConfig, ReconnectPolicy, ServerNode, SslConfig, DEFAULT_PORT};
pub use credentials::{
    decode_token, encode_token, CredentialError, CredentialProvider, StaticTokenProvider,
};
pub use delta::DeltaApplier;
pub use disconnect::{DisconnectCallback, DisconnectCallbacks, DisconnectReason, Transition};
pub use error::ReplicationError;
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use transport::{
    BoxFuture, BoxedChannel, Channel, Connector, MemoryConnector, SecureChannel, TcpConnector,
};
