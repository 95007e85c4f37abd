//! Replication failures and their classification.

use crate::disconnect::DisconnectReason;
use journal_repl_core::StoreError;
use journal_repl_proto::CodecError;

/// Errors raised while bringing up or serving a replication connection.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Client is misconfigured for what the origin demands
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Origin rejected the credential, or none could be produced
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    /// Channel could not be opened or the origin refused a command
    #[error("network error: {0}")]
    Network(String),
    /// Origin sent something the protocol does not allow
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Framing failed on the channel
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Remote journal cannot be replicated into the local one
    #[error("incompatible journal: {0}")]
    IncompatibleJournal(String),
    /// Local journal store failed
    #[error("store error: {0}")]
    Store(StoreError),
}

impl ReplicationError {
    /// Whether this failure counts against the login budget.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthFailure(_))
    }

    /// Reason a connection ends with when this error terminates it.
    #[must_use]
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::Network(_) | Self::Protocol(_) | Self::Codec(_) => DisconnectReason::BrokenChannel,
            Self::IncompatibleJournal(_) => DisconnectReason::IncompatibleJournal,
            Self::Configuration(_) | Self::AuthFailure(_) | Self::Store(_) => {
                DisconnectReason::ClientException
            }
        }
    }
}

impl From<StoreError> for ReplicationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Incompatible { .. } => Self::IncompatibleJournal(err.to_string()),
            other => Self::Store(other),
        }
    }
}
