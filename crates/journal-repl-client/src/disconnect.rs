//! Disconnect reasons and observers.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Loop ended without a more specific cause
    Unknown,
    /// Client was halted locally
    ClientHalted,
    /// Unexpected failure inside the client
    ClientException,
    /// Channel failed or the origin went away
    BrokenChannel,
    /// Client task panicked
    ClientError,
    /// Remote journal cannot be replicated locally
    IncompatibleJournal,
}

/// What happens after a connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Run a bounded reconnect sequence
    Reconnect,
    /// Deliver the reason to observers and stop
    Terminal,
}

impl DisconnectReason {
    /// Numeric code, stable across releases.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 1,
            Self::ClientHalted => 2,
            Self::ClientException => 3,
            Self::BrokenChannel => 4,
            Self::ClientError => 5,
            Self::IncompatibleJournal => 6,
        }
    }

    /// Transition taken when a live connection ends for this reason.
    #[must_use]
    pub fn transition(self) -> Transition {
        match self {
            Self::Unknown | Self::BrokenChannel => Transition::Reconnect,
            Self::ClientHalted
            | Self::ClientException
            | Self::ClientError
            | Self::IncompatibleJournal => Transition::Terminal,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::ClientHalted => "client-halted",
            Self::ClientException => "client-exception",
            Self::BrokenChannel => "broken-channel",
            Self::ClientError => "client-error",
            Self::IncompatibleJournal => "incompatible-journal",
        };
        f.write_str(name)
    }
}

/// Observer of terminal disconnects.
pub trait DisconnectCallback: Send + Sync {
    /// Called once with the reason the client stopped.
    fn on_disconnect(&self, reason: DisconnectReason);
}

impl<F> DisconnectCallback for F
where
    F: Fn(DisconnectReason) + Send + Sync,
{
    fn on_disconnect(&self, reason: DisconnectReason) {
        self(reason);
    }
}

/// Ordered chain of disconnect observers.
#[derive(Clone, Default)]
pub struct DisconnectCallbacks {
    chain: Vec<Arc<dyn DisconnectCallback>>,
}

impl DisconnectCallbacks {
    /// Append an observer to the end of the chain.
    pub fn push(&mut self, callback: Arc<dyn DisconnectCallback>) {
        self.chain.push(callback);
    }

    /// Number of observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Invoke every observer in registration order.
    pub fn notify(&self, reason: DisconnectReason) {
        for callback in &self.chain {
            callback.on_disconnect(reason);
        }
    }
}

impl fmt::Debug for DisconnectCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectCallbacks")
            .field("len", &self.chain.len())
            .finish()
    }
}
