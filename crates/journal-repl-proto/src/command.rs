//! Command opcodes.

use std::fmt;

/// Protocol version announced by clients.
pub const PROTOCOL_VERSION: i32 = 1;

/// Positive acknowledgement text.
pub const ACK_OK: &str = "OK";

/// Handshake-complete response demanding credentials.
pub const AUTH_REQUIRED: &str = "AUTH";

/// A protocol command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client announces its protocol version (int payload)
    ProtocolVersion,
    /// Client finished key exchange
    HandshakeComplete,
    /// Client presents a credential token (blob payload)
    Authorization,
    /// Client binds a journal index to a remote key (indexed key payload)
    SetKey,
    /// Client announces local state of a journal (indexed state payload)
    DeltaRequest,
    /// Client is ready to receive deltas
    ClientReady,
    /// Client is going away
    ClientDisconnect,
    /// Origin sends a delta (index + delta blob payload)
    JournalDelta,
    /// Origin finished a round of deltas
    ServerReady,
    /// Origin keep-alive
    ServerHeartbeat,
    /// Origin is shutting down
    ServerShutdown,
}

impl Command {
    /// Every command, in opcode order.
    pub const ALL: [Self; 11] = [
        Self::ProtocolVersion,
        Self::HandshakeComplete,
        Self::Authorization,
        Self::SetKey,
        Self::DeltaRequest,
        Self::ClientReady,
        Self::ClientDisconnect,
        Self::JournalDelta,
        Self::ServerReady,
        Self::ServerHeartbeat,
        Self::ServerShutdown,
    ];

    /// Wire opcode.
    #[must_use]
    pub fn opcode(self) -> u8 {
        match self {
            Self::ProtocolVersion => 0x01,
            Self::HandshakeComplete => 0x02,
            Self::Authorization => 0x03,
            Self::SetKey => 0x04,
            Self::DeltaRequest => 0x05,
            Self::ClientReady => 0x06,
            Self::ClientDisconnect => 0x07,
            Self::JournalDelta => 0x10,
            Self::ServerReady => 0x11,
            Self::ServerHeartbeat => 0x12,
            Self::ServerShutdown => 0x13,
        }
    }

    /// Parse a wire opcode.
    #[must_use]
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.opcode() == opcode)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProtocolVersion => "PROTOCOL_VERSION",
            Self::HandshakeComplete => "HANDSHAKE_COMPLETE",
            Self::Authorization => "AUTHORIZATION",
            Self::SetKey => "SET_KEY",
            Self::DeltaRequest => "DELTA_REQUEST",
            Self::ClientReady => "CLIENT_READY",
            Self::ClientDisconnect => "CLIENT_DISCONNECT",
            Self::JournalDelta => "JOURNAL_DELTA",
            Self::ServerReady => "SERVER_READY",
            Self::ServerHeartbeat => "SERVER_HEARTBEAT",
            Self::ServerShutdown => "SERVER_SHUTDOWN",
        };
        f.write_str(name)
    }
}
