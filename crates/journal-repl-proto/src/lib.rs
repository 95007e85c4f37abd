//! # Journal Replication Protocol
//!
//! Command framing and wire records exchanged between a journal origin and a
//! subscribing client.
//!
//! ## Framing
//!
//! Every message is one opcode byte followed by an opcode-specific payload:
//! nothing, a length-prefixed UTF-8 text, a 32-bit integer, a length-prefixed
//! blob, or a structured record. Integers are little-endian.
//!
//! ## Handshake (client view)
//!
//! 1. `PROTOCOL_VERSION` + int, ack
//! 2. per journal: `SET_KEY` + indexed key, ack, metadata blob
//! 3. `HANDSHAKE_COMPLETE`, then `"OK"` or `"AUTH"` (+ `AUTHORIZATION` exchange)
//! 4. per journal not yet announced: `DELTA_REQUEST` + indexed state, ack
//! 5. `CLIENT_READY`
//!
//! Acknowledgements are texts; `"OK"` is success, anything else is an error
//! message from the origin.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod command;
pub mod messages;

pub use codec::{CodecError, ScratchBuffer};
pub use command::{Command, ACK_OK, AUTH_REQUIRED, PROTOCOL_VERSION};
pub use messages::{IndexedJournalKey, IndexedJournalState, JournalDelta, MessageError};
