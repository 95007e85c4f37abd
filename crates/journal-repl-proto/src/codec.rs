//! Async framing for commands and payloads.
//!
//! Payload functions never write the opcode; callers send the command first
//! and the payload right after, so the same functions serve both ends of a
//! connection.

use crate::command::Command;
use crate::messages::{IndexedJournalKey, IndexedJournalState, JournalDelta, MessageError};
use journal_repl_core::{JournalKey, JournalState, JournalStructure, PartitionBy};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest acknowledgement or key text accepted.
pub const MAX_TEXT_BYTES: usize = 64 * 1024;

/// Largest delta body accepted.
pub const MAX_DELTA_BYTES: usize = 256 * 1024 * 1024;

/// Largest credential token accepted.
pub const MAX_TOKEN_BYTES: usize = 64 * 1024;

/// Send a bare command.
///
/// # Errors
///
/// Returns error if the channel write fails.
pub async fn write_command<W>(writer: &mut W, command: Command) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&[command.opcode()]).await?;
    Ok(())
}

/// Read the next opcode without interpreting it.
///
/// # Errors
///
/// Returns error if the channel read fails.
pub async fn read_opcode<R>(reader: &mut R) -> Result<u8, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(reader.read_u8().await?)
}

/// Read the next command, rejecting unknown opcodes.
///
/// # Errors
///
/// Returns error if the read fails or the opcode is unknown.
pub async fn read_command<R>(reader: &mut R) -> Result<Command, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let opcode = read_opcode(reader).await?;
    Command::from_opcode(opcode).ok_or(CodecError::UnknownCommand(opcode))
}

/// Read the next command and require it to be `expected`.
///
/// # Errors
///
/// Returns error if the read fails or a different command arrives.
pub async fn expect_command<R>(reader: &mut R, expected: Command) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let got = read_command(reader).await?;
    if got == expected {
        Ok(())
    } else {
        Err(CodecError::UnexpectedCommand { expected, got })
    }
}

/// Write a 32-bit integer payload.
///
/// # Errors
///
/// Returns error if the channel write fails.
pub async fn write_int<W>(writer: &mut W, value: i32) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&value.to_le_bytes()).await?;
    Ok(())
}

/// Read a 32-bit integer payload.
///
/// # Errors
///
/// Returns error if the channel read fails.
pub async fn read_int<R>(reader: &mut R) -> Result<i32, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(reader.read_i32_le().await?)
}

/// Write a subscription index.
///
/// # Errors
///
/// Returns error if the channel write fails.
pub async fn write_index<W>(writer: &mut W, index: u32) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&index.to_le_bytes()).await?;
    Ok(())
}

/// Read a subscription index.
///
/// # Errors
///
/// Returns error if the channel read fails.
pub async fn read_index<R>(reader: &mut R) -> Result<u32, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(reader.read_u32_le().await?)
}

/// Write a length-prefixed UTF-8 text payload.
///
/// # Errors
///
/// Returns error if the text is too long or the channel write fails.
pub async fn write_text<W>(writer: &mut W, text: &str) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(4 + text.len());
    encode_text(&mut buf, text)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read a length-prefixed UTF-8 text payload.
///
/// # Errors
///
/// Returns error if the read fails, the text is too long or not UTF-8.
pub async fn read_text<R>(reader: &mut R) -> Result<String, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_len(reader, "text", MAX_TEXT_BYTES).await?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
}

/// Write a length-prefixed blob payload.
///
/// # Errors
///
/// Returns error if the blob exceeds `u32` or the channel write fails.
pub async fn write_blob<W>(writer: &mut W, blob: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(blob.len()).map_err(|_| CodecError::TooLarge {
        what: "blob",
        limit: u32::MAX as usize,
        got: blob.len(),
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(blob).await?;
    Ok(())
}

/// Read a length-prefixed blob payload of at most `limit` bytes.
///
/// # Errors
///
/// Returns error if the read fails or the declared length exceeds `limit`.
pub async fn read_blob<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_len(reader, "blob", limit).await?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Write an indexed journal key record.
///
/// # Errors
///
/// Returns error if a text field is too long or the channel write fails.
pub async fn write_key<W>(writer: &mut W, key: &IndexedJournalKey) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::new();
    buf.extend_from_slice(&key.index.to_le_bytes());
    encode_text(&mut buf, &key.key.class)?;
    encode_text(&mut buf, key.key.location.as_deref().unwrap_or(""))?;
    buf.push(key.key.partition_by.to_byte());
    buf.extend_from_slice(&key.key.record_hint.to_le_bytes());
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read an indexed journal key record.
///
/// # Errors
///
/// Returns error if the read fails or a field is malformed.
pub async fn read_key<R>(reader: &mut R) -> Result<IndexedJournalKey, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let index = read_index(reader).await?;
    let class = read_text(reader).await?;
    let location = read_text(reader).await?;
    let tag = reader.read_u8().await?;
    let partition_by = PartitionBy::from_byte(tag).ok_or(CodecError::InvalidPartition(tag))?;
    let record_hint = reader.read_i32_le().await?;

    Ok(IndexedJournalKey {
        index,
        key: JournalKey {
            class,
            location: (!location.is_empty()).then_some(location),
            partition_by,
            record_hint,
        },
    })
}

/// Write an indexed journal state record.
///
/// # Errors
///
/// Returns error if the channel write fails.
pub async fn write_state<W>(writer: &mut W, state: &IndexedJournalState) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(28);
    buf.extend_from_slice(&state.index.to_le_bytes());
    buf.extend_from_slice(&state.state.tx.to_le_bytes());
    buf.extend_from_slice(&state.state.tx_pin.to_le_bytes());
    buf.extend_from_slice(&state.state.rows.to_le_bytes());
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read an indexed journal state record.
///
/// # Errors
///
/// Returns error if the channel read fails.
pub async fn read_state<R>(reader: &mut R) -> Result<IndexedJournalState, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let index = read_index(reader).await?;
    let tx = reader.read_u64_le().await?;
    let tx_pin = reader.read_u64_le().await?;
    let rows = reader.read_u64_le().await?;

    Ok(IndexedJournalState {
        index,
        state: JournalState { tx, tx_pin, rows },
    })
}

/// Write a journal metadata blob.
///
/// # Errors
///
/// Returns error if the structure cannot be encoded or the write fails.
pub async fn write_metadata<W>(writer: &mut W, structure: &JournalStructure) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = structure
        .to_cbor()
        .map_err(|e| CodecError::Metadata(e.to_string()))?;
    write_blob(writer, &bytes).await
}

/// Write the payload of a `JOURNAL_DELTA` command.
///
/// # Errors
///
/// Returns error if the delta cannot be encoded or the write fails.
pub async fn write_delta<W>(writer: &mut W, index: u32, delta: &JournalDelta) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = delta.to_cbor()?;
    write_index(writer, index).await?;
    write_blob(writer, &bytes).await
}

/// Read the body of a `JOURNAL_DELTA` command, after its index.
///
/// # Errors
///
/// Returns error if the read fails or the body does not decode.
pub async fn read_delta_body<R>(reader: &mut R) -> Result<JournalDelta, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let bytes = read_blob(reader, MAX_DELTA_BYTES).await?;
    Ok(JournalDelta::from_cbor(&bytes)?)
}

/// Reusable receive area for journal metadata.
///
/// Metadata may be larger than a single read; the buffer grows to the
/// declared length up to a fixed limit and is reused across journals.
#[derive(Debug)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl ScratchBuffer {
    /// Create an empty buffer that refuses blobs longer than `limit`.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Receive one length-prefixed blob into the buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the read fails or the declared length exceeds the limit.
    pub async fn read_blob<R>(&mut self, reader: &mut R) -> Result<&[u8], CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let len = read_len(reader, "metadata", self.limit).await?;
        self.buf.clear();
        self.buf.resize(len, 0);
        reader.read_exact(&mut self.buf).await?;
        Ok(&self.buf)
    }

    /// Receive and decode one metadata blob.
    ///
    /// # Errors
    ///
    /// Returns error if the read fails or the blob is not a structure.
    pub async fn read_metadata<R>(&mut self, reader: &mut R) -> Result<JournalStructure, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let bytes = self.read_blob(reader).await?;
        JournalStructure::from_cbor(bytes).map_err(|e| CodecError::Metadata(e.to_string()))
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Return reserved memory.
    pub fn free(&mut self) {
        self.buf = Vec::new();
    }
}

fn encode_text(buf: &mut Vec<u8>, text: &str) -> Result<(), CodecError> {
    if text.len() > MAX_TEXT_BYTES {
        return Err(CodecError::TooLarge {
            what: "text",
            limit: MAX_TEXT_BYTES,
            got: text.len(),
        });
    }
    // bounded by MAX_TEXT_BYTES above
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
    buf.extend_from_slice(text.as_bytes());
    Ok(())
}

async fn read_len<R>(reader: &mut R, what: &'static str, limit: usize) -> Result<usize, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32_le().await? as usize;
    if len > limit {
        return Err(CodecError::TooLarge {
            what,
            limit,
            got: len,
        });
    }
    Ok(len)
}

/// Errors raised while framing or parsing commands.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Channel I/O failed
    #[error("channel error: {0}")]
    Io(#[from] std::io::Error),
    /// Opcode not part of the protocol
    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),
    /// A known command arrived out of sequence
    #[error("expected {expected}, got {got}")]
    UnexpectedCommand {
        /// Command the protocol required
        expected: Command,
        /// Command actually received
        got: Command,
    },
    /// Declared length over the accepted bound
    #[error("{what} too large: max {limit} got {got}")]
    TooLarge {
        /// Payload kind
        what: &'static str,
        /// Accepted bound
        limit: usize,
        /// Declared length
        got: usize,
    },
    /// Text payload is not UTF-8
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
    /// Unknown partitioning tag in a key record
    #[error("invalid partition tag: {0}")]
    InvalidPartition(u8),
    /// Journal metadata could not be encoded or decoded
    #[error("journal metadata error: {0}")]
    Metadata(String),
    /// Delta body could not be encoded or decoded
    #[error(transparent)]
    Message(#[from] MessageError),
}
