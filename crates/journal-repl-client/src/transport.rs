//! Byte channels to journal origins.

use crate::config::{ServerNode, SslConfig};
use crate::error::ReplicationError;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// Buffer size of in-memory channels.
const MEMORY_CHANNEL_CAPACITY: usize = 64 * 1024;

/// A bidirectional byte stream to an origin.
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned, type-erased channel.
pub type BoxedChannel = Box<dyn Channel>;

/// Boxed future returned by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Wraps a plain channel in a secure one.
pub trait SecureChannel: Send + Sync {
    /// Run the secure handshake over `channel`.
    fn wrap<'a>(
        &'a self,
        channel: BoxedChannel,
        ssl: &'a SslConfig,
    ) -> BoxFuture<'a, io::Result<BoxedChannel>>;
}

/// Opens fresh channels to an origin. Every call yields a new channel.
pub trait Connector: Send + Sync {
    /// Connect to `node`, applying `ssl`.
    fn connect<'a>(
        &'a self,
        node: &'a ServerNode,
        ssl: &'a SslConfig,
    ) -> BoxFuture<'a, Result<BoxedChannel, ReplicationError>>;
}

/// TCP connector with an optional secure channel layer.
#[derive(Clone, Default)]
pub struct TcpConnector {
    secure: Option<Arc<dyn SecureChannel>>,
}

impl TcpConnector {
    /// Plain TCP connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the secure channel used when `SslConfig::secure` is set.
    #[must_use]
    pub fn with_secure_channel(mut self, secure: Arc<dyn SecureChannel>) -> Self {
        self.secure = Some(secure);
        self
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        node: &'a ServerNode,
        ssl: &'a SslConfig,
    ) -> BoxFuture<'a, Result<BoxedChannel, ReplicationError>> {
        Box::pin(async move {
            let secure = match (ssl.secure, &self.secure) {
                (true, None) => {
                    return Err(ReplicationError::Configuration(
                        "secure channel requested but none is installed".to_string(),
                    ));
                }
                (true, Some(secure)) => Some(secure),
                (false, _) => None,
            };

            let stream = TcpStream::connect((node.host.as_str(), node.port))
                .await
                .map_err(|e| ReplicationError::Network(format!("cannot connect to {node}: {e}")))?;
            stream
                .set_nodelay(true)
                .map_err(|e| ReplicationError::Network(e.to_string()))?;

            tracing::debug!(%node, secure = ssl.secure, "Channel open");

            let channel: BoxedChannel = Box::new(stream);
            match secure {
                Some(secure) => secure
                    .wrap(channel, ssl)
                    .await
                    .map_err(|e| {
                        ReplicationError::Network(format!("secure handshake with {node}: {e}"))
                    }),
                None => Ok(channel),
            }
        })
    }
}

/// In-process connector handing out queued memory channels.
///
/// Each [`push`](Self::push) queues one connection and returns the origin's
/// end of it. Connecting with an empty queue is refused. Secure settings are
/// ignored.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    pending: Mutex<VecDeque<DuplexStream>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    /// Create a connector with no queued connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection and return the origin's end.
    #[must_use]
    pub fn push(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(MEMORY_CHANNEL_CAPACITY);
        match self.pending.lock() {
            Ok(mut pending) => pending.push_back(client),
            Err(poisoned) => poisoned.into_inner().push_back(client),
        }
        server
    }

    /// Connection attempts made so far, refused ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        node: &'a ServerNode,
        _ssl: &'a SslConfig,
    ) -> BoxFuture<'a, Result<BoxedChannel, ReplicationError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = match self.pending.lock() {
                Ok(mut pending) => pending.pop_front(),
                Err(poisoned) => poisoned.into_inner().pop_front(),
            };
            match next {
                Some(stream) => {
                    let channel: BoxedChannel = Box::new(stream);
                    Ok(channel)
                }
                None => Err(ReplicationError::Network(format!(
                    "cannot connect to {node}: connection refused"
                ))),
            }
        })
    }
}

/// Read-side wrapper counting bytes for throughput statistics.
pub(crate) struct StatsReader<'a, R: ?Sized> {
    inner: &'a mut R,
    bytes: u64,
    started: Instant,
}

impl<'a, R> StatsReader<'a, R>
where
    R: AsyncRead + Unpin + ?Sized,
{
    pub(crate) fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            bytes: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn log_stats(&self, peer: &str, index: u32) {
        let elapsed = self.started.elapsed();
        #[allow(clippy::cast_precision_loss)]
        let rate = if elapsed.as_secs_f64() > 0.0 {
            self.bytes as f64 / elapsed.as_secs_f64() / 1024.0
        } else {
            0.0
        };
        tracing::debug!(
            peer,
            index,
            bytes = self.bytes,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            kib_per_sec = rate,
            "Delta received"
        );
    }
}

impl<R> AsyncRead for StatsReader<'_, R>
where
    R: AsyncRead + Unpin + ?Sized,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.bytes += (buf.filled().len() - before) as u64;
        }
        poll
    }
}
