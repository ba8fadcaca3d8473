//! Transport abstraction for the Tessera coordinator
//!
//! The coordinator never talks to a concrete network. It opens and accepts
//! streams keyed by protocol identifier through [`Transport`], and wraps every
//! stream in a [`StreamHandle`] that applies the configured deadlines, keeps
//! memory reservations balanced and guarantees the stream is closed once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::errors::{Result, TesseraError, TransportError};
use crate::protocol::wire;
use crate::types::{PeerId, ProtocolId};

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Memory accounting attached to a stream
pub trait MemoryScope: Send + Sync {
    /// Reserve `bytes` against the stream's budget
    fn reserve(&self, bytes: usize) -> Result<()>;

    /// Return `bytes` previously reserved
    fn release(&self, bytes: usize);
}

/// A bidirectional byte stream to one remote peer
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Peer on the other end of the stream
    fn remote_peer(&self) -> PeerId;

    /// Protocol the stream was opened for
    fn protocol(&self) -> ProtocolId;

    /// Memory accounting scope of the stream
    fn scope(&self) -> Arc<dyn MemoryScope>;

    /// Close the stream
    async fn close(&mut self) -> Result<()> {
        self.shutdown().await.map_err(TransportError::from)?;
        Ok(())
    }
}

/// Stream-oriented peer-to-peer transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of this node
    fn local_peer(&self) -> PeerId;

    /// Open a new stream to `peer` for `protocol`
    async fn open_stream(&self, peer: PeerId, protocol: ProtocolId) -> Result<Box<dyn TransportStream>>;

    /// Start accepting inbound streams for `protocol`
    async fn listen(&self, protocol: ProtocolId) -> Result<mpsc::Receiver<Box<dyn TransportStream>>>;

    /// Stop accepting inbound streams for `protocol`
    async fn unlisten(&self, protocol: ProtocolId);
}

// ----------------------------------------------------------------------------
// Deadlines
// ----------------------------------------------------------------------------

/// Which deadline a framed read applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDeadline {
    /// Regular read deadline
    Standard,
    /// Long wait for a leader's decision
    LeaderResponse,
}

#[derive(Debug, Clone, Copy)]
struct Deadlines {
    read: Option<Duration>,
    write: Option<Duration>,
    leader_response: Option<Duration>,
}

impl Deadlines {
    fn from_config(config: &StreamConfig) -> Self {
        if !config.apply_deadline {
            return Self {
                read: None,
                write: None,
                leader_response: None,
            };
        }
        Self {
            read: Some(config.read_timeout()),
            write: Some(config.write_timeout()),
            leader_response: Some(config.leader_response_timeout()),
        }
    }

    fn read(&self, deadline: FrameDeadline) -> Option<Duration> {
        match deadline {
            FrameDeadline::Standard => self.read,
            FrameDeadline::LeaderResponse => self.leader_response,
        }
    }
}

async fn with_deadline<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(duration) => tokio::time::timeout(duration, fut).await.map_err(|_| {
            TesseraError::from(TransportError::Timeout {
                duration_ms: duration.as_millis() as u64,
            })
        })?,
        None => fut.await,
    }
}

/// Resolve once `signal` reads `true`
async fn signalled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|value| *value).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ----------------------------------------------------------------------------
// Stream Handle
// ----------------------------------------------------------------------------

struct StreamInner {
    remote_peer: PeerId,
    protocol: ProtocolId,
    stream: Mutex<Box<dyn TransportStream>>,
    scope: Arc<dyn MemoryScope>,
    reserved: AtomicUsize,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    deadlines: Deadlines,
}

/// Shared handle to a transport stream
///
/// Clones refer to the same stream. `close` is idempotent and unblocks reads
/// and writes pending on other clones.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("remote_peer", &self.inner.remote_peer)
            .field("protocol", &self.inner.protocol)
            .field("reserved", &self.reserved())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamHandle {
    pub fn new(stream: Box<dyn TransportStream>, config: &StreamConfig) -> Self {
        let (close_signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(StreamInner {
                remote_peer: stream.remote_peer(),
                protocol: stream.protocol(),
                scope: stream.scope(),
                stream: Mutex::new(stream),
                reserved: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                close_signal,
                deadlines: Deadlines::from_config(config),
            }),
        }
    }

    /// Open an outbound stream, bounded by the open deadline
    pub async fn open(
        transport: &dyn Transport,
        peer: PeerId,
        protocol: ProtocolId,
        config: &StreamConfig,
    ) -> Result<Self> {
        let limit = config.apply_deadline.then(|| config.open_timeout());
        let stream = with_deadline(limit, transport.open_stream(peer, protocol)).await?;
        Ok(Self::new(stream, config))
    }

    pub fn remote_peer(&self) -> PeerId {
        self.inner.remote_peer
    }

    pub fn protocol(&self) -> ProtocolId {
        self.inner.protocol
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Bytes currently reserved through this handle
    pub fn reserved(&self) -> usize {
        self.inner.reserved.load(Ordering::SeqCst)
    }

    /// Whether two handles refer to the same stream
    pub fn same_stream(&self, other: &StreamHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn closed_error(&self) -> TesseraError {
        TransportError::Closed {
            peer_id: self.inner.remote_peer.to_string(),
        }
        .into()
    }

    /// Read one frame
    pub async fn read_frame(&self, deadline: FrameDeadline) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut closed = self.inner.close_signal.subscribe();
        let limit = self.inner.deadlines.read(deadline);
        let read = async {
            let mut stream = self.inner.stream.lock().await;
            wire::read_frame(&mut **stream).await
        };

        tokio::select! {
            result = with_deadline(limit, read) => result,
            _ = signalled(&mut closed) => Err(self.closed_error()),
        }
    }

    /// Write one frame
    pub async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut closed = self.inner.close_signal.subscribe();
        let limit = self.inner.deadlines.write;
        let write = async {
            let mut stream = self.inner.stream.lock().await;
            wire::write_frame(&mut **stream, payload).await
        };

        tokio::select! {
            result = with_deadline(limit, write) => result,
            _ = signalled(&mut closed) => Err(self.closed_error()),
        }
    }

    /// Reserve memory against the stream's scope until released or closed
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.inner.scope.reserve(bytes)?;
        self.inner.reserved.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    /// Reserve memory for the lifetime of the returned guard
    pub fn reserve_scoped(&self, bytes: usize) -> Result<ReservationGuard> {
        self.reserve(bytes)?;
        Ok(ReservationGuard {
            handle: self.clone(),
            bytes,
        })
    }

    /// Return up to `bytes` of the outstanding reservation
    pub fn release(&self, bytes: usize) {
        let released = self
            .inner
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            })
            .map(|previous| previous.min(bytes))
            .unwrap_or(0);
        if released > 0 {
            self.inner.scope.release(released);
        }
    }

    /// Return every outstanding reservation
    pub fn release_all(&self) {
        let outstanding = self.inner.reserved.swap(0, Ordering::SeqCst);
        if outstanding > 0 {
            self.inner.scope.release(outstanding);
        }
    }

    /// Release outstanding memory and close the stream
    ///
    /// Only the first call reaches the underlying stream.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.close_signal.send_replace(true);
        self.release_all();

        let mut stream = self.inner.stream.lock().await;
        match stream.close().await {
            Ok(()) => {
                debug!(peer = %self.inner.remote_peer, protocol = %self.inner.protocol, "Stream closed");
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.inner.remote_peer, error = %e, "Failed to close stream");
                Err(e)
            }
        }
    }
}

/// Memory reservation returned when dropped
#[must_use = "the reservation is released when the guard is dropped"]
pub struct ReservationGuard {
    handle: StreamHandle,
    bytes: usize,
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.handle.release(self.bytes);
    }
}
