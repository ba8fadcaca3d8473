//! In-memory Transport Network
//!
//! Provides a deterministic stream transport for multi-node tests without a
//! real network. Every node joins a shared [`MemoryNetwork`] and receives a
//! [`MemoryTransport`]; streams are `tokio::io::duplex` pairs. The network can
//! take peers offline, add open latency, refuse protocols nobody listens on and
//! meter stream memory per node.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tessera_core::{
    MemoryScope, PeerId, ProtocolId, TesseraError, TesseraResult, Transport, TransportError,
    TransportStream,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Network Configuration
// ----------------------------------------------------------------------------

/// Configuration for in-memory network behavior
#[derive(Debug, Clone)]
pub struct MemoryNetworkConfig {
    /// Simulated stream open latency range (min, max) in milliseconds
    pub latency_range: (u64, u64),
    /// Bytes buffered in each direction of a stream
    pub stream_buffer: usize,
    /// Per-node memory budget for stream reservations
    pub memory_limit: Option<usize>,
    /// Inbound streams queued per listener before open blocks
    pub accept_backlog: usize,
}

impl Default for MemoryNetworkConfig {
    fn default() -> Self {
        Self {
            latency_range: (0, 0),
            stream_buffer: 64 * 1024,
            memory_limit: None,
            accept_backlog: 64,
        }
    }
}

impl MemoryNetworkConfig {
    /// Small random open latency to shake out ordering assumptions
    pub fn jittery() -> Self {
        Self {
            latency_range: (1, 20),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Memory Metering
// ----------------------------------------------------------------------------

/// Memory budget shared by all streams of one node
#[derive(Debug)]
pub struct MemoryMeter {
    used: AtomicUsize,
    limit: Option<usize>,
}

impl MemoryMeter {
    fn new(limit: Option<usize>) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

impl MemoryScope for MemoryMeter {
    fn reserve(&self, bytes: usize) -> TesseraResult<()> {
        let limit = self.limit;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.checked_add(bytes)?;
                match limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map(|_| ())
            .map_err(|used| {
                TransportError::MemoryReservation {
                    requested: bytes,
                    reason: format!("{} of {:?} bytes in use", used, limit),
                }
                .into()
            })
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

// ----------------------------------------------------------------------------
// Network Statistics
// ----------------------------------------------------------------------------

/// Stream lifecycle counters across the whole network
#[derive(Debug, Default)]
pub struct NetworkStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    redundant_closes: AtomicUsize,
}

impl NetworkStats {
    /// Stream ends created, two per opened stream
    pub fn stream_ends(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Stream ends closed for the first time
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close calls on an already closed stream end
    pub fn redundant_closes(&self) -> usize {
        self.redundant_closes.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Memory Stream
// ----------------------------------------------------------------------------

/// One end of an in-memory stream
pub struct MemoryStream {
    io: DuplexStream,
    remote: PeerId,
    protocol: ProtocolId,
    meter: Arc<MemoryMeter>,
    stats: Arc<NetworkStats>,
    closed: bool,
}

impl MemoryStream {
    fn new(
        io: DuplexStream,
        remote: PeerId,
        protocol: ProtocolId,
        meter: Arc<MemoryMeter>,
        stats: Arc<NetworkStats>,
    ) -> Self {
        stats.opened.fetch_add(1, Ordering::SeqCst);
        Self {
            io,
            remote,
            protocol,
            meter,
            stats,
            closed: false,
        }
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for MemoryStream {
    fn remote_peer(&self) -> PeerId {
        self.remote
    }

    fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    fn scope(&self) -> Arc<dyn MemoryScope> {
        self.meter.clone()
    }

    async fn close(&mut self) -> TesseraResult<()> {
        if self.closed {
            self.stats.redundant_closes.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.closed = true;
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        // The remote end may already be gone
        let _ = self.io.shutdown().await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Memory Network
// ----------------------------------------------------------------------------

type Listener = mpsc::Sender<Box<dyn TransportStream>>;

struct NetworkInner {
    config: MemoryNetworkConfig,
    meters: RwLock<HashMap<PeerId, Arc<MemoryMeter>>>,
    listeners: RwLock<HashMap<(PeerId, ProtocolId), Listener>>,
    offline: RwLock<HashSet<PeerId>>,
    stats: Arc<NetworkStats>,
}

/// Shared in-memory network connecting every joined node
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(MemoryNetworkConfig::default())
    }
}

impl MemoryNetwork {
    pub fn new(config: MemoryNetworkConfig) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                config,
                meters: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                offline: RwLock::new(HashSet::new()),
                stats: Arc::new(NetworkStats::default()),
            }),
        }
    }

    /// Add a node and return its transport
    pub async fn join(&self, peer: PeerId) -> MemoryTransport {
        let meter = Arc::new(MemoryMeter::new(self.inner.config.memory_limit));
        self.inner.meters.write().await.insert(peer, meter.clone());
        debug!(peer = %peer, "Node joined memory network");
        MemoryTransport {
            local: peer,
            meter,
            network: self.clone(),
        }
    }

    /// Make a node unreachable; its own dials fail as well
    pub async fn set_offline(&self, peer: PeerId) {
        self.inner.offline.write().await.insert(peer);
    }

    pub async fn set_online(&self, peer: PeerId) {
        self.inner.offline.write().await.remove(&peer);
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.inner.stats
    }

    /// Bytes currently reserved by streams of `peer`
    pub async fn memory_in_use(&self, peer: PeerId) -> usize {
        self.inner
            .meters
            .read()
            .await
            .get(&peer)
            .map(|meter| meter.used())
            .unwrap_or(0)
    }

    async fn connect(
        &self,
        from: PeerId,
        to: PeerId,
        protocol: ProtocolId,
        local_meter: Arc<MemoryMeter>,
    ) -> TesseraResult<Box<dyn TransportStream>> {
        {
            let offline = self.inner.offline.read().await;
            if offline.contains(&from) || offline.contains(&to) {
                return Err(TesseraError::open_failed(to, "peer unreachable"));
            }
        }

        let listener = self
            .inner
            .listeners
            .read()
            .await
            .get(&(to, protocol))
            .cloned()
            .ok_or_else(|| TransportError::ProtocolNotSupported {
                peer_id: to.to_string(),
                protocol: protocol.to_string(),
            })?;
        let remote_meter = self
            .inner
            .meters
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or_else(|| TesseraError::open_failed(to, "peer not on network"))?;

        let (min, max) = self.inner.config.latency_range;
        if max > 0 {
            sleep(Duration::from_millis(fastrand::u64(min..=max.max(min)))).await;
        }

        let (local_io, remote_io) = tokio::io::duplex(self.inner.config.stream_buffer);
        let stats = self.inner.stats.clone();
        let local = MemoryStream::new(local_io, to, protocol, local_meter, stats.clone());
        let remote = MemoryStream::new(remote_io, from, protocol, remote_meter, stats);

        listener
            .send(Box::new(remote))
            .await
            .map_err(|_| TesseraError::open_failed(to, "listener closed"))?;
        trace!(from = %from, to = %to, protocol = %protocol, "Stream opened");
        Ok(Box::new(local))
    }
}

// ----------------------------------------------------------------------------
// Memory Transport
// ----------------------------------------------------------------------------

/// A node's view of the in-memory network
#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    meter: Arc<MemoryMeter>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Bytes currently reserved by this node's streams
    pub fn memory_in_use(&self) -> usize {
        self.meter.used()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(&self, peer: PeerId, protocol: ProtocolId) -> TesseraResult<Box<dyn TransportStream>> {
        self.network
            .connect(self.local, peer, protocol, self.meter.clone())
            .await
    }

    async fn listen(&self, protocol: ProtocolId) -> TesseraResult<mpsc::Receiver<Box<dyn TransportStream>>> {
        let (tx, rx) = mpsc::channel(self.network.inner.config.accept_backlog);
        self.network
            .inner
            .listeners
            .write()
            .await
            .insert((self.local, protocol), tx);
        debug!(peer = %self.local, protocol = %protocol, "Listening");
        Ok(rx)
    }

    async fn unlisten(&self, protocol: ProtocolId) {
        self.network
            .inner
            .listeners
            .write()
            .await
            .remove(&(self.local, protocol));
    }
}
