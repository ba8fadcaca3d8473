//! Signing and keygen message routing over the TSS protocol
//!
//! Every inbound stream carries one JSON encoded [`WrappedMessage`], which is
//! dispatched to whoever subscribed to its message type and session.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tessera_core::{
    FrameDeadline, PeerId, ProtocolId, StreamConfig, StreamHandle, TesseraConfig, TesseraResult, Transport,
    TransportStream, TssMessageType, WrappedMessage, MAX_PAYLOAD, UNKNOWN_SESSION,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::managers::StreamManager;

/// A routed message and the peer it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PeerId,
    pub message: WrappedMessage,
}

type Topic = (TssMessageType, String);

struct RouterInner {
    transport: Arc<dyn Transport>,
    local: PeerId,
    stream_config: StreamConfig,
    buffer: usize,
    subscribers: DashMap<Topic, mpsc::Sender<InboundMessage>>,
    streams: StreamManager,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// ----------------------------------------------------------------------------
// Message Router
// ----------------------------------------------------------------------------

/// Routes [`WrappedMessage`]s between peers and local subscribers
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("local", &self.inner.local)
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

impl MessageRouter {
    pub fn new(transport: Arc<dyn Transport>, config: &TesseraConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RouterInner {
                local: transport.local_peer(),
                transport,
                stream_config: config.streams.clone(),
                buffer: config.keysign.subscription_buffer,
                subscribers: DashMap::new(),
                streams: StreamManager::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn stream_manager(&self) -> &StreamManager {
        &self.inner.streams
    }

    /// Receive messages of `message_type` for `session_id`
    ///
    /// A second subscription to the same topic replaces the first.
    pub fn subscribe(&self, message_type: TssMessageType, session_id: &str) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        if self
            .inner
            .subscribers
            .insert((message_type, session_id.to_string()), tx)
            .is_some()
        {
            debug!(%message_type, session = session_id, "Replaced existing subscription");
        }
        rx
    }

    pub fn unsubscribe(&self, message_type: TssMessageType, session_id: &str) {
        self.inner.subscribers.remove(&(message_type, session_id.to_string()));
    }

    /// Close every stream parked under `session_id`
    pub async fn release_streams(&self, session_id: &str) {
        self.inner.streams.release(session_id).await;
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub async fn start(&self) -> TesseraResult<()> {
        let inbound = self.inner.transport.listen(ProtocolId::Tss).await?;
        let handle = tokio::spawn(self.clone().accept_loop(inbound));
        self.inner.tasks.lock().await.push(handle);
        info!(peer = %self.inner.local, "Message router started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.transport.unlisten(ProtocolId::Tss).await;
        self.inner.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Router accept loop ended abnormally");
            }
        }
        self.inner.subscribers.clear();
        info!(peer = %self.inner.local, "Message router stopped");
    }

    async fn accept_loop(self, mut inbound: mpsc::Receiver<Box<dyn TransportStream>>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                stream = inbound.recv() => {
                    let Some(stream) = stream else { break };
                    let stream = StreamHandle::new(stream, &self.inner.stream_config);
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_stream(stream).await });
                }
            }
        }
    }

    async fn handle_stream(&self, stream: StreamHandle) {
        let remote = stream.remote_peer();
        let message = {
            let _reservation = match stream.reserve_scoped(MAX_PAYLOAD) {
                Ok(reservation) => reservation,
                Err(e) => {
                    warn!(peer = %remote, error = %e, "Failed to reserve memory for inbound message");
                    self.inner.streams.add(UNKNOWN_SESSION, stream).await;
                    return;
                }
            };
            stream
                .read_frame(FrameDeadline::Standard)
                .await
                .and_then(|payload| WrappedMessage::decode(&payload))
        };
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Failed to read wrapped message");
                self.inner.streams.add(UNKNOWN_SESSION, stream).await;
                return;
            }
        };
        let session_id = message.session_id.clone();
        self.inner.streams.add(&session_id, stream.clone()).await;
        if !self.dispatch(InboundMessage { from: remote, message }).await {
            self.inner.streams.discard(&session_id, &stream).await;
        }
    }

    /// Hand `inbound` to its subscriber; `false` when nobody took it
    async fn dispatch(&self, inbound: InboundMessage) -> bool {
        let topic = (inbound.message.message_type, inbound.message.session_id.clone());
        let Some(subscriber) = self.inner.subscribers.get(&topic).map(|entry| entry.value().clone()) else {
            debug!(
                message_type = %topic.0,
                session = %topic.1,
                "No subscriber for message"
            );
            return false;
        };
        if subscriber.send(inbound).await.is_err() {
            debug!(message_type = %topic.0, session = %topic.1, "Subscriber went away");
            self.inner.subscribers.remove(&topic);
            return false;
        }
        true
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Send `message` to every peer in `peers` except ourselves
    ///
    /// Delivery is best effort; failures are logged per peer.
    pub async fn broadcast(&self, peers: &[PeerId], message: &WrappedMessage) -> TesseraResult<()> {
        let payload = message.encode()?;
        let sends = peers
            .iter()
            .filter(|peer| **peer != self.inner.local)
            .map(|peer| {
                let payload = &payload;
                async move {
                    if let Err(e) = self.send_to(*peer, &message.session_id, payload).await {
                        warn!(peer = %peer, message_type = %message.message_type, error = %e, "Failed to send message");
                    }
                }
            });
        join_all(sends).await;
        Ok(())
    }

    async fn send_to(&self, peer: PeerId, session_id: &str, payload: &[u8]) -> TesseraResult<()> {
        let stream =
            StreamHandle::open(self.inner.transport.as_ref(), peer, ProtocolId::Tss, &self.inner.stream_config).await?;
        self.inner.streams.add(session_id, stream.clone()).await;
        let _reservation = stream.reserve_scoped(MAX_PAYLOAD)?;
        stream.write_frame(payload).await
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}
