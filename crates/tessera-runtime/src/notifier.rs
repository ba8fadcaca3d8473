//! Signature notification over the message router
//!
//! Signers share finished signatures, or the news that signing failed, as
//! [`TssMessageType::Signature`] messages so slower peers can stop early.

use async_trait::async_trait;
use tessera_core::{
    PeerId, Result, SharedSignature, SignatureNotifier, TssMessageType, WrappedMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messenger::MessageRouter;

/// [`SignatureNotifier`] backed by a [`MessageRouter`]
#[derive(Debug, Clone)]
pub struct BroadcastSignatureNotifier {
    router: MessageRouter,
    buffer: usize,
}

impl BroadcastSignatureNotifier {
    pub fn new(router: MessageRouter, buffer: usize) -> Self {
        Self {
            router,
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl SignatureNotifier for BroadcastSignatureNotifier {
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<SharedSignature>> {
        let mut inbound = self.router.subscribe(TssMessageType::Signature, session_id);
        let (tx, rx) = mpsc::channel(self.buffer);
        let session = session_id.to_string();

        // Ends when the router drops the subscription or the receiver goes away
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let notice: SharedSignature = match serde_json::from_slice(&message.message.payload) {
                    Ok(notice) => notice,
                    Err(e) => {
                        warn!(session = %session, peer = %message.from, error = %e, "Malformed signature notice");
                        continue;
                    }
                };
                if tx.send(notice).await.is_err() {
                    break;
                }
            }
            debug!(session = %session, "Signature subscription closed");
        });
        Ok(rx)
    }

    async fn unsubscribe(&self, session_id: &str) {
        self.router.unsubscribe(TssMessageType::Signature, session_id);
    }

    async fn publish(&self, session_id: &str, peers: &[PeerId], notice: SharedSignature) -> Result<()> {
        let payload = serde_json::to_vec(&notice)?;
        let message = WrappedMessage::new(TssMessageType::Signature, session_id, payload);
        self.router.broadcast(peers, &message).await
    }
}
