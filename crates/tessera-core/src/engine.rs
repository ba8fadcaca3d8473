//! Collaborator contracts consumed by the coordinator
//!
//! Cryptography, blame scoring and signature distribution are provided by the
//! embedding application through these traits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::protocol::SharedSignature;
use crate::request::{Blame, KeygenRequest, KeygenResponse, KeysignRequest, Signature};
use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Cryptographic Engines
// ----------------------------------------------------------------------------

/// Threshold signing with an already formed party
///
/// Failures attributable to specific peers should be reported as
/// `SigningError::Blamed` so the caller can forward the blame.
#[async_trait]
pub trait SigningEngine: Send + Sync {
    async fn sign(&self, session_id: &str, request: &KeysignRequest, participants: &[PeerId]) -> Result<Signature>;
}

/// Distributed key generation with an already formed party
#[async_trait]
pub trait KeygenEngine: Send + Sync {
    async fn generate(
        &self,
        session_id: &str,
        request: &KeygenRequest,
        participants: &[PeerId],
    ) -> Result<KeygenResponse>;
}

/// Check a candidate signature against the request it should cover
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, request: &KeysignRequest, signature: &Signature) -> bool;
}

// ----------------------------------------------------------------------------
// Blame
// ----------------------------------------------------------------------------

pub trait BlameManager: Send + Sync {
    /// Blame for a party that could not be formed
    fn node_sync_blame(&self, expected: &[PeerId], online: &[PeerId]) -> Blame;
}

// ----------------------------------------------------------------------------
// Signature Notification
// ----------------------------------------------------------------------------

/// Channel through which signatures produced elsewhere reach this node
#[async_trait]
pub trait SignatureNotifier: Send + Sync {
    /// Receive notices for `session_id` until unsubscribed
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<SharedSignature>>;

    async fn unsubscribe(&self, session_id: &str);

    /// Share a notice with `peers`
    async fn publish(&self, session_id: &str, peers: &[PeerId], notice: SharedSignature) -> Result<()>;

    /// Tell `peers` that signing `message` failed
    async fn publish_failure(&self, session_id: &str, peers: &[PeerId], message: &str) -> Result<()> {
        self.publish(session_id, peers, SharedSignature::failed(message)).await
    }
}
