//! Deterministic collaborators for tests
//!
//! Signatures and keys are SHA-256 digests of the request, so every node
//! computes the same result and verification is a recomputation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tessera_core::{
    Blame, BlameManager, BlameReason, KeygenEngine, KeygenRequest, KeygenResponse, KeysignRequest,
    PeerId, Signature, SignatureVerifier, SigningEngine, SigningError, TesseraResult,
};
use tokio::time::{sleep, Duration};

/// Signature the deterministic engine produces for `request`
pub fn expected_signature(request: &KeysignRequest) -> Signature {
    let mut hasher = Sha256::new();
    hasher.update(request.pool_pub_key.as_bytes());
    hasher.update(request.message.as_bytes());
    let digest = hasher.finalize();
    Signature {
        r: hex::encode(&digest[..16]),
        s: hex::encode(&digest[16..]),
    }
}

// ----------------------------------------------------------------------------
// Signing Engine
// ----------------------------------------------------------------------------

/// Signing engine with configurable latency and failure
#[derive(Debug, Default)]
pub struct MockSigningEngine {
    delay: Duration,
    failure: Option<Blame>,
    calls: AtomicUsize,
    parties: Mutex<Vec<Vec<PeerId>>>,
}

impl MockSigningEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `delay` before producing a signature
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail every request with `blame`
    pub fn failing(blame: Blame) -> Self {
        Self {
            failure: Some(blame),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Participant lists the engine was invoked with
    pub fn parties(&self) -> Vec<Vec<PeerId>> {
        self.parties.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SigningEngine for MockSigningEngine {
    async fn sign(&self, _session_id: &str, request: &KeysignRequest, participants: &[PeerId]) -> TesseraResult<Signature> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut parties) = self.parties.lock() {
            parties.push(participants.to_vec());
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        match &self.failure {
            Some(blame) => Err(SigningError::Blamed { blame: blame.clone() }.into()),
            None => Ok(expected_signature(request)),
        }
    }
}

// ----------------------------------------------------------------------------
// Keygen Engine
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MockKeygenEngine {
    calls: AtomicUsize,
}

impl MockKeygenEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeygenEngine for MockKeygenEngine {
    async fn generate(
        &self,
        _session_id: &str,
        _request: &KeygenRequest,
        participants: &[PeerId],
    ) -> TesseraResult<KeygenResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        for peer in participants {
            hasher.update(peer.as_bytes());
        }
        let pub_key = hex::encode(hasher.finalize());
        let pool_address = format!("tss1{}", &pub_key[..38]);
        Ok(KeygenResponse::success(pub_key, pool_address))
    }
}

// ----------------------------------------------------------------------------
// Verification and Blame
// ----------------------------------------------------------------------------

/// Accepts exactly the signatures of [`MockSigningEngine`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestVerifier;

impl SignatureVerifier for DigestVerifier {
    fn verify(&self, request: &KeysignRequest, signature: &Signature) -> bool {
        expected_signature(request) == *signature
    }
}

/// Blames every expected peer that did not show up
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncBlameManager;

impl BlameManager for SyncBlameManager {
    fn node_sync_blame(&self, expected: &[PeerId], online: &[PeerId]) -> Blame {
        let missing = expected
            .iter()
            .filter(|peer| !online.contains(peer))
            .copied()
            .collect();
        Blame::new(BlameReason::NodeSyncFailure, missing)
    }
}
