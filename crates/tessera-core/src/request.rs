//! Signing and key generation requests and their responses
//!
//! Also hosts the quorum threshold rule and the deterministic derivation of
//! session identifiers, so that every node of a request agrees on both without
//! communicating.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Result, TesseraError};
use crate::types::{canonical_peers, decode_peer_ids, PeerId};

// ----------------------------------------------------------------------------
// Threshold
// ----------------------------------------------------------------------------

/// Minimum number of other peers a party needs: `ceil(2n/3) - 1`
///
/// The local node counts on top, so a party of `threshold(n) + 1` members is
/// a quorum.
pub fn threshold(n: usize) -> Result<usize> {
    if n == 0 {
        return Err(TesseraError::invalid_request("Peer count cannot be zero"));
    }
    Ok((2 * n).div_ceil(3) - 1)
}

// ----------------------------------------------------------------------------
// Status and Blame
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Fail,
}

/// Reason attached to a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlameReason {
    InternalError,
    NodeSyncFailure,
    SigningFailure,
    KeygenFailure,
}

/// Peers held responsible for a failed request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Blame {
    pub fail_reason: Option<BlameReason>,
    pub blame_nodes: Vec<PeerId>,
}

impl Blame {
    pub fn new(reason: BlameReason, nodes: Vec<PeerId>) -> Self {
        Self {
            fail_reason: Some(reason),
            blame_nodes: nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fail_reason.is_none() && self.blame_nodes.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Keysign
// ----------------------------------------------------------------------------

/// ECDSA style signature components, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
}

/// Request to sign a message with a pool key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignRequest {
    pub pool_pub_key: String,
    /// Base64 encoded message to be signed
    pub message: String,
    pub signers: Vec<String>,
    pub block_height: u64,
}

impl KeysignRequest {
    pub fn new<S: Into<String>>(pool_pub_key: S, message: &[u8], signers: Vec<String>, block_height: u64) -> Self {
        Self {
            pool_pub_key: pool_pub_key.into(),
            message: BASE64.encode(message),
            signers,
            block_height,
        }
    }

    /// Decoded message bytes
    pub fn message_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.message)
            .map_err(|e| TesseraError::invalid_request(format!("Message is not valid base64: {}", e)))
    }

    /// Signer set in canonical order
    pub fn signer_peers(&self) -> Result<Vec<PeerId>> {
        Ok(canonical_peers(&decode_peer_ids(&self.signers)?))
    }

    /// Check the request is well formed and the signer set can reach a quorum
    pub fn validate(&self) -> Result<()> {
        self.message_bytes()?;
        if self.signers.is_empty() {
            return Err(TesseraError::invalid_request("Signer list is empty"));
        }
        let signers = self.signer_peers()?;
        let required = threshold(signers.len())?;
        if signers.len() <= required {
            return Err(TesseraError::invalid_request(format!(
                "Not enough signers: {} signers, threshold {}",
                signers.len(),
                required
            )));
        }
        Ok(())
    }

    /// Session identifier shared by every signer of this request
    pub fn session_id(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(b"keysign");
        hasher.update(self.pool_pub_key.as_bytes());
        hasher.update(self.message.as_bytes());
        for peer in self.signer_peers()? {
            hasher.update(peer.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub signature: Option<Signature>,
    pub status: Status,
    pub blame: Blame,
}

impl KeysignResponse {
    pub fn success(signature: Signature) -> Self {
        Self {
            signature: Some(signature),
            status: Status::Success,
            blame: Blame::default(),
        }
    }

    pub fn failure(blame: Blame) -> Self {
        Self {
            signature: None,
            status: Status::Fail,
            blame,
        }
    }
}

// ----------------------------------------------------------------------------
// Keygen
// ----------------------------------------------------------------------------

/// Request to generate a new pool key among a set of parties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenRequest {
    pub keys: Vec<String>,
    pub block_height: u64,
}

impl KeygenRequest {
    pub fn new(keys: Vec<String>, block_height: u64) -> Self {
        Self { keys, block_height }
    }

    pub fn party_peers(&self) -> Result<Vec<PeerId>> {
        Ok(canonical_peers(&decode_peer_ids(&self.keys)?))
    }

    pub fn session_id(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(b"keygen");
        for peer in self.party_peers()? {
            hasher.update(peer.as_bytes());
        }
        hasher.update(self.block_height.to_le_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenResponse {
    pub pub_key: String,
    pub pool_address: String,
    pub status: Status,
    pub blame: Blame,
}

impl KeygenResponse {
    pub fn success<S: Into<String>>(pub_key: S, pool_address: S) -> Self {
        Self {
            pub_key: pub_key.into(),
            pool_address: pool_address.into(),
            status: Status::Success,
            blame: Blame::default(),
        }
    }

    pub fn failure(blame: Blame) -> Self {
        Self {
            pub_key: String::new(),
            pool_address: String::new(),
            status: Status::Fail,
            blame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        assert!(threshold(0).is_err());
        assert_eq!(threshold(1).unwrap(), 0);
        assert_eq!(threshold(3).unwrap(), 1);
        assert_eq!(threshold(4).unwrap(), 2);
        assert_eq!(threshold(5).unwrap(), 3);
        assert_eq!(threshold(10).unwrap(), 6);
    }

    #[test]
    fn test_session_id_ignores_signer_order() {
        let a = PeerId::new([1; 8]).to_string();
        let b = PeerId::new([2; 8]).to_string();
        let first = KeysignRequest::new("pool", b"hello", vec![a.clone(), b.clone()], 10);
        let second = KeysignRequest::new("pool", b"hello", vec![b, a], 10);
        assert_eq!(first.session_id().unwrap(), second.session_id().unwrap());
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let signers: Vec<String> = (1..=3u8).map(|i| PeerId::new([i; 8]).to_string()).collect();
        assert!(KeysignRequest::new("pool", b"msg", signers.clone(), 1).validate().is_ok());

        let mut bad_message = KeysignRequest::new("pool", b"msg", signers, 1);
        bad_message.message = "***".to_string();
        assert!(bad_message.validate().is_err());

        assert!(KeysignRequest::new("pool", b"msg", vec![], 1).validate().is_err());
    }
}
