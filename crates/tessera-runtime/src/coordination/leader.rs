//! Deterministic leader election
//!
//! Every node of a session computes the same leader from the session id, the
//! block height and the peer set, without exchanging messages.

use sha2::{Digest, Sha256};
use tessera_core::{canonical_peers, CoordinationError, PeerId, TesseraResult};

const LEADER_DOMAIN: &[u8] = b"tessera/leader/v1";

/// Election score of `peer`; the lowest score wins
pub fn leader_score(session_id: &str, block_height: u64, peer: &PeerId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(LEADER_DOMAIN);
    hasher.update(session_id.as_bytes());
    hasher.update(block_height.to_le_bytes());
    hasher.update(peer.as_bytes());
    hasher.finalize().into()
}

/// Pick the leader of `peers` for this session and height
///
/// Input order and duplicates do not affect the result.
pub fn elect_leader(session_id: &str, block_height: u64, peers: &[PeerId]) -> TesseraResult<PeerId> {
    canonical_peers(peers)
        .into_iter()
        .min_by_key(|peer| (leader_score(session_id, block_height, peer), *peer))
        .ok_or_else(|| CoordinationError::EmptyPeerSet.into())
}
