//! Join-party session state for the Tessera runtime
//!
//! A [`PeerSession`] records which expected peers have answered, the elected
//! leader and the leader's decision for one coordination attempt. The
//! [`SessionRegistry`] owns the session id to state mapping.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tessera_core::{LeaderDecision, PeerId, SessionError, StreamHandle, TesseraResult};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Peer Session
// ----------------------------------------------------------------------------

/// How responses are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Every newly seen peer is reported on the new-peer channel
    Leaderless,
    /// Responses count towards the quorum until the threshold is reached
    LeaderDirected,
}

#[derive(Debug, Default)]
struct ResponseTable {
    responded: BTreeMap<PeerId, bool>,
    count: usize,
    streams: BTreeMap<PeerId, StreamHandle>,
}

/// Leader's decision together with everyone it must reach
#[derive(Debug, Clone)]
pub struct Finalized {
    pub decision: LeaderDecision,
    /// Streams of peers that asked to join
    pub streams: Vec<StreamHandle>,
    /// Expected peers without a stream to answer on
    pub unreached: Vec<PeerId>,
}

/// Per-session record of peer responses
#[derive(Debug)]
pub struct PeerSession {
    session_id: String,
    mode: JoinMode,
    threshold: usize,
    responses: Mutex<ResponseTable>,
    leader: OnceLock<PeerId>,
    decision: OnceLock<LeaderDecision>,
    notify_tx: mpsc::Sender<()>,
    notify_rx: Mutex<mpsc::Receiver<()>>,
    new_peer_tx: mpsc::Sender<PeerId>,
    new_peer_rx: Mutex<mpsc::Receiver<PeerId>>,
}

impl PeerSession {
    /// Create a session expecting `peers`, the local peer excluded
    pub fn new(session_id: &str, peers: &[PeerId], local: PeerId, mode: JoinMode, threshold: usize) -> Self {
        let responded: BTreeMap<PeerId, bool> = peers
            .iter()
            .filter(|peer| **peer != local)
            .map(|peer| (*peer, false))
            .collect();
        let capacity = peers.len().max(1);
        let (notify_tx, notify_rx) = mpsc::channel(capacity);
        let (new_peer_tx, new_peer_rx) = mpsc::channel(capacity);

        Self {
            session_id: session_id.to_string(),
            mode,
            threshold,
            responses: Mutex::new(ResponseTable {
                responded,
                ..ResponseTable::default()
            }),
            leader: OnceLock::new(),
            decision: OnceLock::new(),
            notify_tx,
            notify_rx: Mutex::new(notify_rx),
            new_peer_tx,
            new_peer_rx: Mutex::new(new_peer_rx),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> JoinMode {
        self.mode
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record the elected leader; only the first call has an effect
    pub fn set_leader(&self, leader: PeerId) -> bool {
        self.leader.set(leader).is_ok()
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.leader.get().copied()
    }

    /// Record the leader's decision; only the first call has an effect
    pub fn set_decision(&self, decision: LeaderDecision) -> bool {
        self.decision.set(decision).is_ok()
    }

    pub fn decision(&self) -> Option<&LeaderDecision> {
        self.decision.get()
    }

    /// Mark `peer` as responded
    ///
    /// Returns `true` when the caller should signal: in leaderless mode when the
    /// peer is seen for the first time, in leader-directed mode when this
    /// response completes the quorum. Duplicates and responses arriving after
    /// the quorum or decision are ignored.
    pub async fn update_peer(&self, peer: PeerId) -> TesseraResult<bool> {
        let mut table = self.responses.lock().await;
        let seen = match table.responded.get(&peer) {
            Some(seen) => *seen,
            None => {
                return Err(SessionError::UnknownPeer {
                    session_id: self.session_id.clone(),
                    peer_id: peer.to_string(),
                }
                .into())
            }
        };

        match self.mode {
            JoinMode::Leaderless => {
                if seen {
                    return Ok(false);
                }
                table.responded.insert(peer, true);
                table.count += 1;
                Ok(true)
            }
            JoinMode::LeaderDirected => {
                if seen || table.count >= self.threshold || self.decision.get().is_some() {
                    return Ok(false);
                }
                table.responded.insert(peer, true);
                table.count += 1;
                Ok(table.count >= self.threshold)
            }
        }
    }

    /// Keep `stream` to answer `peer` with the decision
    ///
    /// A newer stream from the same peer replaces the older one. When the
    /// decision was already taken it is returned instead and the caller answers
    /// on the stream itself.
    pub async fn attach_stream(&self, peer: PeerId, stream: StreamHandle) -> Option<LeaderDecision> {
        let mut table = self.responses.lock().await;
        if !table.responded.contains_key(&peer) {
            return None;
        }
        if let Some(decision) = self.decision.get() {
            return Some(decision.clone());
        }
        table.streams.insert(peer, stream);
        None
    }

    /// Take the leader's decision from the current responders
    ///
    /// `decide` receives the responders in canonical order. Runs under the
    /// response lock, so every attached stream is either returned here or
    /// answered by `attach_stream`.
    pub async fn finalize<F>(&self, decide: F) -> Finalized
    where
        F: FnOnce(&[PeerId]) -> LeaderDecision,
    {
        let table = self.responses.lock().await;
        if let Some(decision) = self.decision.get() {
            return Finalized {
                decision: decision.clone(),
                streams: Vec::new(),
                unreached: Vec::new(),
            };
        }
        let online: Vec<PeerId> = table
            .responded
            .iter()
            .filter(|(_, responded)| **responded)
            .map(|(peer, _)| *peer)
            .collect();
        let decision = decide(&online);
        let _ = self.decision.set(decision.clone());

        Finalized {
            decision,
            streams: table.streams.values().cloned().collect(),
            unreached: table
                .responded
                .keys()
                .filter(|peer| !table.streams.contains_key(peer))
                .copied()
                .collect(),
        }
    }

    /// Responded and silent peers, each in canonical order
    pub async fn peers_status(&self) -> (Vec<PeerId>, Vec<PeerId>) {
        let table = self.responses.lock().await;
        let mut online = Vec::new();
        let mut offline = Vec::new();
        for (peer, responded) in &table.responded {
            if *responded {
                online.push(*peer);
            } else {
                offline.push(*peer);
            }
        }
        (online, offline)
    }

    /// Whether every expected peer has responded
    pub async fn all_responded(&self) -> bool {
        self.responses.lock().await.responded.values().all(|r| *r)
    }

    pub async fn response_count(&self) -> usize {
        self.responses.lock().await.count
    }

    /// Wake the waiter on the notify channel
    pub fn notify(&self) {
        if self.notify_tx.try_send(()).is_err() {
            debug!(session = %self.session_id, "Notify channel full or closed");
        }
    }

    /// Report a newly seen peer
    pub fn signal_new_peer(&self, peer: PeerId) {
        if self.new_peer_tx.try_send(peer).is_err() {
            debug!(session = %self.session_id, peer = %peer, "New-peer channel full or closed");
        }
    }

    /// Wait for a notification; `false` once the session is drained
    pub async fn notified(&self) -> bool {
        self.notify_rx.lock().await.recv().await.is_some()
    }

    /// Wait for the next newly seen peer; `None` once the session is drained
    pub async fn next_new_peer(&self) -> Option<PeerId> {
        self.new_peer_rx.lock().await.recv().await
    }

    /// Close both signal channels and discard pending signals
    pub async fn drain(&self, grace: Duration) {
        match tokio::time::timeout(grace, self.notify_rx.lock()).await {
            Ok(mut rx) => {
                rx.close();
                while rx.try_recv().is_ok() {}
            }
            Err(_) => warn!(session = %self.session_id, "Notify channel still in use at teardown"),
        }
        match tokio::time::timeout(grace, self.new_peer_rx.lock()).await {
            Ok(mut rx) => {
                rx.close();
                while rx.try_recv().is_ok() {}
            }
            Err(_) => warn!(session = %self.session_id, "New-peer channel still in use at teardown"),
        }
    }
}

// ----------------------------------------------------------------------------
// Session Registry
// ----------------------------------------------------------------------------

/// Owns the live sessions of one node
#[derive(Debug)]
pub struct SessionRegistry {
    local: PeerId,
    drain_grace: Duration,
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new(local: PeerId, drain_grace: Duration) -> Self {
        Self {
            local,
            drain_grace,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a session; a live duplicate id is rejected
    pub async fn create(
        &self,
        session_id: &str,
        peers: &[PeerId],
        mode: JoinMode,
        threshold: usize,
    ) -> TesseraResult<Arc<PeerSession>> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Err(SessionError::SessionAlreadyExists {
                session_id: session_id.to_string(),
            }
            .into());
        }
        let session = Arc::new(PeerSession::new(session_id, peers, self.local, mode, threshold));
        sessions.insert(session_id.to_string(), session.clone());
        debug!(session = session_id, peers = peers.len(), ?mode, "Session created");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Drain the session's channels, then unregister it
    pub async fn remove(&self, session_id: &str) -> bool {
        let Some(session) = self.get(session_id).await else {
            return false;
        };
        session.drain(self.drain_grace).await;

        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(current) if Arc::ptr_eq(current, &session) => {
                sessions.remove(session_id);
                debug!(session = session_id, "Session removed");
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
