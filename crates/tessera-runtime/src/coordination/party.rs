//! Join-party protocols
//!
//! [`PartyCoordinator`] decides which peers take part in a signing or keygen
//! session. The leader-directed protocol elects one peer that collects join
//! requests and announces the participant list; the leaderless protocol keeps
//! broadcasting until every expected peer has answered or the deadline passes.

use std::sync::Arc;

use futures::future::join_all;
use tessera_core::{
    canonical_peers, Ack, CoordinationError, CoordinatorConfig, FrameDeadline, JoinPartyLeaderComm,
    JoinPartyRequest, LeaderCommType, LeaderDecision, LeaderOutcome, PeerId, ProtocolId, StreamConfig,
    StreamHandle, TesseraConfig, TesseraResult, Transport, TransportStream, UNKNOWN_SESSION,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::coordination::leader::elect_leader;
use crate::managers::{Finalized, JoinMode, PeerSession, SessionRegistry, StreamManager};
use crate::race::RaceListener;

/// Memory reserved on every join-party stream
pub const JOIN_PARTY_RESERVATION: usize = 8 * 1024;

const JOIN_PROTOCOLS: [ProtocolId; 2] = [ProtocolId::JoinParty, ProtocolId::JoinPartyLeader];

/// Result of a leader-directed join
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartyOutcome {
    /// The party formed; `participants` is in canonical order and includes the leader
    Formed { participants: Vec<PeerId>, leader: PeerId },
    /// A signature arrived from elsewhere before the party formed
    RaceLost,
}

enum MemberWait {
    Decided,
    TimedOut,
    Cancelled,
}

// ----------------------------------------------------------------------------
// Party Coordinator
// ----------------------------------------------------------------------------

struct CoordinatorInner {
    transport: Arc<dyn Transport>,
    local: PeerId,
    config: CoordinatorConfig,
    stream_config: StreamConfig,
    registry: SessionRegistry,
    streams: StreamManager,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Runs join-party protocols for one node
#[derive(Clone)]
pub struct PartyCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for PartyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartyCoordinator")
            .field("local", &self.inner.local)
            .finish()
    }
}

impl PartyCoordinator {
    pub fn new(transport: Arc<dyn Transport>, config: &TesseraConfig) -> Self {
        let local = transport.local_peer();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(CoordinatorInner {
                transport,
                local,
                config: config.coordinator.clone(),
                stream_config: config.streams.clone(),
                registry: SessionRegistry::new(local, config.coordinator.drain_grace()),
                streams: StreamManager::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn stream_manager(&self) -> &StreamManager {
        &self.inner.streams
    }

    /// Close every stream parked under `session_id`
    pub async fn release_streams(&self, session_id: &str) {
        self.inner.streams.release(session_id).await;
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Register the join-party stream handlers
    pub async fn start(&self) -> TesseraResult<()> {
        let mut tasks = self.inner.tasks.lock().await;
        for protocol in JOIN_PROTOCOLS {
            let inbound = self.inner.transport.listen(protocol).await?;
            tasks.push(tokio::spawn(self.clone().accept_loop(protocol, inbound)));
        }
        info!(peer = %self.inner.local, "Party coordinator started");
        Ok(())
    }

    /// Unregister the handlers and wait for the accept loops to exit
    pub async fn stop(&self) {
        for protocol in JOIN_PROTOCOLS {
            self.inner.transport.unlisten(protocol).await;
        }
        self.inner.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }
        info!(peer = %self.inner.local, "Party coordinator stopped");
    }

    async fn accept_loop(self, protocol: ProtocolId, mut inbound: mpsc::Receiver<Box<dyn TransportStream>>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                stream = inbound.recv() => {
                    let Some(stream) = stream else { break };
                    let stream = StreamHandle::new(stream, &self.inner.stream_config);
                    let this = self.clone();
                    tokio::spawn(async move {
                        match protocol {
                            ProtocolId::JoinParty => this.handle_stream(stream).await,
                            _ => this.handle_stream_with_leader(stream).await,
                        }
                    });
                }
            }
        }
        debug!(%protocol, "Accept loop exited");
    }

    // ------------------------------------------------------------------------
    // Inbound Handlers
    // ------------------------------------------------------------------------

    /// Leaderless join request from a peer
    async fn handle_stream(&self, stream: StreamHandle) {
        let remote = stream.remote_peer();
        let payload = match stream.read_frame(FrameDeadline::Standard).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Failed to read join party request");
                self.inner.streams.add(UNKNOWN_SESSION, stream).await;
                return;
            }
        };
        let request = match JoinPartyRequest::decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Failed to decode join party request");
                self.inner.streams.add(UNKNOWN_SESSION, stream).await;
                return;
            }
        };
        self.inner.streams.add(&request.session_id, stream.clone()).await;

        let Some(session) = self.inner.registry.get(&request.session_id).await else {
            debug!(session = %request.session_id, peer = %remote, "No local party for join request");
            self.inner.streams.discard(&request.session_id, &stream).await;
            return;
        };
        match session.update_peer(remote).await {
            Ok(true) => session.signal_new_peer(remote),
            Ok(false) => {}
            Err(e) => warn!(session = %request.session_id, error = %e, "Rejected join party request"),
        }
    }

    /// Join request to this leader, or decision from a leader
    async fn handle_stream_with_leader(&self, stream: StreamHandle) {
        let remote = stream.remote_peer();
        let payload = match stream.read_frame(FrameDeadline::Standard).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Failed to read leader message");
                self.inner.streams.add(UNKNOWN_SESSION, stream).await;
                return;
            }
        };
        let message = match JoinPartyLeaderComm::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Failed to decode leader message");
                self.inner.streams.add(UNKNOWN_SESSION, stream).await;
                return;
            }
        };

        match message.msg_type {
            LeaderCommType::Request => self.handle_join_request(&message.session_id, stream).await,
            LeaderCommType::Response => {
                self.inner.streams.add(&message.session_id, stream.clone()).await;
                let known = self.process_response(&message, remote).await;
                if let Err(e) = stream.write_frame(Ack::CopyDone.as_bytes()).await {
                    debug!(peer = %remote, error = %e, "Failed to acknowledge leader response");
                }
                if !known {
                    self.inner.streams.discard(&message.session_id, &stream).await;
                }
            }
        }
    }

    async fn handle_join_request(&self, session_id: &str, stream: StreamHandle) {
        let remote = stream.remote_peer();
        if let Err(e) = stream.reserve(JOIN_PARTY_RESERVATION) {
            warn!(peer = %remote, error = %e, "Failed to reserve stream memory");
        }
        self.inner.streams.add(session_id, stream.clone()).await;

        let Some(session) = self.inner.registry.get(session_id).await else {
            debug!(session = session_id, peer = %remote, "Join request for unknown session");
            self.acknowledge(&stream, Ack::InvalidRequest).await;
            self.inner.streams.discard(session_id, &stream).await;
            return;
        };
        let quorum = match session.update_peer(remote).await {
            Ok(quorum) => quorum,
            Err(e) => {
                debug!(session = session_id, error = %e, "Invalid join request");
                self.acknowledge(&stream, Ack::InvalidRequest).await;
                return;
            }
        };

        // The ack must precede the decision on this stream
        self.acknowledge(&stream, Ack::RequestReceived).await;
        if let Some(decision) = session.attach_stream(remote, stream.clone()).await {
            let response = JoinPartyLeaderComm::response(session_id, &decision);
            self.deliver_response(&stream, &response).await;
        }
        if quorum {
            session.notify();
        }
    }

    async fn acknowledge(&self, stream: &StreamHandle, ack: Ack) {
        if let Err(e) = stream.write_frame(ack.as_bytes()).await {
            debug!(peer = %stream.remote_peer(), ?ack, error = %e, "Failed to acknowledge join request");
        }
    }

    /// Record a decision if it comes from the session's leader
    ///
    /// Returns `false` when the session is unknown locally.
    async fn process_response(&self, message: &JoinPartyLeaderComm, remote: PeerId) -> bool {
        let Some(session) = self.inner.registry.get(&message.session_id).await else {
            info!(session = %message.session_id, "Leader response for unknown session");
            return false;
        };
        if session.leader() != Some(remote) {
            info!(session = %message.session_id, peer = %remote, "Response not from the session leader");
            return true;
        }
        let decision = LeaderDecision::new(message.outcome, message.participant_ids.clone());
        if session.set_decision(decision) {
            session.notify();
        }
        true
    }

    // ------------------------------------------------------------------------
    // Outbound Messages
    // ------------------------------------------------------------------------

    /// Open a stream, park it under the session and send `payload`
    async fn send_message(
        &self,
        session_id: &str,
        peer: PeerId,
        protocol: ProtocolId,
        payload: &[u8],
    ) -> TesseraResult<StreamHandle> {
        let stream =
            StreamHandle::open(self.inner.transport.as_ref(), peer, protocol, &self.inner.stream_config).await?;
        self.inner.streams.add(session_id, stream.clone()).await;
        stream.reserve(JOIN_PARTY_RESERVATION)?;
        stream.write_frame(payload).await?;
        Ok(stream)
    }

    /// Send `payload` to every peer in `peers` except ourselves
    async fn send_request_to_all(&self, session_id: &str, payload: &[u8], peers: &[PeerId]) {
        let sends = peers.iter().filter(|peer| **peer != self.inner.local).map(|peer| async move {
            if let Err(e) = self.send_message(session_id, *peer, ProtocolId::JoinParty, payload).await {
                debug!(session = session_id, peer = %peer, error = %e, "Failed to send join party request");
            }
        });
        join_all(sends).await;
    }

    /// Ask the leader to include us; `true` once it confirmed
    async fn send_request_to_leader(&self, session_id: &str, leader: PeerId, payload: &[u8]) -> TesseraResult<bool> {
        let stream = self
            .send_message(session_id, leader, ProtocolId::JoinPartyLeader, payload)
            .await?;
        let ack = stream.read_frame(FrameDeadline::Standard).await?;
        if Ack::parse(&ack) != Some(Ack::RequestReceived) {
            return Ok(false);
        }

        let this = self.clone();
        tokio::spawn(async move { this.read_leader_response(stream).await });
        Ok(true)
    }

    async fn read_leader_response(&self, stream: StreamHandle) {
        let remote = stream.remote_peer();
        let payload = match stream.read_frame(FrameDeadline::LeaderResponse).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(peer = %remote, error = %e, "No response from leader");
                return;
            }
        };
        let message = match JoinPartyLeaderComm::decode(&payload) {
            Ok(message) if message.msg_type == LeaderCommType::Response => message,
            Ok(_) => {
                warn!(peer = %remote, "Expected a leader response");
                return;
            }
            Err(e) => {
                warn!(peer = %remote, error = %e, "Failed to decode leader response");
                self.inner.streams.add(UNKNOWN_SESSION, stream).await;
                return;
            }
        };

        self.process_response(&message, remote).await;
        if let Err(e) = stream.write_frame(Ack::CopyDone.as_bytes()).await {
            debug!(peer = %remote, error = %e, "Failed to acknowledge leader response");
        }
    }

    /// Write a decision and wait for the copy acknowledgement
    async fn deliver_response(&self, stream: &StreamHandle, response: &JoinPartyLeaderComm) {
        let remote = stream.remote_peer();
        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode leader response");
                return;
            }
        };
        if let Err(e) = stream.write_frame(&payload).await {
            warn!(peer = %remote, error = %e, "Failed to send leader response");
            return;
        }
        match stream.read_frame(FrameDeadline::Standard).await {
            Ok(ack) if Ack::parse(&ack) == Some(Ack::CopyDone) => {}
            Ok(_) => warn!(peer = %remote, "Peer did not confirm the leader response"),
            Err(e) => debug!(peer = %remote, error = %e, "Failed to read response acknowledgement"),
        }
    }

    /// Announce the decision to requesters, and on timeout to silent peers too
    async fn send_response_to_all(&self, session_id: &str, finalized: &Finalized) {
        let response = JoinPartyLeaderComm::response(session_id, &finalized.decision);
        let stored = join_all(
            finalized
                .streams
                .iter()
                .map(|stream| self.deliver_response(stream, &response)),
        );

        let unreached: &[PeerId] = match finalized.decision.outcome {
            LeaderOutcome::Timeout => &finalized.unreached,
            _ => &[],
        };
        let fresh = join_all(unreached.iter().map(|peer| {
            let response = &response;
            async move {
                match StreamHandle::open(
                    self.inner.transport.as_ref(),
                    *peer,
                    ProtocolId::JoinPartyLeader,
                    &self.inner.stream_config,
                )
                .await
                {
                    Ok(stream) => {
                        self.inner.streams.add(session_id, stream.clone()).await;
                        self.deliver_response(&stream, response).await;
                    }
                    Err(e) => debug!(session = session_id, peer = %peer, error = %e, "Peer unreachable"),
                }
            }
        }));

        tokio::join!(stored, fresh);
    }

    // ------------------------------------------------------------------------
    // Leader-Directed Join
    // ------------------------------------------------------------------------

    /// Form a party through the elected leader
    ///
    /// Returns [`PartyOutcome::RaceLost`] as soon as `cancel` fires.
    #[instrument(skip(self, peers, cancel), fields(peer = %self.inner.local))]
    pub async fn join_party_with_leader(
        &self,
        session_id: &str,
        block_height: u64,
        peers: &[PeerId],
        threshold: usize,
        cancel: &mut RaceListener,
    ) -> TesseraResult<PartyOutcome> {
        let leader = elect_leader(session_id, block_height, peers)?;
        if leader == self.inner.local {
            info!(session = session_id, "Acting as party leader");
            self.join_party_leader(session_id, peers, threshold, cancel).await
        } else {
            info!(session = session_id, %leader, "Joining party through leader");
            self.join_party_member(session_id, leader, threshold, cancel).await
        }
    }

    async fn join_party_leader(
        &self,
        session_id: &str,
        peers: &[PeerId],
        threshold: usize,
        cancel: &mut RaceListener,
    ) -> TesseraResult<PartyOutcome> {
        let local = self.inner.local;
        let registry = &self.inner.registry;
        let session = registry
            .create(session_id, peers, JoinMode::LeaderDirected, threshold)
            .await?;
        session.set_leader(local);

        let deadline = Instant::now() + self.inner.config.join_party_timeout();
        let won = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = wait_for_quorum(&session, deadline) => true,
        };
        if !won {
            registry.remove(session_id).await;
            info!(session = session_id, "Signature received while collecting the party");
            return Ok(PartyOutcome::RaceLost);
        }

        let finalized = session
            .finalize(|online| {
                let mut participants = online.to_vec();
                participants.push(local);
                participants.sort();
                let outcome = if participants.len() < threshold + 1 {
                    LeaderOutcome::Timeout
                } else {
                    LeaderOutcome::Success
                };
                LeaderDecision::new(outcome, participants)
            })
            .await;
        self.send_response_to_all(session_id, &finalized).await;
        registry.remove(session_id).await;

        let participants = finalized.decision.participants;
        match finalized.decision.outcome {
            LeaderOutcome::Success => {
                info!(session = session_id, count = participants.len(), "Party formed");
                Ok(PartyOutcome::Formed {
                    participants,
                    leader: local,
                })
            }
            _ => {
                warn!(session = session_id, online = participants.len(), "Not enough peers joined in time");
                Err(CoordinationError::JoinTimeout { online: participants }.into())
            }
        }
    }

    async fn join_party_member(
        &self,
        session_id: &str,
        leader: PeerId,
        threshold: usize,
        cancel: &mut RaceListener,
    ) -> TesseraResult<PartyOutcome> {
        let session = self
            .inner
            .registry
            .create(session_id, &[leader], JoinMode::LeaderDirected, threshold)
            .await?;
        session.set_leader(leader);

        let wait = self.await_leader_decision(&session, leader, cancel).await;
        let decision = session.decision().cloned();
        self.inner.registry.remove(session_id).await;

        match (wait, decision) {
            (MemberWait::Cancelled, _) => {
                info!(session = session_id, "Signature received while waiting for the leader");
                Ok(PartyOutcome::RaceLost)
            }
            (MemberWait::Decided, Some(decision)) => {
                let participants = decision.participants;
                if decision.outcome != LeaderOutcome::Success {
                    return Err(CoordinationError::JoinTimeout { online: participants }.into());
                }
                if participants.len() < threshold + 1 {
                    return Err(CoordinationError::InsufficientPeers {
                        online: participants,
                        required: threshold + 1,
                    }
                    .into());
                }
                if !participants.contains(&self.inner.local) {
                    info!(session = session_id, "Leader formed the party without us");
                }
                Ok(PartyOutcome::Formed { participants, leader })
            }
            _ => {
                warn!(session = session_id, %leader, "No decision from leader");
                Err(CoordinationError::LeaderUnreachable { leader }.into())
            }
        }
    }

    async fn await_leader_decision(
        &self,
        session: &PeerSession,
        leader: PeerId,
        cancel: &mut RaceListener,
    ) -> MemberWait {
        // Spread member requests so the leader is not hit all at once
        tokio::select! {
            _ = cancel.cancelled() => return MemberWait::Cancelled,
            _ = sleep(self.inner.config.draw_jitter()) => {}
        }

        let config = &self.inner.config;
        let deadline = Instant::now() + config.join_party_timeout() + config.member_grace();
        let requests = self.request_until_acknowledged(session.session_id(), leader);
        tokio::pin!(requests);
        let mut acknowledged = false;

        loop {
            // A decision that already arrived wins over a late cancellation
            tokio::select! {
                biased;
                notified = session.notified() => {
                    return if notified { MemberWait::Decided } else { MemberWait::TimedOut };
                }
                _ = cancel.cancelled() => return MemberWait::Cancelled,
                _ = sleep_until(deadline) => return MemberWait::TimedOut,
                _ = &mut requests, if !acknowledged => acknowledged = true,
            }
        }
    }

    async fn request_until_acknowledged(&self, session_id: &str, leader: PeerId) {
        let payload = match JoinPartyLeaderComm::request(session_id).encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode join request");
                return;
            }
        };
        loop {
            match self.send_request_to_leader(session_id, leader, &payload).await {
                Ok(true) => {
                    debug!(session = session_id, %leader, "Leader accepted join request");
                    return;
                }
                Ok(false) => debug!(session = session_id, %leader, "Leader rejected join request"),
                Err(e) => debug!(session = session_id, %leader, error = %e, "Failed to reach leader"),
            }
            sleep(self.inner.config.leader_retry_interval()).await;
        }
    }

    // ------------------------------------------------------------------------
    // Leaderless Join
    // ------------------------------------------------------------------------

    /// Form a party of every peer in `peers` without a leader
    ///
    /// On success the full peer set is returned in canonical order; otherwise
    /// [`CoordinationError::JoinTimeout`] carries the peers seen online.
    #[instrument(skip(self, peers), fields(peer = %self.inner.local))]
    pub async fn join_party_with_retry(&self, session_id: &str, peers: &[PeerId]) -> TesseraResult<Vec<PeerId>> {
        let payload = JoinPartyRequest::new(session_id).encode()?;
        let expected = canonical_peers(peers);
        let session = self
            .inner
            .registry
            .create(session_id, &expected, JoinMode::Leaderless, 1)
            .await?;
        let deadline = Instant::now() + self.inner.config.join_party_timeout();

        let broadcaster = async {
            loop {
                let (_, offline) = session.peers_status().await;
                self.send_request_to_all(session_id, &payload, &offline).await;
                sleep(self.inner.config.broadcast_interval()).await;
            }
        };
        let waiter = async {
            while !session.all_responded().await {
                match timeout_at(deadline, session.next_new_peer()).await {
                    Ok(Some(peer)) => debug!(session = session_id, %peer, "Peer joined"),
                    _ => return,
                }
            }
        };
        tokio::select! {
            _ = broadcaster => {}
            _ = waiter => {}
        }

        // Peers that answered late may still be waiting on us
        let (online, offline) = session.peers_status().await;
        self.send_request_to_all(session_id, &payload, &online).await;
        self.inner.registry.remove(session_id).await;

        let mut joined = online;
        if expected.contains(&self.inner.local) {
            joined.push(self.inner.local);
        }
        joined.sort();
        if offline.is_empty() {
            info!(session = session_id, count = joined.len(), "All peers joined");
            Ok(joined)
        } else {
            warn!(session = session_id, missing = offline.len(), "Not every peer joined in time");
            Err(CoordinationError::JoinTimeout { online: joined }.into())
        }
    }
}

/// Resolve once the quorum is reached or `deadline` passes
async fn wait_for_quorum(session: &PeerSession, deadline: Instant) {
    if session.threshold() == 0 {
        return;
    }
    let _ = timeout_at(deadline, session.notified()).await;
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}
