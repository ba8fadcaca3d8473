//! Top-level threshold signing service
//!
//! A [`TssNode`] owns the party coordinator, the message router and the
//! signature race for one peer, and exposes keysign and keygen to callers.

use std::sync::Arc;

use tessera_core::{
    Blame, BlameManager, BlameReason, KeygenEngine, KeygenRequest, KeygenResponse, KeysignRequest,
    KeysignResponse, PeerId, SigningError, TesseraError, TesseraResult,
};
use tracing::{info, instrument, warn};

use crate::coordination::PartyCoordinator;
use crate::messenger::MessageRouter;
use crate::race::{RaceReport, SignatureRaceCoordinator};

// ----------------------------------------------------------------------------
// Tss Node
// ----------------------------------------------------------------------------

/// One signer of a threshold pool
pub struct TssNode {
    local: PeerId,
    coordinator: PartyCoordinator,
    router: MessageRouter,
    race: SignatureRaceCoordinator,
    keygen: Arc<dyn KeygenEngine>,
    blame: Arc<dyn BlameManager>,
}

impl std::fmt::Debug for TssNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TssNode").field("local", &self.local).finish()
    }
}

impl TssNode {
    pub(crate) fn new(
        coordinator: PartyCoordinator,
        router: MessageRouter,
        race: SignatureRaceCoordinator,
        keygen: Arc<dyn KeygenEngine>,
        blame: Arc<dyn BlameManager>,
    ) -> Self {
        Self {
            local: coordinator.local_peer(),
            coordinator,
            router,
            race,
            keygen,
            blame,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    pub fn coordinator(&self) -> &PartyCoordinator {
        &self.coordinator
    }

    /// Router carrying signing and keygen messages, for engines that need it
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Register the inbound stream handlers
    pub async fn start(&self) -> TesseraResult<()> {
        self.coordinator.start().await?;
        if let Err(e) = self.router.start().await {
            self.coordinator.stop().await;
            return Err(e);
        }
        info!(peer = %self.local, "Tss node started");
        Ok(())
    }

    /// Unregister the handlers and wait for background tasks
    pub async fn stop(&self) {
        self.router.stop().await;
        self.coordinator.stop().await;
        info!(peer = %self.local, "Tss node stopped");
    }

    /// Sign `request`, or adopt a signature another signer produced first
    pub async fn keysign(&self, request: &KeysignRequest) -> TesseraResult<KeysignResponse> {
        Ok(self.keysign_report(request).await?.response)
    }

    /// Like [`TssNode::keysign`], also reporting how the race ended
    #[instrument(skip_all, fields(peer = %self.local))]
    pub async fn keysign_report(&self, request: &KeysignRequest) -> TesseraResult<RaceReport> {
        request.validate()?;
        let session_id = request.session_id()?;
        let report = self.race.run(request).await;
        self.release_session(&session_id).await;
        report
    }

    /// Generate a pool key with every peer in the request
    #[instrument(skip_all, fields(peer = %self.local))]
    pub async fn keygen(&self, request: &KeygenRequest) -> TesseraResult<KeygenResponse> {
        let peers = request.party_peers()?;
        if peers.is_empty() {
            return Err(TesseraError::invalid_request("Key list is empty"));
        }
        let session_id = request.session_id()?;

        let response = match self.coordinator.join_party_with_retry(&session_id, &peers).await {
            Ok(online) => self.generate(&session_id, request, &online).await,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Failed to form keygen party");
                let blame = match e.online_peers() {
                    Some(online) => self.blame.node_sync_blame(&peers, online),
                    None => Blame::new(BlameReason::InternalError, Vec::new()),
                };
                KeygenResponse::failure(blame)
            }
        };

        self.release_session(&session_id).await;
        Ok(response)
    }

    async fn generate(&self, session_id: &str, request: &KeygenRequest, participants: &[PeerId]) -> KeygenResponse {
        match self.keygen.generate(session_id, request, participants).await {
            Ok(response) => {
                info!(session = session_id, pub_key = %response.pub_key, "Key generated");
                response
            }
            Err(TesseraError::Signing(SigningError::Blamed { blame })) => KeygenResponse::failure(blame),
            Err(e) => {
                warn!(session = session_id, error = %e, "Keygen engine failed");
                KeygenResponse::failure(Blame::new(BlameReason::KeygenFailure, Vec::new()))
            }
        }
    }

    async fn release_session(&self, session_id: &str) {
        self.router.release_streams(session_id).await;
        self.coordinator.release_streams(session_id).await;
    }
}
