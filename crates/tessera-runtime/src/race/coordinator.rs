//! Signature race for one keysign request
//!
//! Two branches run side by side: the waiter listens for a signature shared by
//! another signer, the producer forms a party and signs locally. Whichever
//! finishes first signals the other through a [`RaceChannel`].

use std::sync::Arc;

use tessera_core::{
    canonical_peers, threshold, Blame, BlameManager, BlameReason, KeysignConfig, KeysignRequest,
    KeysignResponse, PeerId, SharedSignature, Signature, SignatureNotifier, SignatureVerifier,
    SigningEngine, SigningError, TesseraError, TesseraResult,
};
use tokio::sync::mpsc;
use tokio::time::timeout_at;
use tracing::{debug, info, instrument, warn};

use crate::coordination::{PartyCoordinator, PartyOutcome};
use crate::race::signal::{RaceChannel, RaceListener, RaceSignal};

/// Lifecycle of one race
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceState {
    Created,
    AwaitingOutcome,
    /// A valid signature from another signer won
    ReceivedExternally,
    /// The local party produced the signature
    ComputedLocally,
    Cancelled,
    TimedOut,
    /// Local computation ended with blame
    Failed,
}

impl RaceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RaceState::Created | RaceState::AwaitingOutcome)
    }
}

/// Terminal state of a race and the response handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceReport {
    pub state: RaceState,
    pub response: KeysignResponse,
}

impl RaceReport {
    fn new(state: RaceState, response: KeysignResponse) -> Self {
        Self { state, response }
    }
}

#[derive(Debug)]
enum Waited {
    Received(Signature),
    FailureNotice,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
enum Produced {
    Signed(Signature),
    RaceLost,
    Failed(Blame),
}

/// Everything one race needs to know about its request
struct RaceContext<'a> {
    request: &'a KeysignRequest,
    session_id: String,
    signers: Vec<PeerId>,
    threshold: usize,
}

// ----------------------------------------------------------------------------
// Signature Race Coordinator
// ----------------------------------------------------------------------------

pub struct SignatureRaceCoordinator {
    coordinator: PartyCoordinator,
    notifier: Arc<dyn SignatureNotifier>,
    engine: Arc<dyn SigningEngine>,
    verifier: Arc<dyn SignatureVerifier>,
    blame: Arc<dyn BlameManager>,
    config: KeysignConfig,
}

impl SignatureRaceCoordinator {
    pub fn new(
        coordinator: PartyCoordinator,
        notifier: Arc<dyn SignatureNotifier>,
        engine: Arc<dyn SigningEngine>,
        verifier: Arc<dyn SignatureVerifier>,
        blame: Arc<dyn BlameManager>,
        config: KeysignConfig,
    ) -> Self {
        Self {
            coordinator,
            notifier,
            engine,
            verifier,
            blame,
            config,
        }
    }

    /// Run the race for `request` until one branch wins
    ///
    /// Malformed requests are returned as errors; every other outcome,
    /// including blame, is a [`RaceReport`].
    #[instrument(skip_all, fields(peer = %self.coordinator.local_peer()))]
    pub async fn run(&self, request: &KeysignRequest) -> TesseraResult<RaceReport> {
        request.validate()?;
        let signers = canonical_peers(&request.signer_peers()?);
        let context = RaceContext {
            request,
            session_id: request.session_id()?,
            threshold: threshold(signers.len())?,
            signers,
        };
        let session_id = context.session_id.as_str();
        debug!(session = session_id, state = ?RaceState::Created, "Race created");

        // Subscribe first so a signature shared during party formation is kept
        let mut notices = self.notifier.subscribe(session_id).await?;
        let race = RaceChannel::new();
        let mut waiter_cancel = race.listen_for(RaceSignal::SignatureGenerated);
        let mut producer_cancel = race.listen_for(RaceSignal::SignatureReceived);
        debug!(session = session_id, state = ?RaceState::AwaitingOutcome, "Race started");

        let (waited, produced) = tokio::join!(
            self.wait_for_signature(&context, &mut notices, &race, &mut waiter_cancel),
            self.produce_signature(&context, &race, &mut producer_cancel),
        );

        self.notifier.unsubscribe(session_id).await;
        self.coordinator.release_streams(session_id).await;

        let report = resolve(waited, produced);
        info!(session = session_id, state = ?report.state, "Race finished");
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Waiter
    // ------------------------------------------------------------------------

    async fn wait_for_signature(
        &self,
        context: &RaceContext<'_>,
        notices: &mut mpsc::Receiver<SharedSignature>,
        race: &RaceChannel,
        cancel: &mut RaceListener,
    ) -> Waited {
        let session_id = context.session_id.as_str();
        let deadline = tokio::time::Instant::now() + self.config.keysign_timeout();
        loop {
            let notice = tokio::select! {
                _ = cancel.cancelled() => return Waited::Cancelled,
                notice = timeout_at(deadline, notices.recv()) => notice,
            };
            let notice = match notice {
                Ok(Some(notice)) => notice,
                Ok(None) => return Waited::Cancelled,
                Err(_) => {
                    debug!(session = session_id, "No signature shared before the keysign timeout");
                    return Waited::TimedOut;
                }
            };
            if notice.message != context.request.message {
                debug!(session = session_id, "Ignoring notice for another message");
                continue;
            }
            let Some(signature) = notice.signature else {
                info!(session = session_id, "Another signer reported failure");
                return Waited::FailureNotice;
            };
            if !self.verifier.verify(context.request, &signature) {
                warn!(session = session_id, "Ignoring invalid shared signature");
                continue;
            }
            info!(session = session_id, "Valid signature received from another signer");
            race.signal(RaceSignal::SignatureReceived);
            return Waited::Received(signature);
        }
    }

    // ------------------------------------------------------------------------
    // Producer
    // ------------------------------------------------------------------------

    async fn produce_signature(
        &self,
        context: &RaceContext<'_>,
        race: &RaceChannel,
        cancel: &mut RaceListener,
    ) -> Produced {
        let session_id = context.session_id.as_str();
        let local = self.coordinator.local_peer();
        let joined = self
            .coordinator
            .join_party_with_leader(
                session_id,
                context.request.block_height,
                &context.signers,
                context.threshold,
                cancel,
            )
            .await;

        let participants = match joined {
            Ok(PartyOutcome::RaceLost) => return Produced::RaceLost,
            Ok(PartyOutcome::Formed { participants, .. }) if !participants.contains(&local) => {
                info!(session = session_id, "Not selected for this signing party");
                return Produced::RaceLost;
            }
            Ok(PartyOutcome::Formed { participants, .. }) => participants,
            Err(e) => {
                let blame = match e.online_peers() {
                    Some(online) => self.blame.node_sync_blame(&context.signers, online),
                    None => Blame::new(BlameReason::InternalError, Vec::new()),
                };
                warn!(session = session_id, error = %e, "Failed to form signing party");
                return self.fail(context, race, blame).await;
            }
        };

        match self.engine.sign(session_id, context.request, &participants).await {
            Ok(signature) => {
                race.signal(RaceSignal::SignatureGenerated);
                let notice = SharedSignature::signed(context.request.message.clone(), signature.clone());
                if let Err(e) = self.notifier.publish(session_id, &context.signers, notice).await {
                    warn!(session = session_id, error = %e, "Failed to share signature");
                }
                Produced::Signed(signature)
            }
            Err(TesseraError::Signing(SigningError::Blamed { blame })) => {
                warn!(session = session_id, blamed = blame.blame_nodes.len(), "Signing failed with blame");
                self.fail(context, race, blame).await
            }
            Err(e) => {
                warn!(session = session_id, error = %e, "Signing engine failed");
                self.fail(context, race, Blame::new(BlameReason::SigningFailure, Vec::new()))
                    .await
            }
        }
    }

    async fn fail(&self, context: &RaceContext<'_>, race: &RaceChannel, blame: Blame) -> Produced {
        let session_id = context.session_id.as_str();
        if let Err(e) = self
            .notifier
            .publish_failure(session_id, &context.signers, &context.request.message)
            .await
        {
            warn!(session = session_id, error = %e, "Failed to share signing failure");
        }
        race.signal(RaceSignal::SignatureGenerated);
        Produced::Failed(blame)
    }
}

/// Combine both branches into the caller's outcome
fn resolve(waited: Waited, produced: Produced) -> RaceReport {
    match (waited, produced) {
        (_, Produced::Signed(signature)) => {
            RaceReport::new(RaceState::ComputedLocally, KeysignResponse::success(signature))
        }
        (Waited::Received(signature), _) => {
            RaceReport::new(RaceState::ReceivedExternally, KeysignResponse::success(signature))
        }
        (_, Produced::Failed(blame)) => RaceReport::new(RaceState::Failed, KeysignResponse::failure(blame)),
        (Waited::TimedOut, Produced::RaceLost) => RaceReport::new(
            RaceState::TimedOut,
            KeysignResponse::failure(Blame::new(BlameReason::InternalError, Vec::new())),
        ),
        (Waited::FailureNotice, Produced::RaceLost) => RaceReport::new(
            RaceState::Failed,
            KeysignResponse::failure(Blame::new(BlameReason::SigningFailure, Vec::new())),
        ),
        (Waited::Cancelled, Produced::RaceLost) => RaceReport::new(
            RaceState::Cancelled,
            KeysignResponse::failure(Blame::new(BlameReason::InternalError, Vec::new())),
        ),
    }
}
