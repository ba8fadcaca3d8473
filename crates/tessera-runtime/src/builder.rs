//! Node Builder API
//!
//! Wires a transport, configuration and the cryptographic collaborators into
//! a [`TssNode`].

use std::sync::Arc;

use tessera_core::{
    BlameManager, KeygenEngine, SignatureNotifier, SignatureVerifier, SigningEngine, TesseraConfig,
    TesseraError, TesseraResult, Transport,
};
use tracing::debug;

use crate::coordination::PartyCoordinator;
use crate::messenger::MessageRouter;
use crate::node::TssNode;
use crate::notifier::BroadcastSignatureNotifier;
use crate::race::SignatureRaceCoordinator;

// ----------------------------------------------------------------------------
// Node Builder
// ----------------------------------------------------------------------------

/// Builder for a [`TssNode`]
pub struct TssNodeBuilder {
    transport: Arc<dyn Transport>,
    config: TesseraConfig,
    signing: Option<Arc<dyn SigningEngine>>,
    keygen: Option<Arc<dyn KeygenEngine>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    blame: Option<Arc<dyn BlameManager>>,
    notifier: Option<Arc<dyn SignatureNotifier>>,
}

impl TssNodeBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: TesseraConfig::default(),
            signing: None,
            keygen: None,
            verifier: None,
            blame: None,
            notifier: None,
        }
    }

    pub fn with_config(mut self, config: TesseraConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_signing_engine(mut self, engine: Arc<dyn SigningEngine>) -> Self {
        self.signing = Some(engine);
        self
    }

    pub fn with_keygen_engine(mut self, engine: Arc<dyn KeygenEngine>) -> Self {
        self.keygen = Some(engine);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_blame_manager(mut self, blame: Arc<dyn BlameManager>) -> Self {
        self.blame = Some(blame);
        self
    }

    /// Replace the router-backed signature notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn SignatureNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate the configuration and assemble the node
    pub fn build(self) -> TesseraResult<TssNode> {
        self.config.validate()?;
        let signing = self.signing.ok_or_else(|| missing("signing engine"))?;
        let keygen = self.keygen.ok_or_else(|| missing("keygen engine"))?;
        let verifier = self.verifier.ok_or_else(|| missing("signature verifier"))?;
        let blame = self.blame.ok_or_else(|| missing("blame manager"))?;

        let coordinator = PartyCoordinator::new(self.transport.clone(), &self.config);
        let router = MessageRouter::new(self.transport, &self.config);
        let notifier: Arc<dyn SignatureNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(BroadcastSignatureNotifier::new(
                router.clone(),
                self.config.keysign.subscription_buffer,
            )),
        };
        let race = SignatureRaceCoordinator::new(
            coordinator.clone(),
            notifier,
            signing,
            verifier,
            blame.clone(),
            self.config.keysign.clone(),
        );

        debug!(peer = %coordinator.local_peer(), "Tss node assembled");
        Ok(TssNode::new(coordinator, router, race, keygen, blame))
    }
}

fn missing(component: &str) -> TesseraError {
    TesseraError::config_error(format!("No {} configured", component))
}
