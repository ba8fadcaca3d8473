//! Shared setup for multi-node runtime tests

#![allow(dead_code)]

use std::sync::Arc;

use tessera_core::{PeerId, TesseraConfig};
use tessera_harness::{
    test_peer_id, DigestVerifier, MemoryNetwork, MockKeygenEngine, MockSigningEngine, SyncBlameManager,
};
use tessera_runtime::{PartyCoordinator, TssNode, TssNodeBuilder};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn peers(ids: &[u8]) -> Vec<PeerId> {
    ids.iter().copied().map(test_peer_id).collect()
}

/// Started coordinators, one per id
pub async fn start_coordinators(network: &MemoryNetwork, ids: &[u8]) -> Vec<PartyCoordinator> {
    let config = TesseraConfig::testing();
    let mut coordinators = Vec::new();
    for id in ids {
        let transport = network.join(test_peer_id(*id)).await;
        let coordinator = PartyCoordinator::new(Arc::new(transport), &config);
        coordinator.start().await.expect("Failed to start coordinator");
        coordinators.push(coordinator);
    }
    coordinators
}

pub struct TestNode {
    pub node: TssNode,
    pub signing: Arc<MockSigningEngine>,
    pub keygen: Arc<MockKeygenEngine>,
}

/// Started nodes with deterministic engines, one per id
pub async fn start_nodes(network: &MemoryNetwork, ids: &[u8]) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for id in ids {
        let transport = network.join(test_peer_id(*id)).await;
        let signing = Arc::new(MockSigningEngine::new());
        let keygen = Arc::new(MockKeygenEngine::new());
        let node = TssNodeBuilder::new(Arc::new(transport))
            .with_config(TesseraConfig::testing())
            .with_signing_engine(signing.clone())
            .with_keygen_engine(keygen.clone())
            .with_verifier(Arc::new(DigestVerifier))
            .with_blame_manager(Arc::new(SyncBlameManager))
            .build()
            .expect("Failed to build node");
        node.start().await.expect("Failed to start node");
        nodes.push(TestNode { node, signing, keygen });
    }
    nodes
}

pub async fn release_all(coordinators: &[PartyCoordinator], session_id: &str) {
    for coordinator in coordinators {
        coordinator.release_streams(session_id).await;
    }
}
