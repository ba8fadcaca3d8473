//! End-to-end keysign and keygen across in-memory nodes

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, peers, start_nodes};
use common::TestNode;
use tessera_core::{
    protocol::{read_frame, write_frame},
    Ack, BlameReason, JoinPartyLeaderComm, KeygenRequest, KeysignRequest, LeaderDecision, LeaderOutcome,
    ProtocolId, SharedSignature, Signature, SignatureNotifier, Status, TesseraConfig, Transport,
};
use tessera_harness::{expected_signature, test_peer_id, MemoryNetwork};
use tessera_runtime::{elect_leader, BroadcastSignatureNotifier, MessageRouter, RaceState};
use tokio::time::timeout;

fn keysign_request(ids: &[u8]) -> KeysignRequest {
    let signers = peers(ids).iter().map(ToString::to_string).collect();
    KeysignRequest::new("pool-key", b"transfer 10 coins", signers, 7)
}

/// Request whose elected leader is one of `running`
fn request_led_by(ids: &[u8], running: &[u8]) -> KeysignRequest {
    (0..)
        .map(|height| {
            let mut request = keysign_request(ids);
            request.block_height = height;
            request
        })
        .find(|request| {
            let session_id = request.session_id().unwrap();
            let leader = elect_leader(&session_id, request.block_height, &peers(ids)).unwrap();
            running.iter().any(|id| test_peer_id(*id) == leader)
        })
        .expect("Some height elects a running leader")
}

#[tokio::test]
async fn test_keysign_across_all_signers() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3, 4];
    let nodes = start_nodes(&network, &ids).await;
    let request = keysign_request(&ids);

    let reports = timeout(
        Duration::from_secs(10),
        futures::future::join_all(nodes.iter().map(|n| n.node.keysign_report(&request))),
    )
    .await
    .expect("Keysign finished");

    let mut computed = 0;
    for report in reports {
        let report = report.expect("Valid request");
        assert_eq!(report.response.status, Status::Success);
        assert_eq!(report.response.signature, Some(expected_signature(&request)));
        match report.state {
            RaceState::ComputedLocally => computed += 1,
            RaceState::ReceivedExternally => {}
            other => panic!("Unexpected race state {:?}", other),
        }
    }
    // threshold(4) = 2, so the leader and two members sign
    assert_eq!(computed, 3);
    let calls: usize = nodes.iter().map(|n| n.signing.calls()).sum();
    assert_eq!(calls, 3);
    for n in &nodes {
        for party in n.signing.parties() {
            assert_eq!(party.len(), 3);
        }
        assert!(n.node.coordinator().registry().is_empty().await);
        n.node.stop().await;
    }
}

#[tokio::test]
async fn test_keysign_adopts_signature_shared_first() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3];
    let nodes = start_nodes(&network, &[1]).await;
    let node = &nodes[0].node;
    let request = keysign_request(&ids);
    let session_id = request.session_id().unwrap();

    // Another signer finished first and shares its result
    let router = MessageRouter::new(
        Arc::new(network.join(test_peer_id(2)).await),
        &TesseraConfig::testing(),
    );
    let notifier = BroadcastSignatureNotifier::new(router.clone(), 4);
    let publisher = {
        let request = request.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let forged = Signature {
                r: "00".to_string(),
                s: "00".to_string(),
            };
            notifier
                .publish(&session_id, &[test_peer_id(1)], SharedSignature::signed(request.message.clone(), forged))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            notifier
                .publish(
                    &session_id,
                    &[test_peer_id(1)],
                    SharedSignature::signed(request.message.clone(), expected_signature(&request)),
                )
                .await
                .unwrap();
        })
    };

    let report = timeout(Duration::from_secs(2), node.keysign_report(&request))
        .await
        .expect("Keysign stopped once the signature arrived")
        .expect("Valid request");
    publisher.await.unwrap();

    assert_eq!(report.state, RaceState::ReceivedExternally);
    assert_eq!(report.response.signature, Some(expected_signature(&request)));
    assert_eq!(nodes[0].signing.calls(), 0);
    assert!(node.coordinator().registry().is_empty().await);
    router.release_streams(&session_id).await;
}

#[tokio::test]
async fn test_keysign_rejects_malformed_request() {
    init_tracing();
    let network = MemoryNetwork::default();
    let nodes = start_nodes(&network, &[1]).await;

    let mut request = keysign_request(&[1, 2, 3]);
    request.message = "not base64!".to_string();
    assert!(nodes[0].node.keysign(&request).await.is_err());

    let lonely = keysign_request(&[]);
    assert!(nodes[0].node.keysign(&lonely).await.is_err());
}

#[tokio::test]
async fn test_keysign_blames_missing_signers() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3, 4];
    let nodes = start_nodes(&network, &[1, 2]).await;
    network.set_offline(test_peer_id(3)).await;
    network.set_offline(test_peer_id(4)).await;
    let request = request_led_by(&ids, &[1, 2]);

    let responses = timeout(
        Duration::from_secs(10),
        futures::future::join_all(nodes.iter().map(|n| n.node.keysign(&request))),
    )
    .await
    .expect("Keysign finished");

    for response in responses {
        let response = response.expect("Valid request");
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, Some(BlameReason::NodeSyncFailure));
        assert_eq!(response.blame.blame_nodes, peers(&[3, 4]));
    }
}

#[tokio::test]
async fn test_keygen_with_every_party() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3];
    let nodes = start_nodes(&network, &ids).await;
    let keys = peers(&ids).iter().map(ToString::to_string).collect();
    let request = KeygenRequest::new(keys, 9);

    let responses = timeout(
        Duration::from_secs(5),
        futures::future::join_all(nodes.iter().map(|n| n.node.keygen(&request))),
    )
    .await
    .expect("Keygen finished");

    let first = responses[0].as_ref().expect("Valid request").clone();
    assert_eq!(first.status, Status::Success);
    for response in responses {
        assert_eq!(response.expect("Valid request"), first);
    }
    for n in &nodes {
        assert_eq!(n.keygen.calls(), 1);
    }
}

#[tokio::test]
async fn test_keygen_blames_offline_party() {
    init_tracing();
    let network = MemoryNetwork::default();
    let nodes = start_nodes(&network, &[1, 2]).await;
    network.set_offline(test_peer_id(3)).await;
    let keys = peers(&[1, 2, 3]).iter().map(ToString::to_string).collect();
    let request = KeygenRequest::new(keys, 9);

    let responses = futures::future::join_all(nodes.iter().map(|n| n.node.keygen(&request))).await;
    for response in responses {
        let response = response.expect("Valid request");
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.blame_nodes, vec![test_peer_id(3)]);
    }
    for n in &nodes {
        assert_eq!(n.keygen.calls(), 0);
    }
}

async fn parked_streams(nodes: &[TestNode]) -> usize {
    let mut parked = 0;
    for n in nodes {
        parked += n.node.coordinator().stream_manager().len().await;
        parked += n.node.router().stream_manager().len().await;
    }
    parked
}

#[tokio::test]
async fn test_no_streams_left_after_keysign_and_keygen() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3, 4];
    let nodes = start_nodes(&network, &ids).await;

    let request = keysign_request(&ids);
    let reports = timeout(
        Duration::from_secs(10),
        futures::future::join_all(nodes.iter().map(|n| n.node.keysign_report(&request))),
    )
    .await
    .expect("Keysign finished");
    assert!(reports.iter().all(Result::is_ok));

    let keys = peers(&ids).iter().map(ToString::to_string).collect();
    let keygen = KeygenRequest::new(keys, 9);
    let responses = timeout(
        Duration::from_secs(5),
        futures::future::join_all(nodes.iter().map(|n| n.node.keygen(&keygen))),
    )
    .await
    .expect("Keygen finished");
    assert!(responses.iter().all(Result::is_ok));

    // Late signature shares and final join requests are closed on arrival
    timeout(Duration::from_secs(3), async {
        while parked_streams(&nodes).await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Every stream was closed");
    for n in &nodes {
        n.node.stop().await;
    }
}

#[tokio::test]
async fn test_signer_left_out_of_party_adopts_shared_signature() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3];
    let nodes = start_nodes(&network, &[1]).await;
    let request = request_led_by(&ids, &[2]);
    let session_id = request.session_id().unwrap();

    // Peer 2 leads the party by hand and signs without peer 1
    let leader = Arc::new(network.join(test_peer_id(2)).await);
    let mut inbound = leader.listen(ProtocolId::JoinPartyLeader).await.expect("Listening");
    let router = MessageRouter::new(leader.clone(), &TesseraConfig::testing());
    let notifier = BroadcastSignatureNotifier::new(router.clone(), 4);
    let party_leader = {
        let request = request.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let mut stream = inbound.recv().await.expect("Member asked to join");
            read_frame(&mut *stream).await.expect("Request frame");
            write_frame(&mut *stream, Ack::RequestReceived.as_bytes()).await.unwrap();
            let decision = LeaderDecision::new(LeaderOutcome::Success, peers(&[2, 3]));
            let payload = JoinPartyLeaderComm::response(session_id.as_str(), &decision)
                .encode()
                .unwrap();
            write_frame(&mut *stream, &payload).await.unwrap();
            let ack = read_frame(&mut *stream).await.expect("Copy acknowledged");
            assert_eq!(Ack::parse(&ack), Some(Ack::CopyDone));

            tokio::time::sleep(Duration::from_millis(100)).await;
            notifier
                .publish(
                    &session_id,
                    &[test_peer_id(1)],
                    SharedSignature::signed(request.message.clone(), expected_signature(&request)),
                )
                .await
                .unwrap();
        })
    };

    let report = timeout(Duration::from_secs(3), nodes[0].node.keysign_report(&request))
        .await
        .expect("Keysign finished")
        .expect("Valid request");
    party_leader.await.unwrap();

    assert_eq!(report.state, RaceState::ReceivedExternally);
    assert_eq!(report.response.status, Status::Success);
    assert_eq!(report.response.signature, Some(expected_signature(&request)));
    assert_eq!(nodes[0].signing.calls(), 0);
    router.release_streams(&session_id).await;
}
