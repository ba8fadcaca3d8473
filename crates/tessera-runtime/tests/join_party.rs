//! Multi-node join-party tests over the in-memory network

mod common;

use std::time::Duration;

use common::{init_tracing, peers, release_all, start_coordinators};
use tessera_core::{
    protocol::{read_frame, write_frame},
    Ack, CoordinationError, JoinPartyLeaderComm, LeaderCommType, LeaderDecision, LeaderOutcome, PeerId,
    ProtocolId, TesseraError, Transport, TransportStream, UNKNOWN_SESSION,
};
use tessera_harness::{test_peer_id, MemoryNetwork};
use tessera_runtime::{elect_leader, PartyCoordinator, PartyOutcome, RaceChannel, RaceListener, RaceSignal};
use tokio::sync::mpsc;
use tokio::time::timeout;

const HEIGHT: u64 = 42;

/// Session id for which `ids[0]` is the elected leader
fn session_led_by(ids: &[u8]) -> String {
    let peer_set = peers(ids);
    (0..)
        .map(|i| format!("session-{}", i))
        .find(|session| elect_leader(session, HEIGHT, &peer_set).ok() == Some(test_peer_id(ids[0])))
        .expect("Some session elects the wanted leader")
}

fn coordinator_of(coordinators: &[PartyCoordinator], peer: PeerId) -> PartyCoordinator {
    coordinators
        .iter()
        .find(|c| c.local_peer() == peer)
        .cloned()
        .expect("Coordinator for peer")
}

async fn join_with_leader(
    coordinator: PartyCoordinator,
    session_id: String,
    peer_set: Vec<PeerId>,
    threshold: usize,
) -> tessera_core::TesseraResult<PartyOutcome> {
    let mut cancel = RaceListener::detached();
    coordinator
        .join_party_with_leader(&session_id, HEIGHT, &peer_set, threshold, &mut cancel)
        .await
}

/// Next join request reaching a hand-driven leader
async fn next_join_request(inbound: &mut mpsc::Receiver<Box<dyn TransportStream>>) -> Box<dyn TransportStream> {
    let mut stream = timeout(Duration::from_secs(2), inbound.recv())
        .await
        .expect("Member asked to join")
        .expect("Listener open");
    let payload = read_frame(&mut *stream).await.expect("Request frame");
    let message = JoinPartyLeaderComm::decode(&payload).expect("Request decodes");
    assert_eq!(message.msg_type, LeaderCommType::Request);
    stream
}

async fn send_decision(stream: &mut Box<dyn TransportStream>, session_id: &str, decision: &LeaderDecision) {
    let payload = JoinPartyLeaderComm::response(session_id, decision)
        .encode()
        .expect("Response encodes");
    write_frame(&mut **stream, &payload).await.expect("Response written");
    let ack = read_frame(&mut **stream).await.expect("Copy acknowledged");
    assert_eq!(Ack::parse(&ack), Some(Ack::CopyDone));
}

#[tokio::test]
async fn test_leaderless_join_with_all_peers() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3, 4];
    let coordinators = start_coordinators(&network, &ids).await;
    let peer_set = peers(&ids);

    let joins = coordinators.iter().cloned().map(|coordinator| {
        let peer_set = peer_set.clone();
        tokio::spawn(async move { coordinator.join_party_with_retry("keygen", &peer_set).await })
    });
    let results = timeout(Duration::from_secs(5), futures::future::join_all(joins))
        .await
        .expect("Leaderless join finished before the deadline");

    for result in results {
        let online = result.unwrap().expect("Every peer joined");
        assert_eq!(online, peer_set);
    }
    for coordinator in &coordinators {
        assert!(coordinator.registry().is_empty().await);
    }
    release_all(&coordinators, "keygen").await;
}

#[tokio::test]
async fn test_leaderless_join_reports_partial_set() {
    init_tracing();
    let network = MemoryNetwork::default();
    let coordinators = start_coordinators(&network, &[1, 2]).await;
    let peer_set = peers(&[1, 2, 3]);
    network.set_offline(test_peer_id(3)).await;

    let joins = coordinators.iter().cloned().map(|coordinator| {
        let peer_set = peer_set.clone();
        tokio::spawn(async move { coordinator.join_party_with_retry("keygen", &peer_set).await })
    });
    for result in futures::future::join_all(joins).await {
        match result.unwrap() {
            Err(TesseraError::Coordination(CoordinationError::JoinTimeout { online })) => {
                assert_eq!(online, peers(&[1, 2]));
            }
            other => panic!("Expected a join timeout, got {:?}", other),
        }
    }
    release_all(&coordinators, "keygen").await;
}

#[tokio::test]
async fn test_leader_forms_party_with_quorum() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3, 4];
    let session_id = session_led_by(&ids);
    let peer_set = peers(&ids);
    let coordinators = start_coordinators(&network, &[1, 2, 3]).await;
    network.set_offline(test_peer_id(4)).await;

    let joins = [1, 2, 3].map(|id| {
        let coordinator = coordinator_of(&coordinators, test_peer_id(id));
        tokio::spawn(join_with_leader(coordinator, session_id.clone(), peer_set.clone(), 2))
    });
    let results = timeout(Duration::from_secs(5), futures::future::join_all(joins))
        .await
        .expect("Party formed before the deadline");

    let expected = PartyOutcome::Formed {
        participants: peers(&[1, 2, 3]),
        leader: test_peer_id(1),
    };
    for result in results {
        assert_eq!(result.unwrap().expect("Party formed"), expected);
    }

    release_all(&coordinators, &session_id).await;
    for id in [1, 2, 3] {
        assert_eq!(network.memory_in_use(test_peer_id(id)).await, 0);
    }
    assert_eq!(network.stats().redundant_closes(), 0);
}

#[tokio::test]
async fn test_leader_timeout_reaches_every_member() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3, 4];
    let session_id = session_led_by(&ids);
    let peer_set = peers(&ids);
    let coordinators = start_coordinators(&network, &[1, 2]).await;
    network.set_offline(test_peer_id(3)).await;
    network.set_offline(test_peer_id(4)).await;

    let joins = [1, 2].map(|id| {
        let coordinator = coordinator_of(&coordinators, test_peer_id(id));
        tokio::spawn(join_with_leader(coordinator, session_id.clone(), peer_set.clone(), 2))
    });
    for result in futures::future::join_all(joins).await {
        match result.unwrap() {
            Err(TesseraError::Coordination(CoordinationError::JoinTimeout { online })) => {
                assert_eq!(online, peers(&[1, 2]));
            }
            other => panic!("Expected a join timeout, got {:?}", other),
        }
    }
    release_all(&coordinators, &session_id).await;
}

#[tokio::test]
async fn test_member_returns_race_lost_when_signature_arrives() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3];
    let session_id = session_led_by(&ids);
    // Only a member runs, so the leader never answers
    let coordinators = start_coordinators(&network, &[2]).await;
    let member = coordinators[0].clone();

    let race = RaceChannel::new();
    let mut cancel = race.listen_for(RaceSignal::SignatureReceived);
    let peer_set = peers(&ids);
    let join = {
        let member = member.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            member
                .join_party_with_leader(&session_id, HEIGHT, &peer_set, 1, &mut cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(150)).await;
    race.signal(RaceSignal::SignatureReceived);

    let outcome = timeout(Duration::from_millis(500), join)
        .await
        .expect("Member stopped promptly")
        .unwrap()
        .expect("Race loss is not an error");
    assert_eq!(outcome, PartyOutcome::RaceLost);
    assert!(member.registry().is_empty().await);
    member.release_streams(&session_id).await;
}

#[tokio::test]
async fn test_leader_returns_race_lost_when_signature_arrives() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3];
    let session_id = session_led_by(&ids);
    let coordinators = start_coordinators(&network, &[1]).await;
    let leader = coordinators[0].clone();

    let race = RaceChannel::new();
    let mut cancel = race.listen_for(RaceSignal::SignatureReceived);
    let peer_set = peers(&ids);
    let join = {
        let leader = leader.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            leader
                .join_party_with_leader(&session_id, HEIGHT, &peer_set, 2, &mut cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    race.signal(RaceSignal::SignatureReceived);
    let outcome = timeout(Duration::from_millis(500), join)
        .await
        .expect("Leader stopped promptly")
        .unwrap()
        .expect("Race loss is not an error");
    assert_eq!(outcome, PartyOutcome::RaceLost);
    assert!(leader.registry().is_empty().await);
}

#[tokio::test]
async fn test_malformed_request_parked_under_unknown() {
    init_tracing();
    let network = MemoryNetwork::default();
    let coordinators = start_coordinators(&network, &[2]).await;
    let receiver = coordinators[0].clone();
    let sender = network.join(test_peer_id(1)).await;

    let mut stream = sender
        .open_stream(test_peer_id(2), ProtocolId::JoinParty)
        .await
        .expect("Stream opened");
    write_frame(&mut *stream, b"definitely not bincode")
        .await
        .expect("Frame written");

    timeout(Duration::from_secs(2), async {
        while receiver.stream_manager().pending(UNKNOWN_SESSION).await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Malformed stream parked");
    assert!(receiver.registry().is_empty().await);

    let closed_before = network.stats().closed();
    receiver.release_streams("any-session").await;
    assert_eq!(receiver.stream_manager().pending(UNKNOWN_SESSION).await, 0);
    assert_eq!(network.stats().closed(), closed_before + 1);

    // A second release finds nothing to close
    receiver.release_streams("any-session").await;
    assert_eq!(network.stats().closed(), closed_before + 1);
    assert_eq!(network.stats().redundant_closes(), 0);
}

#[tokio::test]
async fn test_stop_unregisters_handlers() {
    init_tracing();
    let network = MemoryNetwork::default();
    let coordinators = start_coordinators(&network, &[2]).await;
    let sender = network.join(test_peer_id(1)).await;

    timeout(Duration::from_secs(1), coordinators[0].stop())
        .await
        .expect("Coordinator stopped");
    assert!(sender
        .open_stream(test_peer_id(2), ProtocolId::JoinPartyLeader)
        .await
        .is_err());
}

#[tokio::test]
async fn test_member_accepts_decision_on_fresh_stream() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3];
    let session_id = session_led_by(&ids);
    let coordinators = start_coordinators(&network, &[2]).await;
    let member = coordinators[0].clone();
    let leader = network.join(test_peer_id(1)).await;
    let mut inbound = leader.listen(ProtocolId::JoinPartyLeader).await.expect("Listening");

    let join = tokio::spawn(join_with_leader(member.clone(), session_id.clone(), peers(&ids), 1));

    // Turn the request away so the member never attaches a stream
    let mut request = next_join_request(&mut inbound).await;
    write_frame(&mut *request, Ack::InvalidRequest.as_bytes())
        .await
        .expect("Ack written");

    let decision = LeaderDecision::new(LeaderOutcome::Timeout, peers(&[1, 3]));
    let mut fresh = leader
        .open_stream(test_peer_id(2), ProtocolId::JoinPartyLeader)
        .await
        .expect("Stream opened");
    send_decision(&mut fresh, &session_id, &decision).await;

    match timeout(Duration::from_secs(1), join)
        .await
        .expect("Member took the decision")
        .unwrap()
    {
        Err(TesseraError::Coordination(CoordinationError::JoinTimeout { online })) => {
            assert_eq!(online, peers(&[1, 3]));
        }
        other => panic!("Expected a join timeout, got {:?}", other),
    }
    assert!(member.registry().is_empty().await);
    member.release_streams(&session_id).await;
    assert!(member.stream_manager().is_empty().await);
}

#[tokio::test]
async fn test_member_left_out_of_party_sees_formed_party() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3];
    let session_id = session_led_by(&ids);
    let coordinators = start_coordinators(&network, &[2]).await;
    let member = coordinators[0].clone();
    let leader = network.join(test_peer_id(1)).await;
    let mut inbound = leader.listen(ProtocolId::JoinPartyLeader).await.expect("Listening");

    let join = tokio::spawn(join_with_leader(member.clone(), session_id.clone(), peers(&ids), 1));

    let mut request = next_join_request(&mut inbound).await;
    write_frame(&mut *request, Ack::RequestReceived.as_bytes())
        .await
        .expect("Ack written");
    let decision = LeaderDecision::new(LeaderOutcome::Success, peers(&[1, 3]));
    send_decision(&mut request, &session_id, &decision).await;

    let outcome = timeout(Duration::from_secs(1), join)
        .await
        .expect("Member took the decision")
        .unwrap()
        .expect("Being left out is not an error");
    assert_eq!(
        outcome,
        PartyOutcome::Formed {
            participants: peers(&[1, 3]),
            leader: test_peer_id(1),
        }
    );
    member.release_streams(&session_id).await;
}

#[tokio::test]
async fn test_leader_rejects_request_from_outsider() {
    init_tracing();
    let network = MemoryNetwork::default();
    let ids = [1, 2, 3];
    let session_id = session_led_by(&ids);
    let coordinators = start_coordinators(&network, &[1]).await;
    let leader = coordinators[0].clone();
    network.set_offline(test_peer_id(2)).await;
    network.set_offline(test_peer_id(3)).await;

    let join = tokio::spawn(join_with_leader(leader.clone(), session_id.clone(), peers(&ids), 2));
    let session = timeout(Duration::from_secs(1), async {
        loop {
            if let Some(session) = leader.registry().get(&session_id).await {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Leader opened the session");

    let outsider = network.join(test_peer_id(9)).await;
    let mut stream = outsider
        .open_stream(test_peer_id(1), ProtocolId::JoinPartyLeader)
        .await
        .expect("Stream opened");
    let payload = JoinPartyLeaderComm::request(session_id.as_str())
        .encode()
        .expect("Request encodes");
    write_frame(&mut *stream, &payload).await.expect("Request written");
    let ack = read_frame(&mut *stream).await.expect("Ack read");
    assert_eq!(Ack::parse(&ack), Some(Ack::InvalidRequest));

    assert_eq!(session.response_count().await, 0);
    let (online, offline) = session.peers_status().await;
    assert!(online.is_empty());
    assert_eq!(offline, peers(&[2, 3]));

    match join.await.unwrap() {
        Err(TesseraError::Coordination(CoordinationError::JoinTimeout { online })) => {
            assert_eq!(online, peers(&[1]));
        }
        other => panic!("Expected a join timeout, got {:?}", other),
    }
    leader.release_streams(&session_id).await;
    assert!(leader.stream_manager().is_empty().await);
}

#[tokio::test]
async fn test_request_for_unknown_session_is_closed() {
    init_tracing();
    let network = MemoryNetwork::default();
    let coordinators = start_coordinators(&network, &[1]).await;
    let leader = coordinators[0].clone();
    let sender = network.join(test_peer_id(2)).await;

    let mut stream = sender
        .open_stream(test_peer_id(1), ProtocolId::JoinPartyLeader)
        .await
        .expect("Stream opened");
    let payload = JoinPartyLeaderComm::request("finished-session")
        .encode()
        .expect("Request encodes");
    write_frame(&mut *stream, &payload).await.expect("Request written");
    let ack = read_frame(&mut *stream).await.expect("Ack read");
    assert_eq!(Ack::parse(&ack), Some(Ack::InvalidRequest));

    // Nothing is left for a later release to sweep
    timeout(Duration::from_secs(1), async {
        while network.stats().closed() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Leader closed the stream");
    assert!(leader.stream_manager().is_empty().await);
    assert_eq!(network.stats().redundant_closes(), 0);
}
