//! Protocol-level tests for messages, framing and requests
//!
//! Exercises the public surface the runtime relies on: join-party message
//! decoding, acknowledgments, frame limits and request validation.

use tessera_core::{
    protocol::{read_frame, write_frame, LENGTH_HEADER},
    threshold, Ack, JoinPartyLeaderComm, JoinPartyRequest, KeysignRequest, LeaderCommType, LeaderDecision,
    LeaderOutcome, PeerId, TesseraError, TesseraResult, WrappedMessage, MAX_PAYLOAD,
};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

fn create_test_peer_id(id: u8) -> PeerId {
    PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
}

fn signers(n: u8) -> Vec<String> {
    (1..=n).map(|id| create_test_peer_id(id).to_string()).collect()
}

// ----------------------------------------------------------------------------
// Join Party Messages
// ----------------------------------------------------------------------------

#[test]
fn test_leader_response_carries_decision() -> TesseraResult<()> {
    let decision = LeaderDecision::new(
        LeaderOutcome::Success,
        vec![create_test_peer_id(1), create_test_peer_id(2), create_test_peer_id(3)],
    );
    let bytes = JoinPartyLeaderComm::response("session", &decision).encode()?;
    let decoded = JoinPartyLeaderComm::decode(&bytes)?;

    assert_eq!(decoded.msg_type, LeaderCommType::Response);
    assert_eq!(decoded.outcome, LeaderOutcome::Success);
    assert_eq!(decoded.participant_ids, decision.participants);
    Ok(())
}

#[test]
fn test_truncated_messages_rejected() -> TesseraResult<()> {
    let bytes = JoinPartyRequest::new("a-long-session-identifier").encode()?;
    assert!(matches!(
        JoinPartyRequest::decode(&bytes[..bytes.len() / 2]),
        Err(TesseraError::Decode(_))
    ));
    assert!(WrappedMessage::decode(b"{\"message_type\":").is_err());
    Ok(())
}

#[test]
fn test_acks_are_plain_text() {
    assert_eq!(Ack::RequestReceived.as_bytes(), b"request received");
    assert_eq!(Ack::InvalidRequest.as_bytes(), b"invalid request");
    assert_eq!(Ack::parse(b"copy_done"), Some(Ack::CopyDone));
    assert_eq!(Ack::parse(b"copy done"), None);
}

// ----------------------------------------------------------------------------
// Framing
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_frame_at_limit_accepted() -> TesseraResult<()> {
    let (mut writer, mut reader) = tokio::io::duplex(MAX_PAYLOAD + LENGTH_HEADER);
    let payload = vec![7u8; MAX_PAYLOAD];
    write_frame(&mut writer, &payload).await?;
    assert_eq!(read_frame(&mut reader).await?.len(), MAX_PAYLOAD);
    Ok(())
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

#[test]
fn test_threshold_rule() {
    assert!(threshold(0).is_err());
    assert_eq!(threshold(1).unwrap(), 0);
    assert_eq!(threshold(3).unwrap(), 1);
    assert_eq!(threshold(4).unwrap(), 2);
    assert_eq!(threshold(10).unwrap(), 6);
}

#[test]
fn test_keysign_session_ignores_signer_order() -> TesseraResult<()> {
    let mut reversed = signers(4);
    reversed.reverse();
    let a = KeysignRequest::new("pool", b"message", signers(4), 1);
    let b = KeysignRequest::new("pool", b"message", reversed, 1);
    assert_eq!(a.session_id()?, b.session_id()?);

    let other = KeysignRequest::new("pool", b"other message", signers(4), 1);
    assert_ne!(a.session_id()?, other.session_id()?);
    Ok(())
}

#[test]
fn test_keysign_validation() {
    assert!(KeysignRequest::new("pool", b"m", signers(3), 1).validate().is_ok());
    assert!(KeysignRequest::new("pool", b"m", Vec::new(), 1).validate().is_err());
    assert!(KeysignRequest::new("pool", b"m", vec!["zz".to_string()], 1)
        .validate()
        .is_err());
}
