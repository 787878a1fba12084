use serde_json::json;

use strata_core::wire::RequestType;
use strata_core::Envelope;

use crate::*;

#[tokio::test]
async fn test_handshake_reports_node_info() -> Result<()> {
    let node = TestNode::spawn("handshake").await?;

    let resp = node.handshake().await?;
    assert_eq!(error_of(&resp), None, "got {resp}");
    assert_eq!(resp["application"], "strata-handshake");
    assert_eq!(resp["protocol"], 1);
    assert_eq!(resp["lightClient"], false);
    assert!(resp["version"].is_string());

    let peer = node.registry.get(&LOOPBACK).context("peer should be known")?;
    assert_eq!(peer.version.as_deref(), Some("0.1.0"));
    assert_eq!(node.registry.inbound_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_request_before_handshake_is_sequence_error() -> Result<()> {
    let node = TestNode::spawn("sequence").await?;

    let resp = node.post(&Envelope::request(RequestType::GetPeers)).await?;
    assert_eq!(error_of(&resp), Some("SEQUENCE_ERROR"));
    assert!(!node.registry.is_blacklisted(&LOOPBACK));

    node.handshake().await?;
    let resp = node.post(&Envelope::request(RequestType::GetPeers)).await?;
    assert_eq!(error_of(&resp), None, "got {resp}");
    assert_eq!(resp["peers"], json!([]));
    Ok(())
}

#[tokio::test]
async fn test_unknown_request_type_is_not_misbehaviour() -> Result<()> {
    let node = TestNode::spawn("unknown-type").await?;
    node.handshake().await?;

    let resp = node
        .post_raw(json!({"protocol": 1, "requestType": "getBananas"}).to_string())
        .await?;
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_REQUEST_TYPE"));

    // Known to the protocol but not served by this node.
    let resp = node.post(&Envelope::request(RequestType::GetNextBlocks)).await?;
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_REQUEST_TYPE"));

    assert!(!node.registry.is_blacklisted(&LOOPBACK));
    Ok(())
}

#[tokio::test]
async fn test_wrong_protocol_blacklists_peer() -> Result<()> {
    let node = TestNode::spawn("wrong-protocol").await?;

    let resp = node
        .post_raw(json!({"protocol": 2, "requestType": "getInfo", "version": "9.9"}).to_string())
        .await?;
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_PROTOCOL"));
    assert!(node.registry.is_blacklisted(&LOOPBACK));

    // Every later request is refused with the recorded cause.
    let resp = node.handshake().await?;
    assert_eq!(error_of(&resp), Some("BLACKLISTED"));
    assert_eq!(cause_of(&resp), Some("Unsupported protocol"));
    Ok(())
}

#[tokio::test]
async fn test_malformed_json_blacklists_peer() -> Result<()> {
    let node = TestNode::spawn("malformed").await?;

    let resp = node.post_raw("{\"protocol\": 1, \"requestType\":").await?;
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_PROTOCOL"));
    assert!(cause_of(&resp).is_some());
    assert!(node.registry.is_blacklisted(&LOOPBACK));
    Ok(())
}

#[tokio::test]
async fn test_oversized_request_is_refused() -> Result<()> {
    let node = TestNode::spawn_with(
        "oversized",
        NodeOptions {
            max_request_bytes: 512,
            ..NodeOptions::default()
        },
    )
    .await?;

    let padding = "x".repeat(4096);
    let body = hello().with_field("padding", padding).to_json();
    let resp = node.post_raw(body).await?;
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_PROTOCOL"));
    assert!(node.registry.is_blacklisted(&LOOPBACK));
    Ok(())
}

#[tokio::test]
async fn test_inbound_limit_refuses_new_peers() -> Result<()> {
    let node = TestNode::spawn_with(
        "inbound-limit",
        NodeOptions {
            max_inbound: 0,
            ..NodeOptions::default()
        },
    )
    .await?;

    let resp = node.handshake().await?;
    assert_eq!(error_of(&resp), Some("MAX_INBOUND_CONNECTIONS"));
    assert_eq!(node.registry.inbound_count(), 0);
    assert!(!node.registry.is_blacklisted(&LOOPBACK));
    Ok(())
}

#[tokio::test]
async fn test_handlers_answer_while_downloading() -> Result<()> {
    let node = TestNode::spawn("downloading").await?;
    node.handshake().await?;
    node.node.set_downloading(true);

    // None of the served request types are refused during a download.
    let resp = node.post(&Envelope::request(RequestType::GetPeers)).await?;
    assert_eq!(error_of(&resp), None, "got {resp}");
    Ok(())
}
