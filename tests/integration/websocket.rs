use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use strata_core::wire::{file_chunk_request, RequestType, FILE_CHUNK_KEY};
use strata_core::{Envelope, PeerResponse};
use strata_services::{HandlerError, PeerDescriptor, RequestHandler};

use crate::*;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open(node: &TestNode) -> Result<Socket> {
    let (socket, _) = connect_async(node.ws_url().as_str()).await?;
    Ok(socket)
}

async fn send(socket: &mut Socket, raw: String) -> Result<()> {
    socket.send(Message::text(raw)).await?;
    Ok(())
}

/// Next text frame as JSON, skipping control frames.
async fn recv(socket: &mut Socket) -> Result<Value> {
    loop {
        let frame = tokio::time::timeout(REQUEST_TIMEOUT, socket.next())
            .await?
            .context("socket closed")??;
        match frame {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Close(_) => anyhow::bail!("socket closed"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_frames_echo_request_id() -> Result<()> {
    let node = TestNode::spawn("ws-echo").await?;
    node.serve_file("shard-5", &sample_data(1000))?;
    let layout = node
        .files
        .download_info("shard-5")?
        .context("shard-5 should be served")?;
    let mut socket = open(&node).await?;

    send(&mut socket, hello().with_request_id(7).to_json()).await?;
    let resp = recv(&mut socket).await?;
    assert_eq!(resp["requestId"], 7);
    assert_eq!(resp["protocol"], 1);

    send(
        &mut socket,
        file_chunk_request("shard-5", &layout.chunks[0])
            .with_request_id(8)
            .to_json(),
    )
    .await?;
    let resp = recv(&mut socket).await?;
    assert_eq!(resp["requestId"], 8);
    assert_eq!(resp[FILE_CHUNK_KEY]["size"], 1000);
    Ok(())
}

/// Requests on one socket run concurrently; every response carries the
/// id of the request it answers.
#[tokio::test]
async fn test_pipelined_frames_are_all_answered() -> Result<()> {
    let node = TestNode::spawn("ws-pipeline").await?;
    let mut socket = open(&node).await?;

    send(&mut socket, hello().with_request_id(1).to_json()).await?;
    recv(&mut socket).await?;

    let ids: HashSet<u64> = (100..120).collect();
    for id in &ids {
        send(
            &mut socket,
            Envelope::request(RequestType::GetPeers)
                .with_request_id(*id)
                .to_json(),
        )
        .await?;
    }
    let mut answered = HashSet::new();
    for _ in 0..ids.len() {
        let resp = recv(&mut socket).await?;
        assert_eq!(error_of(&resp), None, "got {resp}");
        answered.insert(resp["requestId"].as_u64().context("response without id")?);
    }
    assert_eq!(answered, ids);
    Ok(())
}

#[tokio::test]
async fn test_frame_without_request_id_blacklists_peer() -> Result<()> {
    let node = TestNode::spawn("ws-no-id").await?;
    let mut socket = open(&node).await?;

    send(&mut socket, hello().to_json()).await?;
    let resp = recv(&mut socket).await?;
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_PROTOCOL"));
    assert!(resp.get("requestId").is_none());
    assert!(node.registry.is_blacklisted(&LOOPBACK));

    // Zero is not a usable id either, and the peer stays refused.
    send(&mut socket, hello().with_request_id(0).to_json()).await?;
    let resp = recv(&mut socket).await?;
    assert_eq!(error_of(&resp), Some("BLACKLISTED"));
    Ok(())
}

#[tokio::test]
async fn test_malformed_frame_keeps_correlation() -> Result<()> {
    let node = TestNode::spawn("ws-malformed").await?;
    let mut socket = open(&node).await?;

    // Valid JSON with an id, but not a request object the node accepts.
    send(
        &mut socket,
        serde_json::json!({"protocol": "one", "requestType": "getInfo", "requestId": 42})
            .to_string(),
    )
    .await?;
    let resp = recv(&mut socket).await?;
    assert_eq!(resp["requestId"], 42);
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_PROTOCOL"));
    Ok(())
}

#[tokio::test]
async fn test_oversized_frame_is_refused_like_oversized_post() -> Result<()> {
    let node = TestNode::spawn_with(
        "ws-oversized",
        NodeOptions {
            max_request_bytes: 512,
            ..NodeOptions::default()
        },
    )
    .await?;
    let mut socket = open(&node).await?;

    let padding = "x".repeat(4096);
    send(
        &mut socket,
        hello().with_request_id(5).with_field("padding", padding).to_json(),
    )
    .await?;
    let resp = recv(&mut socket).await?;
    assert_eq!(resp["requestId"], 5);
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_PROTOCOL"));
    assert!(node.registry.is_blacklisted(&LOOPBACK));
    Ok(())
}

#[tokio::test]
async fn test_binary_frame_that_is_not_utf8_blacklists_peer() -> Result<()> {
    let node = TestNode::spawn("ws-binary").await?;
    let mut socket = open(&node).await?;

    socket.send(Message::Binary(vec![0xff, 0xfe, 0x7b].into())).await?;
    let resp = recv(&mut socket).await?;
    assert_eq!(error_of(&resp), Some("UNSUPPORTED_PROTOCOL"));
    assert!(node.registry.is_blacklisted(&LOOPBACK));
    Ok(())
}

/// A getPeers handler that takes a while to answer.
struct SlowPeers;

impl RequestHandler for SlowPeers {
    fn request_type(&self) -> RequestType {
        RequestType::GetPeers
    }

    fn process(&self, _: &Envelope, _: &PeerDescriptor) -> Result<PeerResponse, HandlerError> {
        std::thread::sleep(Duration::from_millis(40));
        Ok(PeerResponse::new().with("peers", Value::Array(Vec::new())))
    }
}

/// A connection flooding the node with slow requests holds at most a
/// bounded share of the request workers; another connection is still
/// answered promptly.
#[tokio::test]
async fn test_flooding_connection_does_not_starve_others() -> Result<()> {
    let node = TestNode::spawn_with(
        "ws-flood",
        NodeOptions {
            workers: 1,
            handlers: vec![Arc::new(SlowPeers)],
            ..NodeOptions::default()
        },
    )
    .await?;

    let mut flood = open(&node).await?;
    send(&mut flood, hello().with_request_id(1).to_json()).await?;
    recv(&mut flood).await?;
    // 100 requests at 40ms each on one worker is four seconds of work.
    for id in 2..102 {
        send(
            &mut flood,
            Envelope::request(RequestType::GetPeers)
                .with_request_id(id)
                .to_json(),
        )
        .await?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut other = open(&node).await?;
    let started = Instant::now();
    send(&mut other, hello().with_request_id(7).to_json()).await?;
    let resp = recv(&mut other).await?;
    let waited = started.elapsed();

    assert_eq!(resp["requestId"], 7);
    assert_eq!(error_of(&resp), None, "got {resp}");
    assert!(
        waited < Duration::from_millis(2500),
        "second connection waited {waited:?}"
    );
    Ok(())
}
