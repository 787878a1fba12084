//! Peer transports and the outbound peer client.
//!
//! Two inbound transports share one `PeerConnectionEndpoint`:
//!   POST /p2p      one JSON request per HTTP request
//!   GET  /p2p/ws   persistent WebSocket, requests correlated by `requestId`

pub mod client;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::rejection::{FailedToBufferBody, StringRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};

use strata_core::{ErrorCode, PeerResponse};
use strata_services::PeerConnectionEndpoint;

pub use client::{ClientError, HttpPeerClient};

pub const HTTP_PATH: &str = "/p2p";
pub const WS_PATH: &str = "/p2p/ws";

/// Responses queued per WebSocket connection before request tasks wait.
const OUTBOUND_FRAMES: usize = 64;

/// Frames one WebSocket connection may have in processing at once. The
/// reader stops pulling frames off the socket while this many are pending.
pub const MAX_FRAMES_IN_FLIGHT: usize = 16;

/// Frames this far past the request limit are still read, so the endpoint
/// answers and penalises them the same way as an oversized POST body.
/// Anything larger drops the connection.
const OVERSIZE_FRAME_GRACE: usize = 1024 * 1024;

pub fn router(endpoint: PeerConnectionEndpoint) -> Router {
    let body_limit = endpoint.max_request_bytes();
    Router::new()
        .route(HTTP_PATH, post(handle_post))
        .route(WS_PATH, get(handle_upgrade))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(endpoint)
}

/// Serve both transports on `listener` until `shutdown` resolves.
pub async fn serve(
    endpoint: PeerConnectionEndpoint,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "peer endpoint listening");
    axum::serve(
        listener,
        router(endpoint).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

// ── Request/response ──────────────────────────────────────────────────────────

async fn handle_post(
    State(endpoint): State<PeerConnectionEndpoint>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<String, StringRejection>,
) -> Json<PeerResponse> {
    let origin = addr.ip();
    let response = match body {
        Ok(raw) => endpoint.handle_request(origin, raw).await,
        Err(StringRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
            endpoint.refuse_malformed(origin, "request exceeds the size limit")
        }
        Err(StringRejection::InvalidUtf8(_)) => {
            endpoint.refuse_malformed(origin, "request is not valid UTF-8")
        }
        Err(e) => {
            // The body stream broke; the peer is most likely gone.
            tracing::debug!(peer = %origin, error = %e, "failed to read request body");
            PeerResponse::error_with_cause(ErrorCode::InternalError, e.body_text())
        }
    };
    Json(response)
}

// ── Persistent duplex ─────────────────────────────────────────────────────────

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(endpoint): State<PeerConnectionEndpoint>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let max_message = endpoint
        .max_request_bytes()
        .saturating_add(OVERSIZE_FRAME_GRACE);
    ws.max_message_size(max_message)
        .max_frame_size(max_message)
        .on_upgrade(move |socket| serve_socket(socket, endpoint, addr.ip()))
}

/// One reader loop, one writer task. Each frame is processed on its own
/// task; responses reach the socket only through the writer, one at a time.
/// At most `MAX_FRAMES_IN_FLIGHT` frames per connection are pending, so a
/// flooding peer queues behind its own requests, not ahead of other peers'.
async fn serve_socket(socket: WebSocket, endpoint: PeerConnectionEndpoint, origin: IpAddr) {
    tracing::debug!(peer = %origin, "websocket connected");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_FRAMES);
    let in_flight = Arc::new(Semaphore::new(MAX_FRAMES_IN_FLIGHT));

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                tracing::debug!(peer = %origin, error = %e, "websocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let raw = match frame {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(raw) => raw,
                Err(_) => {
                    let response = endpoint.refuse_malformed(origin, "frame is not valid UTF-8");
                    if tx.send(Message::Text(response.to_json().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(peer = %origin, error = %e, "websocket read failed");
                break;
            }
        };
        let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
            break;
        };
        let endpoint = endpoint.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let response = endpoint.handle_frame(origin, raw).await;
            if tx.send(Message::Text(response.to_json().into())).await.is_err() {
                tracing::debug!(peer = %origin, "connection closed before response was sent");
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    tracing::debug!(peer = %origin, "websocket disconnected");
}
