//! Peer connection endpoint: the inbound request pipeline.
//!
//! Both transports hand raw request text and the origin address to the
//! endpoint and send back whatever it returns. The pipeline, in order:
//!
//!   resolve peer → blacklist → parse + protocol → handler lookup →
//!   handshake sequence → inbound admission → sync backpressure → handler
//!
//! Every failure is answered with an error response. Protocol violations and
//! handler failures also blacklist the peer; unknown request types, sequence
//! errors and refusals do not.

use std::any::Any;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::Semaphore;

use strata_core::wire::{peek_request_id, MAX_REQUEST_BYTES};
use strata_core::{Envelope, ErrorCode, PeerResponse};

use crate::dispatch::RequestDispatchTable;
use crate::node::NodeState;
use crate::registry::{Admission, PeerRegistry};

/// Which transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// One request per HTTP POST.
    RequestResponse,
    /// Frames on a persistent WebSocket. Requests carry a `requestId`.
    Duplex,
}

#[derive(Clone)]
pub struct PeerConnectionEndpoint {
    registry: PeerRegistry,
    table: Arc<RequestDispatchTable>,
    node: NodeState,
    workers: Arc<Semaphore>,
    max_request_bytes: usize,
}

impl PeerConnectionEndpoint {
    /// `workers` bounds how many requests are processed at once.
    pub fn new(
        registry: PeerRegistry,
        table: RequestDispatchTable,
        node: NodeState,
        workers: usize,
    ) -> Self {
        Self {
            registry,
            table: Arc::new(table),
            node,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            max_request_bytes: MAX_REQUEST_BYTES,
        }
    }

    pub fn with_max_request_bytes(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn node(&self) -> &NodeState {
        &self.node
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    /// Answer one request/response request. Runs on the caller's thread.
    pub fn process(&self, origin: IpAddr, raw: &str) -> PeerResponse {
        self.dispatch(origin, raw, Transport::RequestResponse)
    }

    /// Answer one persistent-transport frame, echoing its `requestId`.
    pub fn process_frame(&self, origin: IpAddr, raw: &str) -> PeerResponse {
        self.dispatch(origin, raw, Transport::Duplex)
            .with_request_id(peek_request_id(raw))
    }

    /// Answer a request the transport could not read, e.g. an oversized
    /// or non-UTF-8 body. Counts as a malformed request.
    pub fn refuse_malformed(&self, origin: IpAddr, cause: &str) -> PeerResponse {
        let Some(peer) = self.registry.find_or_create(origin) else {
            return PeerResponse::error(ErrorCode::UnknownPeer);
        };
        if let Some(cause) = &peer.blacklist_cause {
            return PeerResponse::blacklisted(cause.as_str());
        }
        tracing::debug!(peer = %origin, cause, "unreadable request");
        self.registry.blacklist(origin, cause);
        PeerResponse::error_with_cause(ErrorCode::UnsupportedProtocol, cause)
    }

    /// `process` on the bounded blocking pool.
    pub async fn handle_request(&self, origin: IpAddr, raw: String) -> PeerResponse {
        self.run_bounded(origin, raw, Transport::RequestResponse).await
    }

    /// `process_frame` on the bounded blocking pool.
    pub async fn handle_frame(&self, origin: IpAddr, raw: String) -> PeerResponse {
        self.run_bounded(origin, raw, Transport::Duplex).await
    }

    async fn run_bounded(&self, origin: IpAddr, raw: String, transport: Transport) -> PeerResponse {
        let request_id = match transport {
            Transport::Duplex => peek_request_id(&raw),
            Transport::RequestResponse => None,
        };
        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return PeerResponse::error_with_cause(ErrorCode::InternalError, "shutting down")
                    .with_request_id(request_id)
            }
        };
        let endpoint = self.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            endpoint.dispatch(origin, &raw, transport)
        })
        .await;
        match joined {
            Ok(response) => response.with_request_id(request_id),
            Err(e) => {
                tracing::warn!(peer = %origin, error = %e, "request task failed");
                PeerResponse::error_with_cause(ErrorCode::InternalError, e.to_string())
                    .with_request_id(request_id)
            }
        }
    }

    fn dispatch(&self, origin: IpAddr, raw: &str, transport: Transport) -> PeerResponse {
        let Some(peer) = self.registry.find_or_create(origin) else {
            return PeerResponse::error(ErrorCode::UnknownPeer);
        };
        if let Some(cause) = &peer.blacklist_cause {
            return PeerResponse::blacklisted(cause.as_str());
        }

        let request = match Envelope::parse(raw, self.max_request_bytes) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(peer = %origin, error = %e, "malformed request");
                self.registry.blacklist(origin, e.to_string());
                return PeerResponse::error_with_cause(ErrorCode::UnsupportedProtocol, e.to_string());
            }
        };
        if !request.is_supported_protocol() {
            tracing::debug!(peer = %origin, protocol = ?request.protocol(), "unsupported protocol");
            self.registry.blacklist(origin, "Unsupported protocol");
            return PeerResponse::error(ErrorCode::UnsupportedProtocol);
        }
        if transport == Transport::Duplex && request.request_id().is_none() {
            tracing::debug!(peer = %origin, "frame without request id");
            self.registry.blacklist(origin, "Missing request id");
            return PeerResponse::error(ErrorCode::UnsupportedProtocol);
        }

        let Some(handler) = request
            .request_type_name()
            .and_then(|name| self.table.resolve_name(name))
        else {
            tracing::debug!(
                peer = %origin,
                request_type = request.request_type_name().unwrap_or(""),
                "unsupported request type"
            );
            return PeerResponse::error(ErrorCode::UnsupportedRequestType);
        };
        let request_type = handler.request_type();

        if !peer.has_handshake() && !request_type.is_handshake() {
            tracing::debug!(peer = %origin, %request_type, "request before handshake");
            return PeerResponse::error(ErrorCode::SequenceError);
        }

        if self.registry.admit_inbound(origin) == Admission::Full {
            return PeerResponse::error(ErrorCode::MaxInboundConnections);
        }

        if handler.reject_while_syncing() {
            if let Some(code) = self.node.sync_refusal() {
                return PeerResponse::error(code);
            }
        }

        // Admission may have changed the descriptor.
        let peer = self.registry.get(&origin).unwrap_or(peer);
        match catch_unwind(AssertUnwindSafe(|| handler.process(&request, &peer))) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_benign_close() => {
                tracing::debug!(peer = %origin, %request_type, error = %e, "peer closed connection");
                PeerResponse::error_with_cause(ErrorCode::InternalError, e.to_string())
            }
            Ok(Err(e)) => {
                tracing::debug!(peer = %origin, %request_type, error = %e, "request failed");
                self.registry.blacklist(origin, e.to_string());
                PeerResponse::error_with_cause(ErrorCode::InternalError, e.to_string())
            }
            Err(panic) => {
                let cause = panic_message(panic.as_ref());
                tracing::warn!(peer = %origin, %request_type, cause = %cause, "request handler panicked");
                self.registry.blacklist(origin, cause.clone());
                PeerResponse::error_with_cause(ErrorCode::InternalError, cause)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
