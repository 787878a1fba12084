//! Outbound peer client over the request/response transport.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

use strata_core::wire::{
    file_chunk_request, ChunkDecodeError, ChunkPayload, RequestType, FILE_CHUNK_KEY,
    FILE_DOWNLOAD_INFO_KEY, FILE_ID_KEY,
};
use strata_core::{ChunkDescriptor, Envelope, ErrorCode, FileChunk, FileDownloadInfo, PeerResponse};
use strata_services::{FetchError, NodeInfo, PeerClient, PeerRegistry};

use crate::HTTP_PATH;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot resolve peer {0}")]
    Resolve(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer refused request: {code}")]
    Rejected {
        code: ErrorCode,
        cause: Option<String>,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A handshaken connection to one peer's `/p2p` endpoint.
#[derive(Clone)]
pub struct HttpPeerClient {
    http: reqwest::Client,
    url: String,
    peer: SocketAddr,
}

impl HttpPeerClient {
    /// Resolve `peer` (host:port), perform the `getInfo` handshake, and
    /// record the peer as outbound in `registry`.
    pub async fn connect(
        peer: &str,
        registry: &PeerRegistry,
        info: &NodeInfo,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let addr = tokio::net::lookup_host(peer)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ClientError::Resolve(peer.to_string()))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let client = Self {
            http,
            url: format!("http://{addr}{HTTP_PATH}"),
            peer: addr,
        };

        let hello = Envelope::request(RequestType::GetInfo)
            .with_field("application", info.application.as_str())
            .with_field("version", info.version.as_str());
        let resp = client.request(&hello).await?;
        let application = resp
            .get("application")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let version = resp
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::InvalidResponse("handshake without version".into()))?;

        registry.find_or_create(addr.ip());
        registry.register_outbound(addr.ip());
        registry.set_version(addr.ip(), application, version);
        tracing::info!(peer = %addr, application, version, "connected to peer");
        Ok(client)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request. Error responses come back as `ClientError::Rejected`.
    pub async fn request(&self, request: &Envelope) -> Result<PeerResponse, ClientError> {
        let resp: PeerResponse = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.to_json())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if resp.is_error() {
            let code = resp.error_code().ok_or_else(|| {
                ClientError::InvalidResponse(format!("unknown error response: {}", resp.to_json()))
            })?;
            return Err(ClientError::Rejected {
                code,
                cause: resp.cause().map(String::from),
            });
        }
        Ok(resp)
    }

    /// The peer's chunk layout for `file_id`, if it serves that file.
    pub async fn download_info(&self, file_id: &str) -> Result<Option<FileDownloadInfo>, ClientError> {
        let request =
            Envelope::request(RequestType::GetFileDownloadInfo).with_field(FILE_ID_KEY, file_id);
        let resp = self.request(&request).await?;
        match resp.get(FILE_DOWNLOAD_INFO_KEY) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ClientError::InvalidResponse(e.to_string())),
        }
    }
}

impl From<ClientError> for FetchError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Http(e) if e.is_connect() => FetchError::Closed,
            ClientError::Http(e) if e.is_decode() => FetchError::Protocol(e.to_string()),
            ClientError::Http(e) => FetchError::Transport(e.to_string()),
            ClientError::Rejected { code, .. } => FetchError::Rejected(code),
            ClientError::InvalidResponse(msg) => FetchError::Protocol(msg),
            ClientError::Resolve(peer) => FetchError::Transport(format!("cannot resolve {peer}")),
        }
    }
}

impl PeerClient for HttpPeerClient {
    fn address(&self) -> IpAddr {
        self.peer.ip()
    }

    async fn fetch_chunk(
        &self,
        file_id: &str,
        chunk: &ChunkDescriptor,
    ) -> Result<Option<FileChunk>, FetchError> {
        let resp = self.request(&file_chunk_request(file_id, chunk)).await?;
        let payload: ChunkPayload = match resp.get(FILE_CHUNK_KEY) {
            None | Some(serde_json::Value::Null) => return Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| FetchError::Protocol(format!("bad chunk payload: {e}")))?,
        };
        if payload.file_id != file_id || payload.chunk_id != chunk.chunk_id {
            return Err(FetchError::Protocol(format!(
                "asked for {file_id}#{}, got {}#{}",
                chunk.chunk_id, payload.file_id, payload.chunk_id
            )));
        }
        match payload.decode() {
            Ok(fetched) => Ok(Some(fetched)),
            Err(ChunkDecodeError::Integrity(e)) => Err(FetchError::Integrity(e)),
            Err(e) => Err(FetchError::Protocol(e.to_string())),
        }
    }
}
