//! Strata integration test harness.
//!
//! Every test starts its own peer endpoint on 127.0.0.1 with an ephemeral
//! port and a private storage directory. All requests in a test come from
//! the loopback address, so each server sees exactly one remote peer.

mod protocol;
mod transfer;
mod websocket;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use strata_core::wire::RequestType;
use strata_core::Envelope;
use strata_services::{
    standard_table, DownloadableFiles, NodeInfo, NodeState, PeerConnectionEndpoint, PeerRegistry,
    RequestHandler,
};

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NodeOptions {
    pub max_inbound: usize,
    pub max_request_bytes: usize,
    pub light_client: bool,
    /// Concurrent requests across all connections.
    pub workers: usize,
    /// Registered after the standard handlers, replacing them by type.
    pub handlers: Vec<Arc<dyn RequestHandler>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            max_inbound: 8,
            max_request_bytes: strata_core::wire::MAX_REQUEST_BYTES,
            light_client: false,
            workers: 4,
            handlers: Vec::new(),
        }
    }
}

/// A running peer endpoint. Dropping it stops the server and removes its
/// storage directory.
pub struct TestNode {
    pub addr: SocketAddr,
    pub registry: PeerRegistry,
    pub node: NodeState,
    pub files: DownloadableFiles,
    storage: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestNode {
    pub async fn spawn(name: &str) -> Result<Self> {
        Self::spawn_with(name, NodeOptions::default()).await
    }

    pub async fn spawn_with(name: &str, options: NodeOptions) -> Result<Self> {
        let storage = scratch_dir(name);
        let registry = PeerRegistry::new(options.max_inbound);
        let node = NodeState::new(options.light_client);
        let files = DownloadableFiles::new(&storage)
            .with_context(|| format!("failed to create {}", storage.display()))?;
        let info = NodeInfo::new(format!("strata-{name}"), options.light_client);
        let mut table = standard_table(registry.clone(), files.clone(), info);
        for handler in options.handlers {
            table.register(handler);
        }
        let endpoint =
            PeerConnectionEndpoint::new(registry.clone(), table, node.clone(), options.workers)
                .with_max_request_bytes(options.max_request_bytes);

        let listener = TcpListener::bind((LOOPBACK, 0)).await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(strata_net::serve(endpoint, listener, async move {
            let _ = rx.await;
        }));

        Ok(Self {
            addr,
            registry,
            node,
            files,
            storage,
            shutdown: Some(tx),
        })
    }

    /// Place `data` in storage so the node serves it as `file_id`.
    pub fn serve_file(&self, file_id: &str, data: &[u8]) -> Result<()> {
        let path = self
            .files
            .path_for(file_id)
            .with_context(|| format!("invalid file id {file_id}"))?;
        std::fs::write(&path, data)?;
        Ok(())
    }

    pub fn http_url(&self) -> String {
        format!("http://{}{}", self.addr, strata_net::HTTP_PATH)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, strata_net::WS_PATH)
    }

    /// POST a raw body and return the JSON response.
    pub async fn post_raw(&self, body: impl Into<String>) -> Result<Value> {
        let resp = reqwest::Client::new()
            .post(self.http_url())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }

    pub async fn post(&self, request: &Envelope) -> Result<Value> {
        self.post_raw(request.to_json()).await
    }

    pub async fn handshake(&self) -> Result<Value> {
        self.post(&hello()).await
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = std::fs::remove_dir_all(&self.storage);
    }
}

pub fn hello() -> Envelope {
    Envelope::request(RequestType::GetInfo)
        .with_field("application", "strata-it")
        .with_field("version", "0.1.0")
}

/// A fresh directory under the system temp dir, unique per process and name.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("strata-it-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Deterministic test content that differs from chunk to chunk.
pub fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn error_of(resp: &Value) -> Option<&str> {
    resp.get("error").and_then(Value::as_str)
}

pub fn cause_of(resp: &Value) -> Option<&str> {
    resp.get("cause").and_then(Value::as_str)
}
