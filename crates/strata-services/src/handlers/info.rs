//! `getInfo`: the handshake.

use serde::Serialize;

use strata_core::wire::RequestType;
use strata_core::{Envelope, PeerResponse, PROTOCOL_VERSION};

use crate::handler::{HandlerError, RequestHandler};
use crate::registry::{PeerDescriptor, PeerRegistry};

/// What this node announces about itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub application: String,
    pub version: String,
    pub light_client: bool,
}

impl NodeInfo {
    pub fn new(application: impl Into<String>, light_client: bool) -> Self {
        Self {
            application: application.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            light_client,
        }
    }
}

pub struct GetInfoHandler {
    registry: PeerRegistry,
    info: NodeInfo,
}

impl GetInfoHandler {
    pub fn new(registry: PeerRegistry, info: NodeInfo) -> Self {
        Self { registry, info }
    }
}

impl RequestHandler for GetInfoHandler {
    fn request_type(&self) -> RequestType {
        RequestType::GetInfo
    }

    fn process(
        &self,
        request: &Envelope,
        peer: &PeerDescriptor,
    ) -> Result<PeerResponse, HandlerError> {
        let version: String = request.field("version")?;
        let application: String = request
            .optional_field("application")?
            .unwrap_or_else(|| "unknown".to_string());
        if version.trim().is_empty() {
            return Err(HandlerError::Failed("empty version in handshake".into()));
        }
        self.registry
            .set_version(peer.address, &application, version.trim());

        Ok(PeerResponse::new()
            .with("application", self.info.application.as_str())
            .with("version", self.info.version.as_str())
            .with("protocol", PROTOCOL_VERSION)
            .with("lightClient", self.info.light_client))
    }
}
