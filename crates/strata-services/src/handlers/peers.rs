//! `getPeers`: share the addresses we know.

use serde_json::Value;

use strata_core::wire::RequestType;
use strata_core::{Envelope, PeerResponse};

use crate::handler::{HandlerError, RequestHandler};
use crate::registry::{PeerDescriptor, PeerRegistry};

/// Upper bound on addresses returned in one response.
const MAX_PEERS_RETURNED: usize = 100;

pub struct GetPeersHandler {
    registry: PeerRegistry,
}

impl GetPeersHandler {
    pub fn new(registry: PeerRegistry) -> Self {
        Self { registry }
    }
}

impl RequestHandler for GetPeersHandler {
    fn request_type(&self) -> RequestType {
        RequestType::GetPeers
    }

    fn process(&self, _: &Envelope, peer: &PeerDescriptor) -> Result<PeerResponse, HandlerError> {
        let mut addresses = self.registry.known_addresses();
        addresses.retain(|a| *a != peer.address);
        addresses.sort();
        addresses.truncate(MAX_PEERS_RETURNED);
        let peers: Vec<Value> = addresses
            .into_iter()
            .map(|a| Value::from(a.to_string()))
            .collect();
        Ok(PeerResponse::new().with("peers", peers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn excludes_requester_and_blacklisted() {
        let registry = PeerRegistry::new(4);
        let me = registry.find_or_create(IpAddr::from([10, 0, 3, 1])).unwrap();
        registry.find_or_create(IpAddr::from([10, 0, 3, 2]));
        registry.find_or_create(IpAddr::from([10, 0, 3, 3]));
        registry.blacklist(IpAddr::from([10, 0, 3, 3]), "bad");

        let resp = GetPeersHandler::new(registry)
            .process(&Envelope::request(RequestType::GetPeers), &me)
            .unwrap();
        assert_eq!(resp.get("peers"), Some(&serde_json::json!(["10.0.3.2"])));
    }
}
