//! Node-wide flags consulted by the endpoint's backpressure gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strata_core::ErrorCode;

/// Whether the node is catching up and whether it serves history at all.
#[derive(Clone, Default)]
pub struct NodeState {
    downloading: Arc<AtomicBool>,
    light_client: Arc<AtomicBool>,
}

impl NodeState {
    pub fn new(light_client: bool) -> Self {
        Self {
            downloading: Arc::new(AtomicBool::new(false)),
            light_client: Arc::new(AtomicBool::new(light_client)),
        }
    }

    pub fn set_downloading(&self, downloading: bool) {
        let was = self.downloading.swap(downloading, Ordering::SeqCst);
        if was != downloading {
            tracing::info!(downloading, "node sync state changed");
        }
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    pub fn is_light_client(&self) -> bool {
        self.light_client.load(Ordering::Relaxed)
    }

    /// Why a reject-while-syncing request must be refused right now, if at all.
    pub fn sync_refusal(&self) -> Option<ErrorCode> {
        if self.is_downloading() {
            Some(ErrorCode::Downloading)
        } else if self.is_light_client() {
            Some(ErrorCode::LightClient)
        } else {
            None
        }
    }
}
