//! Handler trait for peer requests.
//!
//! Every request type served by the node has one handler. This trait is the
//! contract between the endpoint (which parses, gates, and answers) and the
//! request logic (which only sees an admitted, well-formed request).

use strata_core::wire::{EnvelopeError, RequestType};
use strata_core::{Envelope, PeerResponse};

use crate::registry::PeerDescriptor;

/// Failure inside a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The peer went away while we were answering.
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error(transparent)]
    Request(#[from] EnvelopeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// A closed connection is not the peer's fault and is not penalized.
    pub fn is_benign_close(&self) -> bool {
        match self {
            HandlerError::ConnectionClosed => true,
            HandlerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

/// Serves one request type.
///
/// Handlers run on the blocking pool, so they may do synchronous file I/O.
pub trait RequestHandler: Send + Sync {
    /// The request type this handler answers.
    fn request_type(&self) -> RequestType;

    /// Refuse while the node is catching up or runs as a light client.
    fn reject_while_syncing(&self) -> bool {
        false
    }

    /// Produce the response for an admitted request.
    fn process(
        &self,
        request: &Envelope,
        peer: &PeerDescriptor,
    ) -> Result<PeerResponse, HandlerError>;
}
