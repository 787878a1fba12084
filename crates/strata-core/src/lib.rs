//! Wire envelope, chunk model, and configuration.
//! All other Strata crates depend on this one.

pub mod chunk;
pub mod config;
pub mod wire;

pub use chunk::{
    ChunkDescriptor, ChunkState, FileChunk, FileDownloadInfo, FileInfo, TransferEvent,
    TransferPlan,
};
pub use wire::{Envelope, ErrorCode, PeerResponse, RequestType, PROTOCOL_VERSION};
