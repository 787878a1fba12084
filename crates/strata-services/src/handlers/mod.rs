//! Request handlers served by this node.

pub mod download_info;
pub mod file_chunk;
pub mod info;
pub mod peers;

use std::sync::Arc;

pub use download_info::GetFileDownloadInfoHandler;
pub use file_chunk::GetFileChunkHandler;
pub use info::{GetInfoHandler, NodeInfo};
pub use peers::GetPeersHandler;

use crate::dispatch::RequestDispatchTable;
use crate::files::DownloadableFiles;
use crate::registry::PeerRegistry;

/// The dispatch table for every request type this node serves.
pub fn standard_table(
    registry: PeerRegistry,
    files: DownloadableFiles,
    info: NodeInfo,
) -> RequestDispatchTable {
    let mut table = RequestDispatchTable::new();
    table.register(Arc::new(GetInfoHandler::new(registry.clone(), info)));
    table.register(Arc::new(GetPeersHandler::new(registry)));
    table.register(Arc::new(GetFileDownloadInfoHandler::new(files.clone())));
    table.register(Arc::new(GetFileChunkHandler::new(files)));
    table
}
