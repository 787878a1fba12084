//! `getFileChunk`: serve one chunk of a local file.
//!
//! A chunk we do not hold is answered with `fileChunk: null`, which the
//! requesting side treats as a miss rather than an error.

use strata_core::wire::{ChunkPayload, RequestType, FILE_CHUNK_KEY, FILE_ID_KEY};
use strata_core::{Envelope, PeerResponse};

use crate::files::DownloadableFiles;
use crate::handler::{HandlerError, RequestHandler};
use crate::registry::PeerDescriptor;

pub struct GetFileChunkHandler {
    files: DownloadableFiles,
}

impl GetFileChunkHandler {
    pub fn new(files: DownloadableFiles) -> Self {
        Self { files }
    }
}

impl RequestHandler for GetFileChunkHandler {
    fn request_type(&self) -> RequestType {
        RequestType::GetFileChunk
    }

    fn process(
        &self,
        request: &Envelope,
        peer: &PeerDescriptor,
    ) -> Result<PeerResponse, HandlerError> {
        let file_id: String = request.field(FILE_ID_KEY)?;
        let chunk_id: u64 = request.field("chunkId")?;
        let offset: Option<u64> = request.optional_field("offset")?;

        let chunk = self
            .files
            .read_chunk(&file_id, chunk_id)?
            // A stale layout on the requester's side is answered as a miss.
            .filter(|c| offset.map_or(true, |o| o == c.descriptor.offset));

        if chunk.is_none() {
            tracing::debug!(peer = %peer.address, file_id = %file_id, chunk_id, "chunk not held");
        }
        let payload = chunk.as_ref().map(ChunkPayload::encode);
        Ok(PeerResponse::new().with_serialized(FILE_CHUNK_KEY, &payload))
    }
}
