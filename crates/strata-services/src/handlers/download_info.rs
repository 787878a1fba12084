//! `getFileDownloadInfo`: chunk layout of a file we can serve.

use strata_core::wire::{RequestType, FILE_DOWNLOAD_INFO_KEY, FILE_ID_KEY};
use strata_core::{Envelope, PeerResponse};

use crate::files::DownloadableFiles;
use crate::handler::{HandlerError, RequestHandler};
use crate::registry::PeerDescriptor;

pub struct GetFileDownloadInfoHandler {
    files: DownloadableFiles,
}

impl GetFileDownloadInfoHandler {
    pub fn new(files: DownloadableFiles) -> Self {
        Self { files }
    }
}

impl RequestHandler for GetFileDownloadInfoHandler {
    fn request_type(&self) -> RequestType {
        RequestType::GetFileDownloadInfo
    }

    fn process(
        &self,
        request: &Envelope,
        peer: &PeerDescriptor,
    ) -> Result<PeerResponse, HandlerError> {
        let file_id: String = request.field(FILE_ID_KEY)?;
        let info = self.files.download_info(&file_id)?;
        tracing::debug!(peer = %peer.address, file_id = %file_id, found = info.is_some(), "download info requested");
        Ok(PeerResponse::new().with_serialized(FILE_DOWNLOAD_INFO_KEY, &info))
    }
}
