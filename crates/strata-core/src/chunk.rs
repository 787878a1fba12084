//! Chunk model: the unit of snapshot transfer.
//!
//! A target file is split into fixed-size byte ranges. Each range is
//! described by a `ChunkDescriptor` carrying its CRC32, so a chunk can be
//! fetched from any peer and verified independently of the others.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Size of every chunk except possibly the last one.
pub const CHUNK_SIZE: u64 = 32 * 1024; // 32KB

/// Transfer-time state of one chunk.
///
/// Ordinals matter: a chunk may be claimed only while its state compares
/// below `InProgress`, which re-admits `PresentInPeer` chunks for retry
/// through a different peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ChunkState {
    /// Nothing known about the chunk yet.
    #[default]
    Empty = 0,
    /// Some peer should have it, but the last attempt did not land.
    PresentInPeer = 1,
    /// Claimed by exactly one worker.
    InProgress = 2,
    /// Verified and written. Terminal.
    Saved = 3,
}

impl ChunkState {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Whether a worker may claim a chunk in this state.
    pub fn is_claimable(self) -> bool {
        self.ordinal() < ChunkState::InProgress.ordinal()
    }

    /// Validate a transition. `Saved` never moves; `InProgress` is
    /// entered only from a claimable state and left only for `Saved`
    /// or `PresentInPeer`.
    pub fn can_transition_to(self, next: ChunkState) -> bool {
        match (self, next) {
            (from, ChunkState::InProgress) => from.is_claimable(),
            (ChunkState::InProgress, ChunkState::Saved) => true,
            (ChunkState::InProgress, ChunkState::PresentInPeer) => true,
            _ => false,
        }
    }
}

/// Location and checksum of one chunk inside the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub chunk_id: u64,
    pub offset: u64,
    pub size: u64,
    pub crc: u32,
}

impl ChunkDescriptor {
    /// Check that `data` is exactly this chunk.
    pub fn verify(&self, data: &[u8]) -> Result<(), IntegrityError> {
        if data.len() as u64 != self.size {
            return Err(IntegrityError::Size {
                expected: self.size,
                actual: data.len() as u64,
            });
        }
        let actual = crc32(data);
        if actual != self.crc {
            return Err(IntegrityError::Crc {
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("chunk size mismatch: expected {expected}, got {actual}")]
    Size { expected: u64, actual: u64 },
    #[error("chunk crc mismatch: expected {expected:08x}, got {actual:08x}")]
    Crc { expected: u32, actual: u32 },
}

/// CRC32 (IEEE) of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Whole-file facts a peer advertises for a downloadable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: String,
    pub size: u64,
    /// Hex-encoded BLAKE3 hash of the complete file.
    pub hash: String,
    pub chunk_size: u64,
}

/// Negotiated download metadata: the file and its chunk layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadInfo {
    pub file_info: FileInfo,
    pub chunks: Vec<ChunkDescriptor>,
}

/// The immutable, peer-agnostic layout of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    file_id: String,
    total_bytes: u64,
    chunks: Vec<ChunkDescriptor>,
}

impl TransferPlan {
    pub fn new(file_id: impl Into<String>, chunks: Vec<ChunkDescriptor>) -> Self {
        let total_bytes = chunks.iter().map(|c| c.size).sum();
        Self {
            file_id: file_id.into(),
            total_bytes,
            chunks,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Sum of all chunk sizes, which is the final size of the target file.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl From<FileDownloadInfo> for TransferPlan {
    fn from(info: FileDownloadInfo) -> Self {
        TransferPlan::new(info.file_info.file_id, info.chunks)
    }
}

/// Split `data` into descriptors of at most `chunk_size` bytes.
pub fn describe_chunks(data: &[u8], chunk_size: u64) -> Vec<ChunkDescriptor> {
    let step = chunk_size.max(1) as usize;
    data.chunks(step)
        .enumerate()
        .map(|(i, block)| ChunkDescriptor {
            chunk_id: i as u64,
            offset: (i * step) as u64,
            size: block.len() as u64,
            crc: crc32(block),
        })
        .collect()
}

/// A fetched chunk: where it belongs and its decoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub file_id: String,
    pub descriptor: ChunkDescriptor,
    pub data: Bytes,
}

/// Completion signal for one transfer run. Exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    /// Every chunk is saved. The target file is present locally.
    TargetPresent { file_id: String },
    /// The run ended with chunks missing.
    TransferFailed { file_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_ordered() {
        assert!(ChunkState::Empty < ChunkState::PresentInPeer);
        assert!(ChunkState::PresentInPeer < ChunkState::InProgress);
        assert!(ChunkState::InProgress < ChunkState::Saved);
        assert_eq!(ChunkState::Saved.ordinal(), 3);
    }

    #[test]
    fn claim_eligibility_readmits_present_in_peer() {
        assert!(ChunkState::Empty.is_claimable());
        assert!(ChunkState::PresentInPeer.is_claimable());
        assert!(!ChunkState::InProgress.is_claimable());
        assert!(!ChunkState::Saved.is_claimable());
    }

    #[test]
    fn saved_is_terminal() {
        for next in [
            ChunkState::Empty,
            ChunkState::PresentInPeer,
            ChunkState::InProgress,
            ChunkState::Saved,
        ] {
            assert!(!ChunkState::Saved.can_transition_to(next));
        }
        assert!(ChunkState::InProgress.can_transition_to(ChunkState::Saved));
        assert!(ChunkState::InProgress.can_transition_to(ChunkState::PresentInPeer));
        assert!(!ChunkState::Empty.can_transition_to(ChunkState::Saved));
    }

    #[test]
    fn describe_chunks_covers_file() {
        let data = vec![7u8; 100];
        let chunks = describe_chunks(&data, 32);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].offset, 96);
        assert_eq!(chunks[3].size, 4);
        assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), 100);

        let plan = TransferPlan::new("f", chunks);
        assert_eq!(plan.total_bytes(), 100);
    }

    #[test]
    fn verify_rejects_bad_crc_and_size() {
        let data = b"chunk payload";
        let desc = describe_chunks(data, CHUNK_SIZE)[0];
        assert!(desc.verify(data).is_ok());
        assert!(matches!(
            desc.verify(b"chunk paylaod"),
            Err(IntegrityError::Crc { .. })
        ));
        assert!(matches!(
            desc.verify(b"short"),
            Err(IntegrityError::Size { .. })
        ));
    }
}
