//! Local snapshot files: serving chunks to peers and writing downloads.
//!
//! Downloadable files live flat under one storage root, named by file id:
//!   {storage}/{file_id}
//!
//! A download in progress is written to `{file_id}.part` and renamed into
//! place once every chunk is saved, so a half-written file is never served.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use strata_core::chunk::{crc32, CHUNK_SIZE};
use strata_core::{ChunkDescriptor, FileChunk, FileDownloadInfo, FileInfo};

const PART_EXTENSION: &str = "part";

/// Files this node can serve, with their chunk layout cached per file id.
#[derive(Clone)]
pub struct DownloadableFiles {
    root: PathBuf,
    infos: Arc<DashMap<String, FileDownloadInfo>>,
}

impl DownloadableFiles {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            infos: Arc::new(DashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of a file id. `None` for ids that could escape the root.
    pub fn path_for(&self, file_id: &str) -> Option<PathBuf> {
        is_valid_file_id(file_id).then(|| self.root.join(file_id))
    }

    /// Where an in-progress download of `file_id` is written.
    pub fn part_path(&self, file_id: &str) -> Option<PathBuf> {
        self.path_for(file_id)
            .map(|_| self.root.join(format!("{file_id}.{PART_EXTENSION}")))
    }

    /// Chunk layout and hash of a local file, computed on first request.
    pub fn download_info(&self, file_id: &str) -> io::Result<Option<FileDownloadInfo>> {
        if let Some(info) = self.infos.get(file_id) {
            return Ok(Some(info.clone()));
        }
        let Some(path) = self.path_for(file_id) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let info = describe_file(file_id, &path, CHUNK_SIZE)?;
        tracing::debug!(
            file_id,
            size = info.file_info.size,
            chunks = info.chunks.len(),
            "computed file download info"
        );
        self.infos.insert(file_id.to_string(), info.clone());
        Ok(Some(info))
    }

    /// Read one chunk of a local file. `None` if the file or chunk is unknown.
    pub fn read_chunk(&self, file_id: &str, chunk_id: u64) -> io::Result<Option<FileChunk>> {
        let Some(info) = self.download_info(file_id)? else {
            return Ok(None);
        };
        let Some(descriptor) = info.chunks.iter().find(|c| c.chunk_id == chunk_id).copied() else {
            return Ok(None);
        };
        let Some(path) = self.path_for(file_id) else {
            return Ok(None);
        };
        let file = File::open(&path)?;
        let mut data = vec![0u8; descriptor.size as usize];
        read_exact_at(&file, &mut data, descriptor.offset)?;
        Ok(Some(FileChunk {
            file_id: file_id.to_string(),
            descriptor,
            data: Bytes::from(data),
        }))
    }

    /// Move a completed download into place and forget any stale layout.
    pub fn promote(&self, file_id: &str) -> io::Result<PathBuf> {
        let (Some(part), Some(target)) = (self.part_path(file_id), self.path_for(file_id)) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file id: {file_id}"),
            ));
        };
        fs::rename(&part, &target)?;
        self.infos.remove(file_id);
        tracing::info!(file_id, path = %target.display(), "download promoted");
        Ok(target)
    }
}

/// File ids are single path components made of safe characters. Names of
/// in-progress downloads are not ids.
pub fn is_valid_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && !file_id
            .strip_suffix(PART_EXTENSION)
            .is_some_and(|stem| stem.ends_with('.'))
        && file_id != "."
        && file_id != ".."
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Hex-encoded BLAKE3 hash of a whole file.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Stream a file once, producing its chunk layout and BLAKE3 hash.
fn describe_file(file_id: &str, path: &Path, chunk_size: u64) -> io::Result<FileDownloadInfo> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; chunk_size as usize];
    let mut offset = 0u64;

    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        hasher.update(block);
        chunks.push(ChunkDescriptor {
            chunk_id: chunks.len() as u64,
            offset,
            size: n as u64,
            crc: crc32(block),
        });
        offset += n as u64;
        if n < buf.len() {
            break;
        }
    }

    Ok(FileDownloadInfo {
        file_info: FileInfo {
            file_id: file_id.to_string(),
            size: offset,
            hash: hasher.finalize().to_hex().to_string(),
            chunk_size,
        },
        chunks,
    })
}

/// Fill `buf` as far as the file allows.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Chunk writing ─────────────────────────────────────────────────────────────

/// Failure writing one chunk into the target file.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("chunk crc mismatch: expected {expected:08x}, got {actual:08x}")]
    Integrity { expected: u32, actual: u32 },
    #[error("chunk write failed: {0}")]
    Io(#[from] io::Error),
}

/// Local storage for a transfer. Writers are shared by all workers of a
/// run; callers guarantee that concurrent writes never overlap.
pub trait ChunkWriter: Send + Sync + 'static {
    fn write_at(&self, offset: u64, data: &[u8], expected_crc: u32) -> Result<(), WriteError>;
}

/// A preallocated target file written with positional writes.
pub struct ChunkedFile {
    path: PathBuf,
    file: File,
}

impl ChunkedFile {
    /// Open (or create) `path` and size it to `total_bytes`.
    pub fn create(path: impl Into<PathBuf>, total_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(total_bytes)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush written chunks to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl ChunkWriter for ChunkedFile {
    fn write_at(&self, offset: u64, data: &[u8], expected_crc: u32) -> Result<(), WriteError> {
        let actual = crc32(data);
        if actual != expected_crc {
            return Err(WriteError::Integrity {
                expected: expected_crc,
                actual,
            });
        }
        write_all_at(&self.file, data, offset)?;
        Ok(())
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                data = &data[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
