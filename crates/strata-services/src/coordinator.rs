//! Chunked transfer coordinator. Downloads one file from several peers.
//!
//! Each selected peer gets one worker. Workers claim chunks from a shared
//! state list, fetch them from their own peer, verify them, and write them
//! at their offset. The run ends once every worker has exited, and it
//! succeeds iff every chunk is saved.
//!
//! Claim and settle happen under one mutex over the chunk states; the ready
//! counter is an atomic so status reads never wait on chunk I/O.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};

use strata_core::chunk::IntegrityError;
use strata_core::{ChunkDescriptor, ChunkState, ErrorCode, FileChunk, TransferEvent, TransferPlan};

use crate::files::{ChunkWriter, WriteError};
use crate::registry::PeerRegistry;
use crate::status::{TaskId, TaskReporter};

/// Failed verify/write attempts a worker makes on one chunk before leaving
/// it to the other peers.
const MAX_ATTEMPTS_PER_CHUNK: u32 = 3;

/// Progress is pushed each time completion crosses a multiple of this.
const PROGRESS_STEP_PERCENT: usize = 5;

// ── Collaborators ─────────────────────────────────────────────────────────────

/// Failure fetching a chunk from a peer.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The peer went away. Not its fault, no penalty.
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The peer answered with an error code, e.g. it is syncing itself.
    #[error("peer refused request: {0}")]
    Rejected(ErrorCode),
    /// The payload did not match its descriptor. Chunk-scoped.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Outbound chunk source. `Ok(None)` means the peer does not hold the chunk.
pub trait PeerClient: Send + Sync + 'static {
    fn address(&self) -> IpAddr;

    fn fetch_chunk(
        &self,
        file_id: &str,
        chunk: &ChunkDescriptor,
    ) -> impl Future<Output = Result<Option<FileChunk>, FetchError>> + Send;
}

/// A candidate peer with the caller's suitability score. Higher is better.
pub struct RankedPeer<C> {
    pub client: C,
    pub score: u64,
}

impl<C> RankedPeer<C> {
    pub fn new(client: C, score: u64) -> Self {
        Self { client, score }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no peers available")]
    NoPeersAvailable,
    #[error("parallelism must be at least 1")]
    InvalidParallelism,
    #[error("transfer plan has no chunks")]
    EmptyPlan,
    #[error("transfer of {0} is already running")]
    AlreadyRunning(String),
    #[error("transfer incomplete: {ready} of {total} chunks saved")]
    Incomplete { ready: usize, total: usize },
    #[error("transfer cancelled: {ready} of {total} chunks saved")]
    Cancelled { ready: usize, total: usize },
    #[error("transfer aborted: {0}")]
    Aborted(String),
}

/// Snapshot of one run's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub file_id: String,
    pub total: usize,
    pub ready: usize,
    /// Percent of chunks saved. Exactly 100 iff `ready == total`.
    pub completed: f64,
}

impl TransferStatus {
    pub fn is_complete(&self) -> bool {
        self.ready == self.total
    }
}

fn percent(ready: usize, total: usize) -> f64 {
    if ready >= total {
        100.0
    } else {
        ready as f64 * 100.0 / total as f64
    }
}

// ── Run state ─────────────────────────────────────────────────────────────────

struct TransferRun {
    plan: TransferPlan,
    chunks: Mutex<Vec<ChunkState>>,
    ready: AtomicUsize,
    cancelled: AtomicBool,
    finished: AtomicBool,
    /// Last reported progress step. Held while reporting so updates are
    /// delivered in order.
    reported_step: Mutex<usize>,
    /// Signalled whenever a chunk leaves `InProgress` or the run is cancelled.
    changed: Notify,
    reporter: Arc<dyn TaskReporter>,
    task: TaskId,
}

enum Claim<'a> {
    Chunk(ClaimedChunk<'a>),
    /// Nothing claimable now, but another worker holds a chunk that may
    /// come back.
    Wait,
    Done,
}

/// A chunk held `InProgress` by one worker. Dropping it without `save`
/// returns the chunk to `PresentInPeer`, including on panic.
struct ClaimedChunk<'a> {
    run: &'a TransferRun,
    index: usize,
    settled: bool,
}

impl ClaimedChunk<'_> {
    fn descriptor(&self) -> ChunkDescriptor {
        self.run.plan.chunks()[self.index]
    }

    fn save(mut self) {
        self.settled = true;
        self.run.settle(self.index, ChunkState::Saved);
    }
}

impl Drop for ClaimedChunk<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.run.settle(self.index, ChunkState::PresentInPeer);
        }
    }
}

impl TransferRun {
    fn new(plan: TransferPlan, reporter: Arc<dyn TaskReporter>, task: TaskId) -> Self {
        let chunks = vec![ChunkState::Empty; plan.len()];
        Self {
            plan,
            chunks: Mutex::new(chunks),
            ready: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            reported_step: Mutex::new(0),
            changed: Notify::new(),
            reporter,
            task,
        }
    }

    fn lock_chunks(&self) -> MutexGuard<'_, Vec<ChunkState>> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn total(&self) -> usize {
        self.plan.len()
    }

    fn is_complete(&self) -> bool {
        self.ready.load(Ordering::SeqCst) >= self.total()
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn status(&self) -> TransferStatus {
        let total = self.total();
        let ready = self.ready.load(Ordering::SeqCst).min(total);
        TransferStatus {
            file_id: self.plan.file_id().to_string(),
            total,
            ready,
            completed: percent(ready, total),
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::info!(file_id = self.plan.file_id(), "transfer cancelled");
        }
        self.changed.notify_waiters();
    }

    /// Claim the first claimable chunk not in `skip`.
    fn claim(&self, skip: &HashSet<usize>) -> Claim<'_> {
        if self.cancelled.load(Ordering::SeqCst) || self.is_complete() {
            return Claim::Done;
        }
        let mut chunks = self.lock_chunks();
        let mut held_elsewhere = false;
        for (index, state) in chunks.iter_mut().enumerate() {
            if skip.contains(&index) {
                continue;
            }
            if state.is_claimable() {
                *state = ChunkState::InProgress;
                return Claim::Chunk(ClaimedChunk {
                    run: self,
                    index,
                    settled: false,
                });
            }
            held_elsewhere |= *state == ChunkState::InProgress;
        }
        if held_elsewhere {
            Claim::Wait
        } else {
            Claim::Done
        }
    }

    /// Next chunk for a worker, waiting while other workers hold the rest.
    async fn next_claim(&self, skip: &HashSet<usize>) -> Option<ClaimedChunk<'_>> {
        loop {
            // Registered before the scan so a release in between is not lost.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            match self.claim(skip) {
                Claim::Chunk(chunk) => return Some(chunk),
                Claim::Done => return None,
                Claim::Wait => changed.await,
            }
        }
    }

    fn settle(&self, index: usize, next: ChunkState) {
        {
            let mut chunks = self.lock_chunks();
            let current = chunks[index];
            if !current.can_transition_to(next) {
                tracing::error!(index, ?current, ?next, "illegal chunk transition refused");
                return;
            }
            chunks[index] = next;
        }
        if next == ChunkState::Saved {
            self.ready.fetch_add(1, Ordering::SeqCst);
            self.report_progress();
        }
        self.changed.notify_waiters();
    }

    fn report_progress(&self) {
        let mut reported = self.reported_step.lock().unwrap_or_else(|e| e.into_inner());
        let total = self.total();
        let ready = self.ready.load(Ordering::SeqCst).min(total);
        let step = ready * 100 / total / PROGRESS_STEP_PERCENT;
        if step > *reported {
            *reported = step;
            self.reporter.update(
                self.task,
                percent(ready, total),
                &format!("File downloading: {}...", self.plan.file_id()),
            );
        }
    }

    /// Emit the run's single terminal signal.
    fn conclude(
        &self,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<TransferStatus, TransferError> {
        let status = self.status();
        let file_id = status.file_id.clone();
        let result = if status.is_complete() {
            tracing::info!(file_id = %file_id, chunks = status.total, "transfer complete");
            self.reporter.finish(
                self.task,
                false,
                &format!("File downloading finished: {file_id}"),
            );
            Ok(status)
        } else {
            let (ready, total) = (status.ready, status.total);
            let err = if self.cancelled.load(Ordering::SeqCst) {
                TransferError::Cancelled { ready, total }
            } else {
                TransferError::Incomplete { ready, total }
            };
            tracing::warn!(file_id = %file_id, ready, total, "transfer failed");
            self.reporter.finish(self.task, true, &err.to_string());
            Err(err)
        };
        let event = match &result {
            Ok(_) => TransferEvent::TargetPresent {
                file_id: file_id.clone(),
            },
            Err(_) => TransferEvent::TransferFailed {
                file_id: file_id.clone(),
            },
        };
        if events.send(event).is_err() {
            tracing::debug!(file_id = %file_id, "no listener for transfer events");
        }
        self.finished.store(true, Ordering::SeqCst);
        result
    }
}

// ── Workers ───────────────────────────────────────────────────────────────────

async fn run_worker<C: PeerClient>(
    run: Arc<TransferRun>,
    client: C,
    writer: Arc<dyn ChunkWriter>,
    registry: PeerRegistry,
) {
    let peer = client.address();
    let file_id = run.plan.file_id().to_string();
    let mut skip = HashSet::new();
    let mut failures: HashMap<usize, u32> = HashMap::new();
    let mut saved = 0usize;

    while let Some(claimed) = run.next_claim(&skip).await {
        let index = claimed.index;
        let descriptor = claimed.descriptor();

        let failure = match client.fetch_chunk(&file_id, &descriptor).await {
            Ok(Some(chunk)) => match store(&writer, &descriptor, chunk.data).await {
                Ok(()) => {
                    claimed.save();
                    saved += 1;
                    tracing::trace!(%peer, chunk_id = descriptor.chunk_id, "chunk saved");
                    continue;
                }
                Err(e) => e.to_string(),
            },
            Ok(None) => {
                tracing::debug!(%peer, chunk_id = descriptor.chunk_id, "peer does not hold chunk");
                skip.insert(index);
                continue;
            }
            Err(FetchError::Integrity(e)) => e.to_string(),
            Err(FetchError::Closed) => {
                tracing::debug!(%peer, "peer closed connection, worker stopping");
                break;
            }
            Err(FetchError::Rejected(code)) => {
                tracing::info!(%peer, %code, "peer refused chunk request, worker stopping");
                break;
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "chunk fetch failed, worker stopping");
                registry.blacklist(peer, e.to_string());
                break;
            }
        };

        let attempts = failures.entry(index).or_insert(0);
        *attempts += 1;
        tracing::debug!(
            %peer,
            chunk_id = descriptor.chunk_id,
            attempts = *attempts,
            error = %failure,
            "chunk attempt failed"
        );
        if *attempts >= MAX_ATTEMPTS_PER_CHUNK {
            skip.insert(index);
        }
    }

    tracing::debug!(%peer, file_id = %file_id, saved, "transfer worker finished");
}

/// Verify a fetched chunk and write it on the blocking pool.
async fn store(
    writer: &Arc<dyn ChunkWriter>,
    descriptor: &ChunkDescriptor,
    data: Bytes,
) -> Result<(), ChunkFailure> {
    descriptor.verify(&data)?;
    let writer = Arc::clone(writer);
    let (offset, crc) = (descriptor.offset, descriptor.crc);
    tokio::task::spawn_blocking(move || writer.write_at(offset, &data, crc))
        .await
        .map_err(|e| WriteError::Io(io::Error::other(e)))??;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum ChunkFailure {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

// ── Coordinator ───────────────────────────────────────────────────────────────

/// Runs chunked downloads, one at a time.
pub struct ChunkedTransferCoordinator {
    registry: PeerRegistry,
    reporter: Arc<dyn TaskReporter>,
    events: mpsc::UnboundedSender<TransferEvent>,
    current: Mutex<Option<Arc<TransferRun>>>,
}

impl ChunkedTransferCoordinator {
    pub fn new(
        registry: PeerRegistry,
        reporter: Arc<dyn TaskReporter>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            registry,
            reporter,
            events,
            current: Mutex::new(None),
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Arc<TransferRun>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start downloading `plan` from the best `parallelism` peers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: PeerClient>(
        &self,
        plan: TransferPlan,
        peers: Vec<RankedPeer<C>>,
        parallelism: usize,
        writer: Arc<dyn ChunkWriter>,
    ) -> Result<TransferHandle, TransferError> {
        if parallelism == 0 {
            return Err(TransferError::InvalidParallelism);
        }
        if peers.is_empty() {
            return Err(TransferError::NoPeersAvailable);
        }
        if plan.is_empty() {
            return Err(TransferError::EmptyPlan);
        }

        let mut current = self.lock_current();
        if let Some(run) = current.as_ref().filter(|r| !r.is_finished()) {
            return Err(TransferError::AlreadyRunning(run.plan.file_id().to_string()));
        }

        let selected = select_peers(peers, parallelism);
        let task = self.reporter.start(
            "download",
            &format!("File downloading: {}", plan.file_id()),
            true,
        );
        let run = Arc::new(TransferRun::new(plan, Arc::clone(&self.reporter), task));
        *current = Some(Arc::clone(&run));
        drop(current);

        tracing::info!(
            file_id = run.plan.file_id(),
            chunks = run.total(),
            bytes = run.plan.total_bytes(),
            peers = selected.len(),
            "transfer started"
        );

        let mut workers = JoinSet::new();
        for peer in selected {
            workers.spawn(run_worker(
                Arc::clone(&run),
                peer.client,
                Arc::clone(&writer),
                self.registry.clone(),
            ));
        }

        let events = self.events.clone();
        let driver = Arc::clone(&run);
        let result = tokio::spawn(async move {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "transfer worker panicked");
                }
            }
            driver.conclude(&events)
        });

        Ok(TransferHandle { run, result })
    }

    /// Progress of the current or most recent run.
    pub fn status(&self) -> Option<TransferStatus> {
        self.lock_current().as_ref().map(|run| run.status())
    }

    /// Stop the current run from claiming further chunks.
    pub fn cancel(&self) {
        if let Some(run) = self.lock_current().as_ref() {
            run.cancel();
        }
    }
}

/// Highest score first. Ties keep the caller's order.
fn select_peers<C>(mut peers: Vec<RankedPeer<C>>, parallelism: usize) -> Vec<RankedPeer<C>> {
    peers.sort_by(|a, b| b.score.cmp(&a.score));
    peers.truncate(parallelism);
    peers
}

/// Handle to a started run.
pub struct TransferHandle {
    run: Arc<TransferRun>,
    result: JoinHandle<Result<TransferStatus, TransferError>>,
}

impl TransferHandle {
    pub fn file_id(&self) -> &str {
        self.run.plan.file_id()
    }

    pub fn status(&self) -> TransferStatus {
        self.run.status()
    }

    pub fn cancel(&self) {
        self.run.cancel();
    }

    /// Resolve once every worker has exited.
    pub async fn wait(self) -> Result<TransferStatus, TransferError> {
        match self.result.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Aborted(e.to_string())),
        }
    }
}
