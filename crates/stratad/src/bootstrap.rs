//! Startup snapshot download.
//!
//! Ask every configured peer for the file's download info, keep the peers
//! that agree with the majority hash, and download the file from them.
//! The node reports itself as downloading for the duration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use strata_core::config::StrataConfig;
use strata_core::{FileDownloadInfo, TransferEvent, TransferPlan};
use strata_net::HttpPeerClient;
use strata_services::{
    hash_file, ChunkedFile, ChunkedTransferCoordinator, DownloadableFiles, NodeInfo, NodeState,
    PeerRegistry, RankedPeer, TaskRegistry,
};

pub struct Bootstrap {
    pub config: StrataConfig,
    pub registry: PeerRegistry,
    pub node: NodeState,
    pub files: DownloadableFiles,
    pub info: NodeInfo,
    pub tasks: TaskRegistry,
}

impl Bootstrap {
    pub async fn run(self) -> Result<()> {
        let Some(file_id) = self.config.bootstrap.file_id.clone() else {
            tracing::debug!("no bootstrap file configured");
            return Ok(());
        };
        if self.files.download_info(&file_id)?.is_some() {
            tracing::info!(file_id = %file_id, "bootstrap file already present");
            return Ok(());
        }

        self.node.set_downloading(true);
        let result = self.download(&file_id).await;
        self.node.set_downloading(false);
        result
    }

    async fn download(&self, file_id: &str) -> Result<()> {
        let timeout = Duration::from_secs(self.config.network.request_timeout_secs);
        let mut candidates = Vec::new();
        for peer in &self.config.bootstrap.peers {
            let client = match HttpPeerClient::connect(peer, &self.registry, &self.info, timeout).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "bootstrap peer unavailable");
                    continue;
                }
            };
            let addr = client.peer();
            match client.download_info(file_id).await {
                Ok(Some(info)) => {
                    tracing::debug!(peer = %addr, file_id, hash = %info.file_info.hash, "peer serves file");
                    candidates.push((client, info));
                }
                Ok(None) => tracing::debug!(peer = %addr, file_id, "peer does not serve file"),
                Err(e) => tracing::warn!(peer = %addr, error = %e, "download info request failed"),
            }
        }

        let (info, peers) = rank_by_hash(candidates)
            .with_context(|| format!("no peer serves {file_id}"))?;
        tracing::info!(
            file_id,
            hash = %info.file_info.hash,
            size = info.file_info.size,
            peers = peers.len(),
            "bootstrap download starting"
        );

        let part = self
            .files
            .part_path(file_id)
            .with_context(|| format!("invalid file id: {file_id}"))?;
        let plan = TransferPlan::from(info.clone());
        let writer = Arc::new(
            ChunkedFile::create(&part, plan.total_bytes())
                .with_context(|| format!("failed to create {}", part.display()))?,
        );

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let coordinator = ChunkedTransferCoordinator::new(
            self.registry.clone(),
            Arc::new(self.tasks.clone()),
            events_tx,
        );
        let handle = coordinator.start(
            plan,
            peers,
            self.config.transfer.parallelism,
            writer.clone(),
        )?;
        let status = handle.wait().await?;
        if let Some(event) = events.recv().await {
            tracing::debug!(?event, "transfer event");
            if !matches!(event, TransferEvent::TargetPresent { .. }) {
                bail!("transfer of {file_id} did not complete");
            }
        }

        writer.sync()?;
        let expected = info.file_info.hash.clone();
        let part_path = part.clone();
        let actual = tokio::task::spawn_blocking(move || hash_file(&part_path)).await??;
        if actual != expected {
            let _ = std::fs::remove_file(&part);
            bail!("downloaded {file_id} hash {actual} does not match {expected}");
        }

        let path = self.files.promote(file_id)?;
        tracing::info!(file_id, chunks = status.total, path = %path.display(), "bootstrap file ready");
        Ok(())
    }
}

/// Keep the peers whose file hash the most peers agree on. Peers in that
/// group are scored by group size; ties between groups go to the group
/// seen first.
pub fn rank_by_hash<C>(
    candidates: Vec<(C, FileDownloadInfo)>,
) -> Option<(FileDownloadInfo, Vec<RankedPeer<C>>)> {
    let mut groups: Vec<(FileDownloadInfo, Vec<C>)> = Vec::new();
    for (client, info) in candidates {
        match groups.iter_mut().find(|(seen, _)| same_file(seen, &info)) {
            Some((_, members)) => members.push(client),
            None => groups.push((info, vec![client])),
        }
    }

    let mut best: Option<(FileDownloadInfo, Vec<C>)> = None;
    for group in groups {
        if best.as_ref().map_or(true, |(_, b)| group.1.len() > b.len()) {
            best = Some(group);
        }
    }
    let (info, members) = best?;
    let score = members.len() as u64;
    let peers = members
        .into_iter()
        .map(|client| RankedPeer::new(client, score))
        .collect();
    Some((info, peers))
}

fn same_file(a: &FileDownloadInfo, b: &FileDownloadInfo) -> bool {
    a.file_info.hash == b.file_info.hash && a.file_info.size == b.file_info.size
}
