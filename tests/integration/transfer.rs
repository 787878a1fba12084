use std::sync::Arc;

use tokio::sync::mpsc;

use strata_core::chunk::CHUNK_SIZE;
use strata_core::wire::{file_chunk_request, RequestType, FILE_CHUNK_KEY, FILE_ID_KEY};
use strata_core::{Envelope, TransferEvent, TransferPlan};
use strata_net::HttpPeerClient;
use strata_services::status::TaskPhase;
use strata_services::{
    hash_file, ChunkedFile, ChunkedTransferCoordinator, NodeInfo, PeerRegistry, RankedPeer,
    TaskRegistry,
};

use crate::*;

/// A file larger than a few chunks, with a short tail chunk.
fn multi_chunk_len() -> usize {
    (CHUNK_SIZE as usize) * 4 + 1234
}

/// Full download path: handshake, download info, parallel chunk fetches
/// over HTTP, positional writes. The reassembled file matches the source.
#[tokio::test]
async fn test_download_file_from_two_seeds() -> Result<()> {
    let data = sample_data(multi_chunk_len());
    let seed_a = TestNode::spawn("seed-a").await?;
    let seed_b = TestNode::spawn("seed-b").await?;
    seed_a.serve_file("shard-1", &data)?;
    seed_b.serve_file("shard-1", &data)?;

    let registry = PeerRegistry::new(8);
    let info = NodeInfo::new("strata-it", false);
    let mut peers = Vec::new();
    let mut layout = None;
    for seed in [&seed_a, &seed_b] {
        let client =
            HttpPeerClient::connect(&seed.addr.to_string(), &registry, &info, REQUEST_TIMEOUT)
                .await?;
        layout = client.download_info("shard-1").await?;
        peers.push(RankedPeer::new(client, 1));
    }
    let layout = layout.context("seed did not describe shard-1")?;
    assert_eq!(layout.file_info.size, data.len() as u64);
    assert_eq!(layout.chunks.len(), 5);

    let target = scratch_dir("download-two-seeds");
    std::fs::create_dir_all(&target)?;
    let path = target.join("shard-1");
    let plan = TransferPlan::from(layout.clone());
    let writer = Arc::new(ChunkedFile::create(&path, plan.total_bytes())?);

    let tasks = TaskRegistry::new();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let coordinator =
        ChunkedTransferCoordinator::new(registry.clone(), Arc::new(tasks.clone()), events_tx);
    let handle = coordinator.start(plan, peers, 6, writer.clone())?;
    let status = handle.wait().await?;

    assert!(status.is_complete());
    assert_eq!(status.ready, 5);
    assert_eq!(
        events.recv().await,
        Some(TransferEvent::TargetPresent {
            file_id: "shard-1".into()
        })
    );
    assert!(events.try_recv().is_err(), "exactly one completion event");

    writer.sync()?;
    assert_eq!(std::fs::read(&path)?, data);
    assert_eq!(hash_file(&path)?, layout.file_info.hash);
    assert!(!registry.is_blacklisted(&LOOPBACK));

    let finished = tasks.tasks();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].phase, TaskPhase::Finished);
    assert_eq!(finished[0].percent, 100.0);

    std::fs::remove_dir_all(&target)?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_file_has_no_download_info() -> Result<()> {
    let seed = TestNode::spawn("no-file").await?;
    let registry = PeerRegistry::new(8);
    let client = HttpPeerClient::connect(
        &seed.addr.to_string(),
        &registry,
        &NodeInfo::new("strata-it", false),
        REQUEST_TIMEOUT,
    )
    .await?;

    assert!(client.download_info("shard-9").await?.is_none());
    // Path-escaping ids are never served.
    assert!(client.download_info("../etc").await?.is_none());
    Ok(())
}

/// A chunk request whose offset disagrees with the local layout is a miss.
#[tokio::test]
async fn test_stale_chunk_offset_is_a_miss() -> Result<()> {
    let data = sample_data(multi_chunk_len());
    let seed = TestNode::spawn("stale-offset").await?;
    seed.serve_file("shard-2", &data)?;
    seed.handshake().await?;

    let layout = seed
        .files
        .download_info("shard-2")?
        .context("shard-2 should be served")?;
    let good = seed.post(&file_chunk_request("shard-2", &layout.chunks[1])).await?;
    let chunk = &good[FILE_CHUNK_KEY];
    assert_eq!(chunk["chunkId"], 1);
    assert_eq!(chunk["offset"], CHUNK_SIZE);

    let stale = Envelope::request(RequestType::GetFileChunk)
        .with_field(FILE_ID_KEY, "shard-2")
        .with_field("chunkId", 1)
        .with_field("offset", 7);
    let resp = seed.post(&stale).await?;
    assert!(resp[FILE_CHUNK_KEY].is_null(), "got {resp}");
    assert!(error_of(&resp).is_none());
    Ok(())
}

/// Peers that serve nothing leave the run incomplete and signal failure.
#[tokio::test]
async fn test_download_from_peer_without_file_fails() -> Result<()> {
    let data = sample_data(multi_chunk_len());
    let seed = TestNode::spawn("seed-full").await?;
    let empty = TestNode::spawn("seed-empty").await?;
    seed.serve_file("shard-4", &data)?;
    let layout = seed
        .files
        .download_info("shard-4")?
        .context("shard-4 should be served")?;

    let registry = PeerRegistry::new(8);
    let client = HttpPeerClient::connect(
        &empty.addr.to_string(),
        &registry,
        &NodeInfo::new("strata-it", false),
        REQUEST_TIMEOUT,
    )
    .await?;

    let target = scratch_dir("download-missing");
    std::fs::create_dir_all(&target)?;
    let plan = TransferPlan::from(layout);
    let writer = Arc::new(ChunkedFile::create(target.join("shard-4"), plan.total_bytes())?);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let coordinator =
        ChunkedTransferCoordinator::new(registry, Arc::new(TaskRegistry::new()), events_tx);
    let handle = coordinator.start(plan, vec![RankedPeer::new(client, 1)], 3, writer)?;

    let result = handle.wait().await;
    assert!(result.is_err(), "an empty peer cannot complete the file");
    assert_eq!(
        events.recv().await,
        Some(TransferEvent::TransferFailed {
            file_id: "shard-4".into()
        })
    );

    std::fs::remove_dir_all(&target)?;
    Ok(())
}
