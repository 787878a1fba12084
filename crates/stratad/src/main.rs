//! Strata peer transport daemon.

use std::net::IpAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use strata_core::config::StrataConfig;
use strata_services::{
    standard_table, DownloadableFiles, NodeInfo, NodeState, PeerConnectionEndpoint, PeerRegistry,
    TaskRegistry,
};

mod bootstrap;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = StrataConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = StrataConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        StrataConfig::default()
    });
    tracing::info!(
        name = %config.node.name,
        listen = %config.network.listen_addr,
        light_client = config.node.light_client,
        "stratad starting"
    );

    // Peer registry
    let self_addresses: Vec<IpAddr> = config
        .node
        .self_addresses
        .iter()
        .filter_map(|a| match a.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(addr = %a, "ignoring invalid self address");
                None
            }
        })
        .collect();
    let max_inbound = config.network.max_inbound_peers;
    let registry = match config.blacklist_path() {
        Some(path) => PeerRegistry::with_persistence(max_inbound, path.to_path_buf()),
        None => {
            tracing::info!("blacklist persistence disabled");
            PeerRegistry::new(max_inbound)
        }
    }
    .with_self_addresses(self_addresses);

    let node = NodeState::new(config.node.light_client);

    let files = DownloadableFiles::new(&config.transfer.storage_path).with_context(|| {
        format!(
            "failed to open storage at {}",
            config.transfer.storage_path.display()
        )
    })?;
    tracing::info!(path = %files.root().display(), "file storage ready");

    let info = NodeInfo::new(&config.node.name, config.node.light_client);
    let table = standard_table(registry.clone(), files.clone(), info.clone());
    tracing::info!(handlers = table.len(), "request handlers registered");

    let workers = config.request_workers();
    let endpoint = PeerConnectionEndpoint::new(registry.clone(), table, node.clone(), workers)
        .with_max_request_bytes(config.network.max_request_bytes);

    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let server_task = {
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(strata_net::serve(endpoint, listener, async move {
            let _ = shutdown.recv().await;
        }))
    };

    let _bootstrap_task = {
        let bootstrap = bootstrap::Bootstrap {
            config: config.clone(),
            registry: registry.clone(),
            node: node.clone(),
            files: files.clone(),
            info,
            tasks: TaskRegistry::new(),
        };
        tokio::spawn(async move {
            if let Err(e) = bootstrap.run().await {
                tracing::error!(error = %e, "bootstrap download failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = server_task        => tracing::error!("peer endpoint exited: {:?}", r),
    }

    Ok(())
}
