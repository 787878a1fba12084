//! Peer registry: identity, blacklist, and inbound admission.
//!
//! One registry instance is owned by the daemon and handed to both the
//! inbound endpoint and the outbound transfer coordinator. Peers are keyed
//! by IP address: the remote port of an inbound connection is ephemeral and
//! carries no identity.
//!
//! Admission and blacklisting share one lock so the inbound count can never
//! exceed the configured maximum, even when many first contacts race.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

/// Which side opened the relationship with a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerDirection {
    /// Seen, but not admitted as inbound and never dialed.
    #[default]
    Unknown,
    /// Admitted through the inbound endpoint; holds an inbound slot.
    Inbound,
    /// We connected to it.
    Outbound,
}

/// Everything the node tracks about one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerDescriptor {
    pub address: IpAddr,
    /// Set by the handshake.
    pub application: Option<String>,
    /// Set by the handshake. `None` means no handshake yet.
    pub version: Option<String>,
    pub blacklist_cause: Option<String>,
    pub direction: PeerDirection,
    #[serde(skip)]
    pub first_seen: Instant,
}

impl PeerDescriptor {
    fn new(address: IpAddr) -> Self {
        Self {
            address,
            application: None,
            version: None,
            blacklist_cause: None,
            direction: PeerDirection::Unknown,
            first_seen: Instant::now(),
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklist_cause.is_some()
    }

    pub fn has_handshake(&self) -> bool {
        self.version.is_some()
    }

    /// Admitted inbound or dialed outbound.
    pub fn is_active(&self) -> bool {
        self.direction != PeerDirection::Unknown
    }
}

/// Outcome of an inbound admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The peer already holds a slot, or we dialed it.
    AlreadyActive,
    /// A slot was taken for this peer.
    Admitted,
    /// All inbound slots are in use. The peer was not registered.
    Full,
}

#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<DashMap<IpAddr, PeerDescriptor>>,
    self_addresses: Arc<HashSet<IpAddr>>,
    max_inbound: usize,
    /// Number of peers in `PeerDirection::Inbound`. Every direction change
    /// into or out of `Inbound` happens while this is held.
    inbound: Arc<Mutex<usize>>,
    persist_path: Arc<Option<PathBuf>>,
    /// Serializes blacklist writes.
    persist_lock: Arc<Mutex<()>>,
}

impl PeerRegistry {
    pub fn new(max_inbound: usize) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            self_addresses: Arc::new(HashSet::new()),
            max_inbound,
            inbound: Arc::new(Mutex::new(0)),
            persist_path: Arc::new(None),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create a registry that persists the blacklist to the given file path.
    /// Loads existing entries from disk if the file exists.
    pub fn with_persistence(max_inbound: usize, path: PathBuf) -> Self {
        let registry = Self {
            persist_path: Arc::new(Some(path)),
            ..Self::new(max_inbound)
        };
        registry.load_from_disk();
        registry
    }

    /// Addresses that belong to this node. Requests from them are refused.
    pub fn with_self_addresses(mut self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        self.self_addresses = Arc::new(addresses.into_iter().collect());
        self
    }

    /// Look up a peer, creating a descriptor on first contact.
    ///
    /// Returns `None` for addresses that cannot be a remote peer.
    pub fn find_or_create(&self, address: IpAddr) -> Option<PeerDescriptor> {
        if address.is_unspecified() || self.self_addresses.contains(&address) {
            return None;
        }
        let entry = self.peers.entry(address).or_insert_with(|| {
            tracing::debug!(peer = %address, "new peer");
            PeerDescriptor::new(address)
        });
        Some(entry.value().clone())
    }

    pub fn get(&self, address: &IpAddr) -> Option<PeerDescriptor> {
        self.peers.get(address).map(|p| p.value().clone())
    }

    /// Record the outcome of a successful handshake.
    pub fn set_version(&self, address: IpAddr, application: &str, version: &str) {
        if let Some(mut peer) = self.peers.get_mut(&address) {
            peer.application = Some(application.to_string());
            peer.version = Some(version.to_string());
            tracing::debug!(peer = %address, application, version, "peer handshake recorded");
        }
    }

    /// Take an inbound slot for `address` unless it is already active.
    pub fn admit_inbound(&self, address: IpAddr) -> Admission {
        let mut inbound = self.lock_inbound();
        let Some(mut peer) = self.peers.get_mut(&address) else {
            return Admission::Full;
        };
        if peer.is_active() {
            return Admission::AlreadyActive;
        }
        if *inbound >= self.max_inbound {
            tracing::debug!(peer = %address, inbound = *inbound, "inbound peer limit reached");
            return Admission::Full;
        }
        peer.direction = PeerDirection::Inbound;
        *inbound += 1;
        tracing::info!(peer = %address, inbound = *inbound, "inbound peer added");
        Admission::Admitted
    }

    /// Mark a peer we dialed. Outbound peers do not take inbound slots.
    pub fn register_outbound(&self, address: IpAddr) {
        let mut inbound = self.lock_inbound();
        let mut peer = self
            .peers
            .entry(address)
            .or_insert_with(|| PeerDescriptor::new(address));
        if peer.direction == PeerDirection::Inbound {
            *inbound = inbound.saturating_sub(1);
        }
        peer.direction = PeerDirection::Outbound;
    }

    /// Blacklist a peer. An inbound peer gives up its slot.
    pub fn blacklist(&self, address: IpAddr, cause: impl Into<String>) {
        let cause = cause.into();
        {
            let mut inbound = self.lock_inbound();
            let mut peer = self
                .peers
                .entry(address)
                .or_insert_with(|| PeerDescriptor::new(address));
            if peer.direction == PeerDirection::Inbound {
                *inbound = inbound.saturating_sub(1);
                peer.direction = PeerDirection::Unknown;
            }
            peer.blacklist_cause = Some(cause.clone());
        }
        tracing::info!(peer = %address, cause = %cause, "peer blacklisted");
        self.save_to_disk();
    }

    /// Lift a blacklist entry.
    pub fn clear_blacklist(&self, address: &IpAddr) {
        let cleared = self
            .peers
            .get_mut(address)
            .map(|mut p| p.blacklist_cause.take().is_some())
            .unwrap_or(false);
        if cleared {
            tracing::info!(peer = %address, "peer removed from blacklist");
            self.save_to_disk();
        }
    }

    pub fn blacklist_cause(&self, address: &IpAddr) -> Option<String> {
        self.peers.get(address)?.blacklist_cause.clone()
    }

    pub fn is_blacklisted(&self, address: &IpAddr) -> bool {
        self.blacklist_cause(address).is_some()
    }

    pub fn inbound_count(&self) -> usize {
        *self.lock_inbound()
    }

    /// Admitted or dialed peers that are not blacklisted.
    pub fn active_peers(&self) -> Vec<PeerDescriptor> {
        self.peers
            .iter()
            .filter(|p| p.is_active() && !p.is_blacklisted())
            .map(|p| p.value().clone())
            .collect()
    }

    /// Every known peer that is not blacklisted.
    pub fn known_addresses(&self) -> Vec<IpAddr> {
        self.peers
            .iter()
            .filter(|p| !p.is_blacklisted())
            .map(|p| *p.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn lock_inbound(&self) -> MutexGuard<'_, usize> {
        // The guarded value is a plain counter; a panic elsewhere cannot
        // leave it half-updated.
        self.inbound.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PeerRegistry {
    /// Persist the blacklist as JSON. Best-effort, logs on failure.
    ///
    /// Inside a tokio runtime the write runs on the blocking pool. The
    /// snapshot is taken under `persist_lock` at write time, so the last
    /// write always holds the latest blacklist.
    fn save_to_disk(&self) {
        let Some(path) = self.persist_path.as_ref().clone() else {
            return;
        };
        let peers = Arc::clone(&self.peers);
        let lock = Arc::clone(&self.persist_lock);
        let save = move || {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            write_blacklist(&peers, &path);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(save)),
            Err(_) => save(),
        }
    }

    /// Load blacklist entries from disk. Best-effort, logs on failure.
    fn load_from_disk(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) => p,
            None => return,
        };
        if !path.exists() {
            return;
        }
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read blacklist");
                return;
            }
        };
        let snapshot: HashMap<String, String> = match serde_json::from_str(&text) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse blacklist");
                return;
            }
        };
        let mut loaded = 0usize;
        for (addr, cause) in snapshot {
            let Ok(address) = addr.parse::<IpAddr>() else {
                continue;
            };
            let mut peer = PeerDescriptor::new(address);
            peer.blacklist_cause = Some(cause);
            self.peers.insert(address, peer);
            loaded += 1;
        }
        tracing::info!(count = loaded, path = %path.display(), "loaded blacklist from disk");
    }
}

fn write_blacklist(peers: &DashMap<IpAddr, PeerDescriptor>, path: &Path) {
    let snapshot: HashMap<String, String> = peers
        .iter()
        .filter_map(|entry| {
            entry
                .blacklist_cause
                .as_ref()
                .map(|cause| (entry.key().to_string(), cause.clone()))
        })
        .collect();
    let json = match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize blacklist");
            return;
        }
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    if let Err(e) = std::fs::write(path, json) {
        tracing::warn!(error = %e, path = %path.display(), "failed to persist blacklist");
    }
}
