//! Bundle and link statistics.
//!
//! Every drop, duplicate, runt and forced advance increments a counter so the
//! engine's behaviour is auditable without any of those events being fatal.
//! Counters are atomics shared behind an `Arc`, so the stats endpoint can
//! read them from another thread while the bundle task updates them.

mod server;

pub use server::{StatsServer, DEFAULT_STATS_PORT};

use crate::config::MAX_LINKS;
use crate::link::LinkId;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Frame and fragment counters for one link, or totals for a bundle.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Fragments sent.
    pub xmit_frames: AtomicU64,
    /// Bytes sent, headers included.
    pub xmit_octets: AtomicU64,
    /// Fragments received.
    pub recv_frames: AtomicU64,
    /// Bytes received, headers included.
    pub recv_octets: AtomicU64,
    /// Frames too short for an MP header.
    pub runts: AtomicU64,
    /// Fragments whose sequence number was already queued.
    pub dup_fragments: AtomicU64,
    /// Fragments discarded without being delivered.
    pub drop_fragments: AtomicU64,
}

impl LinkStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent fragment.
    pub fn record_xmit(&self, octets: usize) {
        self.xmit_frames.fetch_add(1, Ordering::Relaxed);
        self.xmit_octets.fetch_add(octets as u64, Ordering::Relaxed);
    }

    /// Record a received fragment.
    pub fn record_recv(&self, octets: usize) {
        self.recv_frames.fetch_add(1, Ordering::Relaxed);
        self.recv_octets.fetch_add(octets as u64, Ordering::Relaxed);
    }

    /// Record a runt frame.
    pub fn record_runt(&self) {
        self.runts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duplicate fragment.
    pub fn record_duplicate(&self) {
        self.dup_fragments.fetch_add(1, Ordering::Relaxed);
    }

    /// Record dropped fragments.
    pub fn record_drops(&self, count: u64) {
        self.drop_fragments.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            xmit_frames: self.xmit_frames.load(Ordering::Relaxed),
            xmit_octets: self.xmit_octets.load(Ordering::Relaxed),
            recv_frames: self.recv_frames.load(Ordering::Relaxed),
            recv_octets: self.recv_octets.load(Ordering::Relaxed),
            runts: self.runts.load(Ordering::Relaxed),
            dup_fragments: self.dup_fragments.load(Ordering::Relaxed),
            drop_fragments: self.drop_fragments.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn clear(&self) {
        for counter in [
            &self.xmit_frames,
            &self.xmit_octets,
            &self.recv_frames,
            &self.recv_octets,
            &self.runts,
            &self.dup_fragments,
            &self.drop_fragments,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Plain copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatsSnapshot {
    pub xmit_frames: u64,
    pub xmit_octets: u64,
    pub recv_frames: u64,
    pub recv_octets: u64,
    pub runts: u64,
    pub dup_fragments: u64,
    pub drop_fragments: u64,
}

/// Statistics for a bundle: totals, per-link counters and liveness events.
#[derive(Debug)]
pub struct BundleStats {
    /// Bundle name used in logs and the stats endpoint.
    name: String,
    /// When the bundle was created.
    start_time: Instant,
    /// Totals over all links plus bundle-level drops.
    pub totals: LinkStats,
    /// Counters attributable to a single link, indexed by link id.
    links: Vec<LinkStats>,
    /// Datagrams delivered upward.
    pub delivered: AtomicU64,
    /// Datagrams delivered by the staleness reclaimer.
    pub stale_deliveries: AtomicU64,
    /// Times MSEQ was forced forward (queue bound or staleness).
    pub forced_advances: AtomicU64,
}

impl BundleStats {
    /// Create zeroed statistics for a bundle.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_time: Instant::now(),
            totals: LinkStats::new(),
            links: (0..MAX_LINKS).map(|_| LinkStats::new()).collect(),
            delivered: AtomicU64::new(0),
            stale_deliveries: AtomicU64::new(0),
            forced_advances: AtomicU64::new(0),
        }
    }

    /// Bundle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counters for one link, if the id is in range.
    pub fn link(&self, id: LinkId) -> Option<&LinkStats> {
        self.links.get(id)
    }

    /// Record a fragment sent on `link`.
    pub fn record_xmit(&self, link: LinkId, octets: usize) {
        self.totals.record_xmit(octets);
        if let Some(stats) = self.link(link) {
            stats.record_xmit(octets);
        }
    }

    /// Record a frame received on `link`.
    pub fn record_recv(&self, link: LinkId, octets: usize) {
        self.totals.record_recv(octets);
        if let Some(stats) = self.link(link) {
            stats.record_recv(octets);
        }
    }

    /// Record a runt frame received on `link`.
    pub fn record_runt(&self, link: LinkId) {
        self.totals.record_runt();
        if let Some(stats) = self.link(link) {
            stats.record_runt();
        }
    }

    /// Record a duplicate fragment received on `link`.
    pub fn record_duplicate(&self, link: LinkId) {
        self.totals.record_duplicate();
        if let Some(stats) = self.link(link) {
            stats.record_duplicate();
        }
    }

    /// Record a fragment dropped from the queue, attributing it to `link`.
    pub fn record_drop(&self, link: Option<LinkId>) {
        self.totals.record_drops(1);
        if let Some(stats) = link.and_then(|id| self.link(id)) {
            stats.record_drops(1);
        }
    }

    /// Record a datagram delivered upward.
    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a datagram forced out by the staleness reclaimer.
    pub fn record_stale_delivery(&self) {
        self.stale_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record MSEQ being forced forward.
    pub fn record_forced_advance(&self) {
        self.forced_advances.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since the bundle was created.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Zero every counter.
    pub fn clear(&self) {
        self.totals.clear();
        for link in &self.links {
            link.clear();
        }
        self.delivered.store(0, Ordering::Relaxed);
        self.stale_deliveries.store(0, Ordering::Relaxed);
        self.forced_advances.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    ///
    /// Links that never saw traffic are omitted.
    pub fn snapshot(&self) -> BundleStatsSnapshot {
        let links = self
            .links
            .iter()
            .enumerate()
            .map(|(id, stats)| (id, stats.snapshot()))
            .filter(|(_, snap)| *snap != LinkStatsSnapshot::default())
            .map(|(id, stats)| LinkStatsEntry { id, stats })
            .collect();
        BundleStatsSnapshot {
            name: self.name.clone(),
            uptime_secs: self.uptime_secs(),
            totals: self.totals.snapshot(),
            delivered: self.delivered.load(Ordering::Relaxed),
            stale_deliveries: self.stale_deliveries.load(Ordering::Relaxed),
            forced_advances: self.forced_advances.load(Ordering::Relaxed),
            links,
        }
    }

    /// Serialize a snapshot to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Counters of one link inside a [`BundleStatsSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatsEntry {
    pub id: LinkId,
    #[serde(flatten)]
    pub stats: LinkStatsSnapshot,
}

/// Plain copy of [`BundleStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleStatsSnapshot {
    pub name: String,
    pub uptime_secs: u64,
    pub totals: LinkStatsSnapshot,
    pub delivered: u64,
    pub stale_deliveries: u64,
    pub forced_advances: u64,
    pub links: Vec<LinkStatsEntry>,
}
