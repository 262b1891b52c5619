//! Link table: per-link configuration and live state.
//!
//! A link is *active* when it is enabled in the configuration and its
//! transport is attached. Only active links take part in fragmentation and
//! in the receive low-water mark. Each active link tracks the highest
//! sequence number received on it; since a single link delivers fragments
//! in order, nothing older than that value can still arrive on it.

use crate::config::{LinkConfig, MAX_LINKS};
use crate::sequence::{Seq, SeqMode};
use std::time::{Duration, Instant};

/// Index of a link within its bundle.
pub type LinkId = usize;

/// Queued bytes are forgotten when the last write is older than this.
pub const QUEUE_FORGET_AFTER: Duration = Duration::from_secs(10);

/// Microseconds per unit of (bytes / bandwidth), with bandwidth in 10 bytes/sec.
const US_PER_BYTE_UNIT: u64 = 100_000;

/// One physical link of a bundle.
#[derive(Debug, Clone)]
pub struct Link {
    id: LinkId,
    config: LinkConfig,
    /// Transport present for this link.
    attached: bool,
    /// Highest sequence number received; `None` while inactive.
    highest_recv_seq: Option<Seq>,
    /// Bytes handed to the transport and not yet assumed drained.
    bytes_in_queue: u64,
    /// When `bytes_in_queue` was last brought up to date.
    last_write: Option<Instant>,
}

impl Link {
    fn new(id: LinkId) -> Self {
        Self {
            id,
            config: LinkConfig::default(),
            attached: true,
            highest_recv_seq: None,
            bytes_in_queue: 0,
            last_write: None,
        }
    }

    /// Link id.
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Committed configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Returns true if the link's transport is attached.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Returns true if the link is enabled and attached.
    pub fn is_active(&self) -> bool {
        self.config.enabled && self.attached
    }

    /// Highest sequence number received on this link.
    pub fn highest_recv_seq(&self) -> Option<Seq> {
        self.highest_recv_seq
    }

    /// Bytes assumed to be still waiting in the transmit queue.
    pub fn bytes_in_queue(&self) -> u64 {
        self.bytes_in_queue
    }

    /// When the link was last written to.
    pub fn last_write(&self) -> Option<Instant> {
        self.last_write
    }

    pub(crate) fn set_highest_recv_seq(&mut self, seq: Seq) {
        self.highest_recv_seq = Some(seq);
    }

    /// Account for a frame handed to the transport.
    pub(crate) fn record_write(&mut self, octets: usize, now: Instant) {
        self.drain(now);
        self.bytes_in_queue += octets as u64;
        self.last_write = Some(now);
    }

    /// Latency a new byte would see on this link, in microseconds.
    ///
    /// Configured latency plus the time to drain whatever is still queued at
    /// the link's bandwidth.
    pub fn effective_latency_us(&mut self, now: Instant) -> u64 {
        self.drain(now);
        let base = u64::from(self.config.latency_ms) * 1000;
        let bandwidth = u64::from(self.config.bandwidth.max(1));
        base + self.bytes_in_queue * US_PER_BYTE_UNIT / bandwidth
    }

    /// Remove the bytes the link could have sent since the last update.
    fn drain(&mut self, now: Instant) {
        if self.bytes_in_queue == 0 {
            return;
        }
        let Some(last) = self.last_write else {
            self.bytes_in_queue = 0;
            return;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= QUEUE_FORGET_AFTER {
            self.bytes_in_queue = 0;
            return;
        }
        let sent = u64::from(self.config.bandwidth) * elapsed.as_micros() as u64 / US_PER_BYTE_UNIT;
        if sent > 0 {
            self.bytes_in_queue = self.bytes_in_queue.saturating_sub(sent);
            self.last_write = Some(now);
        }
    }

    fn clear_transient(&mut self) {
        self.highest_recv_seq = None;
        self.bytes_in_queue = 0;
        self.last_write = None;
    }
}

/// All links of a bundle plus the derived active set.
#[derive(Debug, Clone)]
pub struct LinkTable {
    links: Vec<Link>,
    /// Active link ids in ascending order.
    active: Vec<LinkId>,
    /// All active links share bandwidth and latency.
    all_equal: bool,
}

impl Default for LinkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkTable {
    /// Table of `MAX_LINKS` disabled, attached links.
    pub fn new() -> Self {
        Self {
            links: (0..MAX_LINKS).map(Link::new).collect(),
            active: Vec::new(),
            all_equal: true,
        }
    }

    /// Link by id.
    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(id)
    }

    /// Active link ids in ascending order.
    pub fn active(&self) -> &[LinkId] {
        &self.active
    }

    /// Returns true if `id` is an active link.
    pub fn is_active(&self, id: LinkId) -> bool {
        self.links.get(id).is_some_and(Link::is_active)
    }

    /// Returns true if every active link has the same bandwidth and latency.
    pub fn all_equal(&self) -> bool {
        self.all_equal
    }

    /// Iterate over active links.
    pub fn iter_active(&self) -> impl Iterator<Item = &Link> {
        self.active.iter().map(|&id| &self.links[id])
    }

    /// Number of links that would be active under `configs` with today's
    /// attachments.
    pub fn count_active_with(&self, configs: &[LinkConfig]) -> usize {
        self.links
            .iter()
            .filter(|link| link.attached && configs.get(link.id).is_some_and(|c| c.enabled))
            .count()
    }

    /// Number of links that would be active if `id` changed attachment.
    pub fn count_active_if_attached(&self, id: LinkId, attached: bool) -> usize {
        self.links
            .iter()
            .filter(|link| {
                let is_attached = if link.id == id { attached } else { link.attached };
                is_attached && link.config.enabled
            })
            .count()
    }

    /// Install link configurations. Links beyond `configs` become disabled.
    pub(crate) fn apply_config(&mut self, configs: &[LinkConfig]) {
        for link in &mut self.links {
            link.config = configs.get(link.id).copied().unwrap_or_default();
        }
    }

    pub(crate) fn set_attached(&mut self, id: LinkId, attached: bool) {
        if let Some(link) = self.links.get_mut(id) {
            link.attached = attached;
        }
    }

    /// Rebuild the active set.
    ///
    /// Newly active links start with `mseq` as their highest received
    /// sequence so they never pull the low-water mark backwards. Inactive
    /// links lose their receive state.
    pub(crate) fn refresh_active(&mut self, mseq: Seq) {
        self.active.clear();
        self.all_equal = true;
        let mut reference: Option<LinkConfig> = None;

        for link in &mut self.links {
            if !link.is_active() {
                link.highest_recv_seq = None;
                continue;
            }
            self.active.push(link.id);
            match reference {
                None => reference = Some(link.config),
                Some(first) => {
                    if first.bandwidth != link.config.bandwidth
                        || first.latency_ms != link.config.latency_ms
                    {
                        self.all_equal = false;
                    }
                }
            }
            if link.highest_recv_seq.is_none() {
                link.highest_recv_seq = Some(mseq);
            }
        }
    }

    /// Forget receive and transmit state on every link.
    pub(crate) fn clear_transient(&mut self) {
        for link in &mut self.links {
            link.clear_transient();
        }
    }

    /// Minimum highest-received sequence over active links.
    pub fn low_water(&self, mode: SeqMode) -> Option<Seq> {
        self.iter_active()
            .filter_map(|link| link.highest_recv_seq)
            .reduce(|min, seq| if mode.diff(seq, min) < 0 { seq } else { min })
    }

    /// Move every active link that is behind `mseq` up to it.
    pub(crate) fn raise_lagging(&mut self, mode: SeqMode, mseq: Seq) {
        for &id in &self.active {
            let link = &mut self.links[id];
            if let Some(seq) = link.highest_recv_seq {
                if mode.diff(seq, mseq) < 0 {
                    link.highest_recv_seq = Some(mseq);
                }
            }
        }
    }
}
