//! A multilink bundle: configuration, link table, transmit and receive state.
//!
//! `Bundle` is plain single-owner state. Every operation takes `&mut self`,
//! so the inbound path, the reclaimer and the fragmenter are mutually
//! exclusive by construction. [`crate::engine`] runs a bundle inside a task
//! and feeds it from a channel.

use crate::config::{check_transition, ConfigError, NodeConfig, MAX_LINKS};
use crate::error::{MpError, TransportError, Violation};
use crate::fragmenter::{Fragmenter, OutboundFragment};
use crate::header::MpHeader;
use crate::link::{LinkId, LinkTable};
use crate::reassembly::{DatagramSink, Reassembler, ReassemblyLimits, RxContext};
use crate::sequence::{Seq, SeqMode};
use crate::stats::BundleStats;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Downward interface to the per-link transports.
pub trait LinkTransport {
    /// Send one encoded fragment (MP header and payload) on `link`.
    fn send_fragment(&mut self, link: LinkId, frame: Vec<u8>) -> Result<(), TransportError>;
}

impl LinkTransport for Vec<(LinkId, Vec<u8>)> {
    fn send_fragment(&mut self, link: LinkId, frame: Vec<u8>) -> Result<(), TransportError> {
        self.push((link, frame));
        Ok(())
    }
}

/// Point-in-time view of one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub id: LinkId,
    pub attached: bool,
    pub highest_recv_seq: Option<Seq>,
    pub bytes_in_queue: u64,
}

/// Point-in-time view of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleState {
    pub name: String,
    pub running: bool,
    pub multilink: bool,
    pub active_links: Vec<LinkId>,
    pub all_links_equal: bool,
    pub xmit_mode: SeqMode,
    pub recv_mode: SeqMode,
    pub xseq: Seq,
    pub mseq: Seq,
    pub queue_len: usize,
    pub links: Vec<LinkState>,
}

/// One logical connection over up to [`MAX_LINKS`] links.
#[derive(Debug)]
pub struct Bundle {
    config: NodeConfig,
    links: LinkTable,
    tx: Fragmenter,
    rx: Reassembler,
    stats: Arc<BundleStats>,
}

impl Bundle {
    /// Create a bundle with default reassembly limits.
    pub fn new(name: impl Into<String>, config: NodeConfig) -> Result<Self, MpError> {
        Self::with_limits(name, config, ReassemblyLimits::default())
    }

    /// Create a bundle with custom queue bound and reclaimer timing.
    pub fn with_limits(
        name: impl Into<String>,
        config: NodeConfig,
        limits: ReassemblyLimits,
    ) -> Result<Self, MpError> {
        let initial = NodeConfig::default();
        let mut bundle = Self {
            tx: Fragmenter::new(initial.bundle.xmit_mode()),
            rx: Reassembler::new(initial.bundle.recv_mode(), limits),
            config: initial,
            links: LinkTable::new(),
            stats: Arc::new(BundleStats::new(name)),
        };
        bundle.configure(config)?;
        Ok(bundle)
    }

    /// Bundle name.
    pub fn name(&self) -> &str {
        self.stats.name()
    }

    /// Committed configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Link table.
    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Shared statistics.
    pub fn stats(&self) -> &Arc<BundleStats> {
        &self.stats
    }

    /// Queue bound and reclaimer timing.
    pub fn limits(&self) -> &ReassemblyLimits {
        self.rx.limits()
    }

    /// Returns true if multilink is enabled and at least one link is active.
    pub fn is_running(&self) -> bool {
        self.config.bundle.enable_multilink && !self.links.active().is_empty()
    }

    /// Next outbound sequence number.
    pub fn xseq(&self) -> Seq {
        self.tx.xseq()
    }

    /// Receive low-water mark.
    pub fn mseq(&self) -> Seq {
        self.rx.mseq()
    }

    /// Number of fragments waiting for reassembly.
    pub fn queue_len(&self) -> usize {
        self.rx.len()
    }

    /// Reassembly queue, for inspection.
    pub fn reassembler(&self) -> &Reassembler {
        &self.rx
    }

    /// Validate and commit a new configuration.
    ///
    /// On error nothing changes. Going idle (multilink off or no active
    /// link) resets sequence numbers and drops all queued fragments.
    pub fn configure(&mut self, config: NodeConfig) -> Result<(), MpError> {
        let active_now = self.links.active().len();
        let active_next = self.links.count_active_with(&config.links);
        if let Err(e) = check_transition(&self.config, active_now, &config, active_next) {
            warn!("{}: configuration rejected: {}", self.name(), e);
            return Err(e.into());
        }

        let was_running = self.is_running();
        self.config = config;
        self.links.apply_config(&self.config.links);
        self.recompute(was_running);

        info!(
            "{}: configured, multilink {}, {} active links, xmit {} recv {}",
            self.name(),
            if self.config.bundle.enable_multilink { "on" } else { "off" },
            self.links.active().len(),
            self.tx.mode(),
            self.rx.mode()
        );
        Ok(())
    }

    /// Mark a link's transport as present.
    pub fn attach_link(&mut self, link: LinkId) -> Result<(), MpError> {
        self.set_attached(link, true)
    }

    /// Mark a link's transport as gone.
    pub fn detach_link(&mut self, link: LinkId) -> Result<(), MpError> {
        self.set_attached(link, false)
    }

    fn set_attached(&mut self, link: LinkId, attached: bool) -> Result<(), MpError> {
        if link >= MAX_LINKS {
            return Err(MpError::UnknownLink(link));
        }
        let active = self.links.count_active_if_attached(link, attached);
        if !self.config.bundle.enable_multilink && active > 1 {
            return Err(ConfigError::TooManyActiveLinks { active }.into());
        }

        let was_running = self.is_running();
        self.links.set_attached(link, attached);
        self.recompute(was_running);
        debug!(
            "{}: link {} {}, {} active",
            self.name(),
            link,
            if attached { "attached" } else { "detached" },
            self.links.active().len()
        );
        Ok(())
    }

    /// Rebuild the active set after a configuration or attachment change.
    fn recompute(&mut self, was_running: bool) {
        self.links.refresh_active(self.rx.mseq());
        if !was_running || !self.is_running() {
            self.reset_state();
        }
    }

    /// Return to initial sequence numbers with an empty queue.
    fn reset_state(&mut self) {
        let dropped = self.rx.len();
        self.tx.reset(self.config.bundle.xmit_mode());
        self.rx.reset(self.config.bundle.recv_mode());
        self.links.clear_transient();
        self.links.refresh_active(self.rx.mseq());
        if dropped > 0 {
            debug!("{}: reset, {} queued fragments dropped", self.name(), dropped);
            self.stats.totals.record_drops(dropped as u64);
        }
    }

    /// Split a datagram into fragments without sending them.
    ///
    /// Sequence numbers are consumed.
    pub fn fragment(
        &mut self,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Vec<OutboundFragment>, MpError> {
        if !self.config.bundle.enable_multilink {
            return Err(MpError::MultilinkDisabled);
        }
        self.tx.fragment(
            &mut self.links,
            self.config.bundle.enable_round_robin,
            datagram,
            now,
        )
    }

    /// Fragment a datagram and send it on the links.
    ///
    /// Returns the number of fragments sent. A fragment larger than its
    /// link's MRU fails the datagram before anything is sent. If the
    /// transport fails, the remaining fragments are not sent. Either way the
    /// datagram's sequence numbers stay consumed.
    pub fn send<T: LinkTransport + ?Sized>(
        &mut self,
        datagram: &[u8],
        transport: &mut T,
        now: Instant,
    ) -> Result<usize, MpError> {
        let fragments = self.fragment(datagram, now)?;
        let mode = self.tx.mode();
        let count = fragments.len();

        let frames: Vec<(LinkId, Vec<u8>)> = fragments
            .iter()
            .map(|frag| (frag.link, frag.encode(mode)))
            .collect();
        for (link, frame) in &frames {
            let mru = self.links.get(*link).map_or(0, |l| l.config().mru);
            if frame.len() > usize::from(mru) {
                warn!(
                    "{}: {} byte frame exceeds link {} MRU {}, abandoning datagram",
                    self.name(),
                    frame.len(),
                    link,
                    mru
                );
                return Err(MpError::FrameTooLarge {
                    link: *link,
                    len: frame.len(),
                    mru,
                });
            }
        }

        for ((link, frame), frag) in frames.into_iter().zip(&fragments) {
            let octets = frame.len();
            if let Err(source) = transport.send_fragment(link, frame) {
                warn!(
                    "{}: send on link {} failed at seq {}, abandoning datagram: {}",
                    self.name(),
                    link,
                    frag.seq(),
                    source
                );
                return Err(MpError::Send { link, source });
            }
            if let Some(l) = self.links.get_mut(link) {
                l.record_write(octets, now);
            }
            self.stats.record_xmit(link, octets);
        }
        Ok(count)
    }

    /// Handle one frame received on `link`.
    ///
    /// Reassembled datagrams are handed to `sink`. Rejected fragments are
    /// counted and reported as errors; the bundle keeps running.
    pub fn receive<S: DatagramSink + ?Sized>(
        &mut self,
        link: LinkId,
        frame: &[u8],
        now: Instant,
        sink: &mut S,
    ) -> Result<(), MpError> {
        if !self.config.bundle.enable_multilink {
            return Err(MpError::MultilinkDisabled);
        }
        if !self.links.is_active(link) {
            return Err(MpError::UnknownLink(link));
        }
        self.stats.record_recv(link, frame.len());

        let (header, payload) = match MpHeader::decode(self.rx.mode(), frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("{}: link {}: {}", self.name(), link, e);
                self.stats.record_runt(link);
                return Err(Violation::Runt { len: frame.len() }.into());
            }
        };

        let mut ctx = RxContext {
            links: &mut self.links,
            stats: &*self.stats,
            sink,
            now,
        };
        self.rx.receive(&mut ctx, link, header, payload)
    }

    /// Run the staleness reclaimer.
    pub fn reclaim<S: DatagramSink + ?Sized>(&mut self, now: Instant, sink: &mut S) {
        if !self.is_running() {
            return;
        }
        let mut ctx = RxContext {
            links: &mut self.links,
            stats: &*self.stats,
            sink,
            now,
        };
        self.rx.process(&mut ctx);
    }

    /// Point-in-time view of the bundle.
    pub fn snapshot(&self) -> BundleState {
        BundleState {
            name: self.name().to_string(),
            running: self.is_running(),
            multilink: self.config.bundle.enable_multilink,
            active_links: self.links.active().to_vec(),
            all_links_equal: self.links.all_equal(),
            xmit_mode: self.tx.mode(),
            recv_mode: self.rx.mode(),
            xseq: self.tx.xseq(),
            mseq: self.rx.mseq(),
            queue_len: self.rx.len(),
            links: self
                .links
                .iter_active()
                .map(|link| LinkState {
                    id: link.id(),
                    attached: link.is_attached(),
                    highest_recv_seq: link.highest_recv_seq(),
                    bytes_in_queue: link.bytes_in_queue(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, MIN_MRRU};
    use crate::reassembly::{initial_mseq, STALE_AFTER};
    use rand_core::RngCore;
    use std::collections::VecDeque;

    /// Seeded xorshift64, so a failing interleaving replays from its seed.
    struct SeededRng(u64);

    impl RngCore for SeededRng {
        fn next_u32(&mut self) -> u32 {
            (self.next_u64() >> 32) as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    const SHUFFLE_SEEDS: [u64; 4] = [1, 0x5eed, 0xdead_beef, 0x0123_4567_89ab_cdef];

    fn pair(links: Vec<LinkConfig>) -> (Bundle, Bundle) {
        let config = NodeConfig::multilink(links);
        let limits = ReassemblyLimits {
            max_queue_len: 4096,
            ..Default::default()
        };
        (
            Bundle::new("tx", config.clone()).unwrap(),
            Bundle::with_limits("rx", config, limits).unwrap(),
        )
    }

    fn datagrams(count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let len = 1 + (i * 397) % 1400;
                (0..len).map(|j| (i + j) as u8).collect()
            })
            .collect()
    }

    /// Interleave per-link frame queues randomly, keeping each link's order.
    fn shuffle_links(
        frames: Vec<(LinkId, Vec<u8>)>,
        rng: &mut impl RngCore,
    ) -> Vec<(LinkId, Vec<u8>)> {
        let mut per_link: Vec<VecDeque<Vec<u8>>> = vec![VecDeque::new(); MAX_LINKS];
        for (link, frame) in frames {
            per_link[link].push_back(frame);
        }
        let mut out = Vec::new();
        loop {
            let pending: Vec<LinkId> = (0..MAX_LINKS)
                .filter(|&l| !per_link[l].is_empty())
                .collect();
            if pending.is_empty() {
                return out;
            }
            let link = pending[rng.next_u32() as usize % pending.len()];
            if let Some(frame) = per_link[link].pop_front() {
                out.push((link, frame));
            }
        }
    }

    fn round_trip(links: Vec<LinkConfig>, round_robin: bool) {
        for seed in SHUFFLE_SEEDS {
            round_trip_seeded(links.clone(), round_robin, seed);
        }
    }

    fn round_trip_seeded(links: Vec<LinkConfig>, round_robin: bool, seed: u64) {
        let (mut tx, mut rx) = pair(links);
        if round_robin {
            let mut config = tx.config().clone();
            config.bundle.enable_round_robin = true;
            tx.configure(config).unwrap();
        }
        let input = datagrams(60);
        let now = Instant::now();

        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();
        for datagram in &input {
            tx.send(datagram, &mut wire, now).unwrap();
        }

        let mode = rx.config().bundle.recv_mode();
        let mut delivered: Vec<Vec<u8>> = Vec::new();
        let mut last_mseq = rx.mseq();
        for (link, frame) in shuffle_links(wire, &mut SeededRng(seed)) {
            rx.receive(link, &frame, now, &mut delivered).unwrap();

            assert!(mode.diff(rx.mseq(), last_mseq) >= 0, "seed {:#x}", seed);
            for l in rx.links().iter_active() {
                assert!(
                    mode.diff(l.highest_recv_seq().unwrap(), rx.mseq()) >= 0,
                    "seed {:#x}",
                    seed
                );
            }
            assert_eq!(rx.reassembler().invariant_violation(), None, "seed {:#x}", seed);
            last_mseq = rx.mseq();
        }

        // Links that carried nothing at the end pin MSEQ; the reclaimer
        // releases whatever is left, still in order
        rx.reclaim(now + STALE_AFTER, &mut delivered);
        assert!(delivered == input, "seed {:#x}", seed);
        assert_eq!(rx.queue_len(), 0, "seed {:#x}", seed);
        assert_eq!(rx.stats().totals.snapshot().drop_fragments, 0, "seed {:#x}", seed);
    }

    #[test]
    fn test_shuffle_replays_from_seed() {
        let frames: Vec<(LinkId, Vec<u8>)> = (0..40u8).map(|i| ((i % 3) as LinkId, vec![i])).collect();
        let a = shuffle_links(frames.clone(), &mut SeededRng(0x5eed));
        let b = shuffle_links(frames.clone(), &mut SeededRng(0x5eed));
        assert_eq!(a, b);

        // Per-link order survives the interleaving
        for link in 0..3 {
            let order: Vec<u8> = a.iter().filter(|(l, _)| *l == link).map(|(_, f)| f[0]).collect();
            assert!(order.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_new_bundle_idle() {
        let bundle = Bundle::new("idle", NodeConfig::default()).unwrap();
        assert!(!bundle.is_running());
        assert_eq!(bundle.xseq(), 0);
        assert_eq!(bundle.mseq(), initial_mseq(SeqMode::Long));
        assert_eq!(bundle.name(), "idle");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0)]);
        config.bundle.mrru = MIN_MRRU - 1;
        assert!(matches!(
            Bundle::new("bad", config),
            Err(MpError::ConfigurationInvalid(ConfigError::MrruTooSmall { .. }))
        ));
    }

    #[test]
    fn test_round_trip_equal_links() {
        round_trip(vec![LinkConfig::enabled(100, 0); 3], false);
    }

    #[test]
    fn test_round_trip_optimal() {
        round_trip(
            vec![
                LinkConfig::enabled(100, 0),
                LinkConfig::enabled(300, 5),
                LinkConfig::enabled(50, 20),
            ],
            false,
        );
    }

    #[test]
    fn test_round_trip_round_robin() {
        round_trip(
            vec![LinkConfig::enabled(100, 0), LinkConfig::enabled(100, 0)],
            true,
        );
    }

    #[test]
    fn test_round_trip_short_sequence_wraps() {
        let mut config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0); 2]);
        config.bundle.xmit_short_seq = true;
        config.bundle.recv_short_seq = true;
        let mut tx = Bundle::new("tx", config.clone()).unwrap();
        let mut rx = Bundle::new("rx", config).unwrap();
        let now = Instant::now();

        // 2500 datagrams of two fragments each wrap the 12-bit space
        let mut delivered: Vec<Vec<u8>> = Vec::new();
        for i in 0..2500u32 {
            let datagram = vec![i as u8; 100];
            let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();
            tx.send(&datagram, &mut wire, now).unwrap();
            for (link, frame) in wire.into_iter().rev() {
                rx.receive(link, &frame, now, &mut delivered).unwrap();
            }
            assert_eq!(delivered.last(), Some(&datagram));
        }
        assert_eq!(delivered.len(), 2500);
        assert_eq!(tx.xseq(), 5000 % 4096);
    }

    #[test]
    fn test_configure_rejected_atomically() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0); 2]);
        let mut bundle = Bundle::new("b", config.clone()).unwrap();
        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();
        bundle.send(&[7u8; 200], &mut wire, Instant::now()).unwrap();
        let before = bundle.snapshot();

        let mut bad = config.clone();
        bad.links.push(LinkConfig::enabled(0, 0));
        assert!(matches!(
            bundle.configure(bad),
            Err(MpError::ConfigurationInvalid(ConfigError::ZeroBandwidth { link: 2 }))
        ));

        let mut mode_change = config.clone();
        mode_change.bundle.xmit_short_seq = true;
        assert!(matches!(
            bundle.configure(mode_change),
            Err(MpError::ConfigurationInvalid(ConfigError::ChangeWhileActive(_)))
        ));

        assert_eq!(bundle.snapshot(), before);
        assert_eq!(bundle.config(), &config);
    }

    #[test]
    fn test_adding_link_keeps_sequence_state() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0)]);
        let mut bundle = Bundle::new("b", config).unwrap();
        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();
        bundle.send(&[1u8; 10], &mut wire, Instant::now()).unwrap();
        assert_eq!(bundle.xseq(), 1);

        let grown = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0); 2]);
        bundle.configure(grown).unwrap();
        assert_eq!(bundle.xseq(), 1);
        assert_eq!(bundle.links().active(), &[0, 1]);
    }

    #[test]
    fn test_going_idle_resets() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0); 2]);
        let (mut tx, mut rx) = (
            Bundle::new("tx", config.clone()).unwrap(),
            Bundle::new("rx", config.clone()).unwrap(),
        );
        let now = Instant::now();
        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();
        tx.send(&[3u8; 500], &mut wire, now).unwrap();
        tx.send(&[4u8; 500], &mut wire, now).unwrap();

        // Only link 1's frames arrive, so they sit in the queue
        let mut delivered: Vec<Vec<u8>> = Vec::new();
        for (link, frame) in wire.iter().filter(|(l, _)| *l == 1) {
            rx.receive(*link, frame, now, &mut delivered).unwrap();
        }
        assert!(rx.queue_len() > 0);
        assert_ne!(tx.xseq(), 0);

        // Disable multilink and all links in one step
        tx.configure(NodeConfig::default()).unwrap();
        rx.configure(NodeConfig::default()).unwrap();
        assert!(!rx.is_running());
        assert_eq!(tx.xseq(), 0);
        assert_eq!(rx.mseq(), initial_mseq(SeqMode::Long));
        assert_eq!(rx.queue_len(), 0);
        assert!(rx.links().get(1).unwrap().highest_recv_seq().is_none());
        assert_eq!(tx.links().get(0).unwrap().bytes_in_queue(), 0);

        // Sequence widths may change now that the bundle is idle
        let mut short = config;
        short.bundle.xmit_short_seq = true;
        tx.configure(short).unwrap();
        assert_eq!(tx.snapshot().xmit_mode, SeqMode::Short);
    }

    #[test]
    fn test_detaching_all_links_resets() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0); 2]);
        let mut bundle = Bundle::new("b", config).unwrap();
        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();
        bundle.send(&[1u8; 10], &mut wire, Instant::now()).unwrap();

        bundle.detach_link(0).unwrap();
        assert!(bundle.is_running());
        assert_eq!(bundle.xseq(), 1);

        bundle.detach_link(1).unwrap();
        assert!(!bundle.is_running());
        assert_eq!(bundle.xseq(), 0);
        assert!(matches!(
            bundle.send(&[1u8; 10], &mut wire, Instant::now()),
            Err(MpError::LinkDown)
        ));

        bundle.attach_link(1).unwrap();
        assert_eq!(bundle.links().active(), &[1]);
        assert!(matches!(
            bundle.attach_link(MAX_LINKS),
            Err(MpError::UnknownLink(MAX_LINKS))
        ));
    }

    #[test]
    fn test_attach_without_multilink_limited_to_one_link() {
        let mut config = NodeConfig::default();
        config.links = vec![LinkConfig::enabled(100, 0), LinkConfig::enabled(100, 0)];
        config.bundle.enable_multilink = false;

        let mut bundle = Bundle::new("b", NodeConfig::default()).unwrap();
        bundle.detach_link(1).unwrap();
        bundle.configure(config).unwrap();
        assert_eq!(bundle.links().active(), &[0]);

        assert!(matches!(
            bundle.attach_link(1),
            Err(MpError::ConfigurationInvalid(ConfigError::TooManyActiveLinks { active: 2 }))
        ));
        assert_eq!(bundle.links().active(), &[0]);
    }

    struct FailingTransport {
        sent: Vec<(LinkId, Vec<u8>)>,
        fail_at: usize,
    }

    impl LinkTransport for FailingTransport {
        fn send_fragment(&mut self, link: LinkId, frame: Vec<u8>) -> Result<(), TransportError> {
            if self.sent.len() == self.fail_at {
                return Err("carrier lost".into());
            }
            self.sent.push((link, frame));
            Ok(())
        }
    }

    #[test]
    fn test_send_failure_aborts_datagram() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0); 3]);
        let mut bundle = Bundle::new("b", config).unwrap();
        let mut transport = FailingTransport {
            sent: Vec::new(),
            fail_at: 1,
        };

        let err = bundle
            .send(&[9u8; 300], &mut transport, Instant::now())
            .unwrap_err();
        assert!(matches!(err, MpError::Send { link: 1, .. }));
        assert_eq!(transport.sent.len(), 1);
        // All three sequence numbers were consumed
        assert_eq!(bundle.xseq(), 3);
        assert_eq!(bundle.stats().totals.snapshot().xmit_frames, 1);

        // The next datagram carries on from there
        transport.fail_at = usize::MAX;
        bundle.send(&[9u8; 10], &mut transport, Instant::now()).unwrap();
        let (header, _) = MpHeader::decode(SeqMode::Long, &transport.sent[1].1).unwrap();
        assert_eq!(header.seq, 3);
    }

    #[test]
    fn test_large_datagram_on_one_link() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0)]);
        let mut bundle = Bundle::new("b", config).unwrap();
        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();

        // One fragment regardless of size; the default MRU rejects it whole
        let fragments = bundle.fragment(&[1u8; 3000], Instant::now()).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].header.first && fragments[0].header.last);
        assert_eq!(bundle.xseq(), 1);

        let err = bundle
            .send(&[1u8; 3000], &mut wire, Instant::now())
            .unwrap_err();
        assert!(matches!(
            err,
            MpError::FrameTooLarge { link: 0, len: 3004, mru: 1500 }
        ));
        assert!(wire.is_empty());
        assert_eq!(bundle.xseq(), 2);
        assert_eq!(bundle.stats().totals.snapshot().xmit_frames, 0);
        assert_eq!(bundle.links().get(0).unwrap().bytes_in_queue(), 0);

        // Exactly the MRU fits
        assert_eq!(bundle.send(&[1u8; 1496], &mut wire, Instant::now()).unwrap(), 1);
        assert_eq!(wire[0].1.len(), 1500);
    }

    #[test]
    fn test_oversize_share_sends_nothing() {
        let config = NodeConfig::multilink(vec![
            LinkConfig::enabled(100, 0),
            LinkConfig::enabled(100, 0).with_mru(200),
        ]);
        let mut bundle = Bundle::new("b", config).unwrap();
        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();

        // Link 0 could carry its half; link 1's half does not fit
        let err = bundle
            .send(&[2u8; 1000], &mut wire, Instant::now())
            .unwrap_err();
        assert!(matches!(err, MpError::FrameTooLarge { link: 1, len: 504, mru: 200 }));
        assert!(wire.is_empty());
        assert_eq!(bundle.xseq(), 2);
    }

    #[test]
    fn test_send_errors() {
        let mut bundle = Bundle::new("b", NodeConfig::default()).unwrap();
        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();
        assert!(matches!(
            bundle.send(&[1, 2, 3], &mut wire, Instant::now()),
            Err(MpError::MultilinkDisabled)
        ));

        let mut bundle =
            Bundle::new("b", NodeConfig::multilink(vec![LinkConfig::enabled(100, 0)])).unwrap();
        assert!(matches!(
            bundle.send(&[], &mut wire, Instant::now()),
            Err(MpError::EmptyDatagram)
        ));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_send_updates_link_queue() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0)]);
        let mut bundle = Bundle::new("b", config).unwrap();
        let mut wire: Vec<(LinkId, Vec<u8>)> = Vec::new();
        bundle.send(&[0u8; 96], &mut wire, Instant::now()).unwrap();

        // 96 byte payload plus 4 byte long header
        assert_eq!(bundle.links().get(0).unwrap().bytes_in_queue(), 100);
        assert_eq!(bundle.stats().link(0).unwrap().snapshot().xmit_octets, 100);
    }

    #[test]
    fn test_receive_errors() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0)]);
        let mut bundle = Bundle::new("b", config).unwrap();
        let mut delivered: Vec<Vec<u8>> = Vec::new();
        let now = Instant::now();

        assert!(matches!(
            bundle.receive(3, &[0x80, 0, 0, 1, 0xaa], now, &mut delivered),
            Err(MpError::UnknownLink(3))
        ));
        assert!(matches!(
            bundle.receive(0, &[0x80, 0], now, &mut delivered),
            Err(MpError::ProtocolViolation(Violation::Runt { len: 2 }))
        ));
        assert_eq!(bundle.stats().link(0).unwrap().snapshot().runts, 1);
        assert_eq!(bundle.stats().totals.snapshot().recv_frames, 1);

        let mut idle = Bundle::new("idle", NodeConfig::default()).unwrap();
        assert!(matches!(
            idle.receive(0, &[0xc0, 0, 0, 1, 0xaa], now, &mut delivered),
            Err(MpError::MultilinkDisabled)
        ));
        assert!(delivered.is_empty());
    }

    #[test]
    fn test_reserved_bits_ignored() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0)]);
        let mut bundle = Bundle::new("b", config).unwrap();
        let mut delivered: Vec<Vec<u8>> = Vec::new();

        // First and last set, reserved bits all ones, seq 1
        bundle
            .receive(0, &[0xff, 0, 0, 1, 0xaa], Instant::now(), &mut delivered)
            .unwrap();
        assert_eq!(delivered, vec![vec![0xaa]]);
    }

    #[test]
    fn test_snapshot_json() {
        let config = NodeConfig::multilink(vec![LinkConfig::enabled(100, 0); 2]);
        let bundle = Bundle::new("snap", config).unwrap();
        let state = bundle.snapshot();
        assert!(state.running);
        assert!(state.all_links_equal);
        assert_eq!(state.active_links, vec![0, 1]);
        assert_eq!(state.links[1].highest_recv_seq, Some(bundle.mseq()));

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"name\":\"snap\""));
        assert!(json.contains("\"xmit_mode\":\"Long\""));
    }
}
