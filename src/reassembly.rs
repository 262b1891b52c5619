//! Inbound reassembly of MP fragments.
//!
//! Fragments from all links are kept in one queue ordered by sequence
//! number. `mseq`, the receive low-water mark, is the minimum over the
//! active links of the highest sequence received on each. Since every link
//! delivers in order, a sequence number at or below `mseq` that is not queued
//! can never arrive, so packets needing it are dropped.
//!
//! After each arrival the queue is processed:
//!
//! 1. Deliver every complete packet at the head of the queue that starts
//!    right after `mseq`.
//! 2. Trim packets that can no longer complete and deliver again.
//! 3. If the queue is over its bound, drop the oldest fragment and force
//!    `mseq` up to it.
//! 4. If the first complete packet anywhere in the queue has been waiting
//!    longer than the staleness threshold, drop everything before it, force
//!    `mseq` to its end and deliver it.
//!
//! Steps 3 and 4 trade ordering for liveness: a link that stops sending
//! pins `mseq`, and without them nothing behind it would ever be delivered.

use crate::error::{try_copy, MpError, Violation};
use crate::fragmenter::INITIAL_XSEQ;
use crate::header::MpHeader;
use crate::link::{LinkId, LinkTable};
use crate::sequence::{Seq, SeqMode};
use crate::stats::BundleStats;
use log::{debug, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default maximum number of queued fragments.
pub const MAX_QUEUE_LEN: usize = 128;

/// Default period of the staleness reclaimer.
pub const RECLAIM_INTERVAL: Duration = Duration::from_millis(500);

/// Default age after which a complete packet is delivered regardless of `mseq`.
pub const STALE_AFTER: Duration = Duration::from_secs(2);

/// Initial receive low-water mark: the sequence number just before the
/// first one a peer sends.
pub const fn initial_mseq(mode: SeqMode) -> Seq {
    mode.prev(INITIAL_XSEQ)
}

/// Queue bound and reclaimer timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Maximum number of queued fragments.
    pub max_queue_len: usize,
    /// Period of the staleness reclaimer.
    pub reclaim_interval: Duration,
    /// Age after which a complete packet is forced out.
    pub stale_after: Duration,
}

impl ReassemblyLimits {
    /// Queue bound in effect for `mode`.
    ///
    /// Capped at a quarter of the sequence space, so every fragment the queue
    /// can hold stays inside the half window `diff` can order.
    pub fn queue_bound(&self, mode: SeqMode) -> usize {
        self.max_queue_len.min(mode.modulus() as usize / 4)
    }
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_queue_len: MAX_QUEUE_LEN,
            reclaim_interval: RECLAIM_INTERVAL,
            stale_after: STALE_AFTER,
        }
    }
}

/// Receiver of reassembled datagrams.
pub trait DatagramSink {
    /// Called once per datagram, in delivery order.
    fn deliver(&mut self, datagram: Vec<u8>);
}

impl DatagramSink for Vec<Vec<u8>> {
    fn deliver(&mut self, datagram: Vec<u8>) {
        self.push(datagram);
    }
}

/// A fragment waiting in the reassembly queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFragment {
    /// Sequence number.
    pub seq: Seq,
    /// First fragment of a datagram.
    pub first: bool,
    /// Last fragment of a datagram.
    pub last: bool,
    /// Link the fragment arrived on.
    pub link: LinkId,
    /// Fragment payload.
    pub payload: Vec<u8>,
    /// Arrival time.
    pub arrived: Instant,
}

/// Shared state the reassembler works against.
pub(crate) struct RxContext<'a, S: ?Sized> {
    pub links: &'a mut LinkTable,
    pub stats: &'a BundleStats,
    pub sink: &'a mut S,
    pub now: Instant,
}

/// Receive side of a bundle: the fragment queue and `mseq`.
#[derive(Debug)]
pub struct Reassembler {
    mode: SeqMode,
    mseq: Seq,
    queue: VecDeque<QueuedFragment>,
    limits: ReassemblyLimits,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new(mode: SeqMode, limits: ReassemblyLimits) -> Self {
        Self {
            mode,
            mseq: initial_mseq(mode),
            queue: VecDeque::new(),
            limits,
        }
    }

    /// Receive sequence width.
    pub fn mode(&self) -> SeqMode {
        self.mode
    }

    /// Receive low-water mark.
    pub fn mseq(&self) -> Seq {
        self.mseq
    }

    /// Queue bound and reclaimer timing.
    pub fn limits(&self) -> &ReassemblyLimits {
        &self.limits
    }

    /// Number of queued fragments.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no fragment is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued fragments in sequence order.
    pub fn queued(&self) -> impl Iterator<Item = &QueuedFragment> {
        self.queue.iter()
    }

    /// Drop every queued fragment and return to the initial `mseq`.
    pub(crate) fn reset(&mut self, mode: SeqMode) {
        let bound = self.limits.queue_bound(mode);
        if bound < self.limits.max_queue_len {
            warn!(
                "queue bound {} does not fit {} sequence numbers, using {}",
                self.limits.max_queue_len, mode, bound
            );
        }
        self.mode = mode;
        self.mseq = initial_mseq(mode);
        self.queue.clear();
    }

    /// Handle one inbound fragment from `link`.
    ///
    /// The queue is processed even when the fragment itself is rejected, so
    /// an error never leaves a deliverable packet behind.
    pub(crate) fn receive<S: DatagramSink + ?Sized>(
        &mut self,
        ctx: &mut RxContext<'_, S>,
        link: LinkId,
        header: MpHeader,
        payload: &[u8],
    ) -> Result<(), MpError> {
        let seq = header.seq;
        if self.mode.diff(seq, self.mseq) < 0 {
            debug!(
                "link {}: dropping seq {} behind MSEQ {}",
                link, seq, self.mseq
            );
            ctx.stats.record_drop(Some(link));
            return Err(Violation::BehindLowWater {
                seq,
                mseq: self.mseq,
            }
            .into());
        }

        if let Some(l) = ctx.links.get_mut(link) {
            l.set_highest_recv_seq(seq);
        }
        self.sync_mseq(ctx.links);

        let result = match try_copy(payload) {
            Ok(payload) => self.insert(
                QueuedFragment {
                    seq,
                    first: header.first,
                    last: header.last,
                    link,
                    payload,
                    arrived: ctx.now,
                },
                ctx.stats,
            ),
            Err(e) => {
                warn!("link {}: no memory for seq {}, dropping", link, seq);
                ctx.stats.record_drop(Some(link));
                Err(e)
            }
        };

        self.process(ctx);
        result
    }

    /// Restore the queue invariants: deliver, trim, bound and reclaim.
    pub(crate) fn process<S: DatagramSink + ?Sized>(&mut self, ctx: &mut RxContext<'_, S>) {
        self.sync_mseq(ctx.links);
        loop {
            self.deliver_ready(ctx);
            if self.trim(ctx.stats) > 0 {
                self.deliver_ready(ctx);
            }
            if self.enforce_bound(ctx) {
                continue;
            }
            if self.reclaim_stale(ctx) {
                continue;
            }
            break;
        }
        debug_assert_eq!(self.invariant_violation(), None);
    }

    /// Raise `mseq` to the links' low-water mark. Never moves it backwards.
    fn sync_mseq(&mut self, links: &LinkTable) {
        if let Some(low) = links.low_water(self.mode) {
            if self.mode.diff(low, self.mseq) > 0 {
                self.mseq = low;
            }
        }
    }

    /// Insert in sequence order, scanning from the tail.
    fn insert(&mut self, frag: QueuedFragment, stats: &BundleStats) -> Result<(), MpError> {
        let mut pos = self.queue.len();
        for (i, queued) in self.queue.iter().enumerate().rev() {
            let d = self.mode.diff(queued.seq, frag.seq);
            if d == 0 {
                debug!("link {}: duplicate seq {}", frag.link, frag.seq);
                stats.record_duplicate(frag.link);
                return Err(Violation::Duplicate { seq: frag.seq }.into());
            }
            if d < 0 {
                break;
            }
            pos = i;
        }

        if self.queue.try_reserve(1).is_err() {
            stats.record_drop(Some(frag.link));
            return Err(MpError::ResourceExhausted);
        }
        self.queue.insert(pos, frag);
        Ok(())
    }

    /// Index of the last fragment of the complete packet starting at `start`.
    ///
    /// The run must have consecutive sequence numbers and no `first` flag
    /// after the one at `start`.
    fn complete_run(&self, start: usize) -> Option<usize> {
        let mut expected = self.queue.get(start)?.seq;
        for (i, frag) in self.queue.iter().enumerate().skip(start) {
            if frag.seq != expected || (i > start && frag.first) {
                return None;
            }
            if frag.last {
                return Some(i);
            }
            expected = self.mode.next(expected);
        }
        None
    }

    /// End of the packet at the head, if it can be delivered now.
    fn deliverable_head(&self) -> Option<usize> {
        let head = self.queue.front()?;
        if !head.first || self.mode.diff(head.seq, self.mseq) > 1 {
            return None;
        }
        self.complete_run(0)
    }

    fn deliver_ready<S: DatagramSink + ?Sized>(&mut self, ctx: &mut RxContext<'_, S>) {
        while let Some(end) = self.deliverable_head() {
            self.deliver_front(end, ctx);
        }
    }

    /// Splice fragments `0..=end` into one datagram and hand it upward.
    fn deliver_front<S: DatagramSink + ?Sized>(
        &mut self,
        end: usize,
        ctx: &mut RxContext<'_, S>,
    ) -> bool {
        let total: usize = self.queue.range(..=end).map(|f| f.payload.len()).sum();
        let mut datagram = Vec::new();
        let reserved = datagram.try_reserve_exact(total).is_ok();

        for frag in self.queue.drain(..=end) {
            if reserved {
                datagram.extend_from_slice(&frag.payload);
            } else {
                ctx.stats.record_drop(Some(frag.link));
            }
        }
        if !reserved {
            warn!("no memory for {} byte datagram, dropped", total);
            return false;
        }

        ctx.stats.record_delivery();
        ctx.sink.deliver(datagram);
        true
    }

    /// Returns true if the packet at the head can never complete.
    fn head_doomed(&self) -> bool {
        let Some(head) = self.queue.front() else {
            return false;
        };
        if !head.first {
            // The packet's start is before the head and not queued
            return self.mode.diff(head.seq, self.mseq) <= 1;
        }

        let mut expected = head.seq;
        for (i, frag) in self.queue.iter().enumerate() {
            if frag.seq != expected {
                return self.mode.diff(expected, self.mseq) <= 0;
            }
            if i > 0 && frag.first {
                // Next packet began before this one ended
                return true;
            }
            if frag.last {
                return false;
            }
            expected = self.mode.next(expected);
        }
        self.mode.diff(expected, self.mseq) <= 0
    }

    /// Drop packets at the head that can no longer complete.
    ///
    /// Returns the number of fragments dropped.
    fn trim(&mut self, stats: &BundleStats) -> usize {
        let mut dropped = 0;
        while self.head_doomed() {
            dropped += self.drop_head_packet(stats);
        }
        if dropped > 0 {
            debug!("trimmed {} fragments (MSEQ {})", dropped, self.mseq);
        }
        dropped
    }

    /// Remove the head fragment and the rest of its packet that follows it
    /// contiguously.
    fn drop_head_packet(&mut self, stats: &BundleStats) -> usize {
        let Some(head) = self.queue.pop_front() else {
            return 0;
        };
        stats.record_drop(Some(head.link));
        let mut dropped = 1;
        let mut done = head.last;
        let mut expected = self.mode.next(head.seq);

        while !done {
            match self.queue.front() {
                Some(f) if !f.first && f.seq == expected => {}
                _ => break,
            }
            let Some(frag) = self.queue.pop_front() else {
                break;
            };
            stats.record_drop(Some(frag.link));
            dropped += 1;
            done = frag.last;
            expected = self.mode.next(frag.seq);
        }
        dropped
    }

    /// Force `mseq` up to `seq` and drag lagging links with it.
    fn force_mseq<S: ?Sized>(&mut self, seq: Seq, ctx: &mut RxContext<'_, S>) {
        if self.mode.diff(self.mseq, seq) < 0 {
            self.mseq = seq;
            ctx.links.raise_lagging(self.mode, seq);
            ctx.stats.record_forced_advance();
        }
    }

    /// Drop the oldest fragment if the queue is over its bound.
    fn enforce_bound<S: ?Sized>(&mut self, ctx: &mut RxContext<'_, S>) -> bool {
        let bound = self.limits.queue_bound(self.mode);
        if self.queue.len() <= bound {
            return false;
        }
        let Some(frag) = self.queue.pop_front() else {
            return false;
        };
        warn!(
            "reassembly queue full ({}), dropping seq {}",
            bound, frag.seq
        );
        self.force_mseq(frag.seq, ctx);
        ctx.stats.record_drop(Some(frag.link));
        true
    }

    /// First complete packet anywhere in the queue, as an index range.
    fn first_complete_run(&self) -> Option<(usize, usize)> {
        self.queue
            .iter()
            .enumerate()
            .filter(|(_, f)| f.first)
            .find_map(|(i, _)| self.complete_run(i).map(|end| (i, end)))
    }

    /// Force out the first complete packet if it has waited too long.
    fn reclaim_stale<S: DatagramSink + ?Sized>(&mut self, ctx: &mut RxContext<'_, S>) -> bool {
        let Some((start, end)) = self.first_complete_run() else {
            return false;
        };
        let Some(oldest) = self.queue.range(start..=end).map(|f| f.arrived).min() else {
            return false;
        };
        if ctx.now.saturating_duration_since(oldest) < self.limits.stale_after {
            return false;
        }

        for frag in self.queue.drain(..start) {
            ctx.stats.record_drop(Some(frag.link));
        }
        let end = end - start;
        let end_seq = self.queue[end].seq;
        warn!(
            "delivering stale packet ending at seq {}, skipped {} fragments (MSEQ {})",
            end_seq, start, self.mseq
        );
        self.force_mseq(end_seq, ctx);
        if self.deliver_front(end, ctx) {
            ctx.stats.record_stale_delivery();
        }
        true
    }

    /// Describe the first broken queue invariant, if any.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        if self.queue.len() > self.limits.queue_bound(self.mode) {
            return Some("queue over its bound");
        }
        let ordered = self
            .queue
            .iter()
            .zip(self.queue.iter().skip(1))
            .all(|(a, b)| self.mode.diff(b.seq, a.seq) > 0);
        if !ordered {
            return Some("queue not strictly ordered");
        }
        if self.deliverable_head().is_some() {
            return Some("deliverable packet left at head");
        }
        None
    }
}
