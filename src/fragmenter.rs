//! Outbound fragmentation and link scheduling.
//!
//! A datagram is split into fragments spread over the active links. Three
//! strategies pick how many bytes each link carries:
//!
//! - **Round-robin**: the whole datagram goes to one link, chosen by a cursor
//!   that advances over the active links. Used when round-robin is
//!   configured, or when the datagram is too short to split.
//! - **Equal split**: all active links have the same bandwidth and latency,
//!   so each gets `len / n` bytes and the remainder is handed out one byte at
//!   a time.
//! - **Optimal split**: links are sorted by effective latency (configured
//!   latency plus the time to drain their transmit queue) and added fastest
//!   first until they can carry the datagram. The byte shares are chosen so
//!   every included link finishes at the same time `t0`, which minimises the
//!   arrival time of the datagram's last byte.
//!
//! Every fragment takes the next transmit sequence number, in the order the
//! fragments appear in the datagram.
//!
//! # Example
//!
//! ```
//! use ppp_multilink::{Bundle, LinkConfig, NodeConfig};
//! use std::time::Instant;
//!
//! let config = NodeConfig::multilink(vec![
//!     LinkConfig::enabled(100, 0),
//!     LinkConfig::enabled(100, 0),
//! ]);
//! let mut bundle = Bundle::new("doc", config).unwrap();
//! let fragments = bundle.fragment(&[0u8; 1000], Instant::now()).unwrap();
//! assert_eq!(fragments.len(), 2);
//! assert_eq!(fragments[0].payload.len(), 500);
//! ```

use crate::error::{try_copy, MpError};
use crate::header::MpHeader;
use crate::link::{LinkId, LinkTable};
use crate::sequence::{Seq, SeqMode};
use std::time::Instant;

/// Smallest fragment the equal split produces.
pub const MIN_FRAG_LEN: usize = 32;

/// Datagrams shorter than this always go out whole on one link.
pub const SPLIT_THRESHOLD: usize = 2 * MIN_FRAG_LEN;

/// Initial transmit sequence number.
pub const INITIAL_XSEQ: Seq = 0;

/// Microseconds per (byte / bandwidth unit), with bandwidth in 10 bytes/sec.
const US_PER_BYTE_UNIT: i64 = 100_000;

/// How a datagram is spread over the links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Whole datagram on the next link in turn.
    RoundRobin,
    /// Even shares over identical links.
    EqualSplit,
    /// Latency- and bandwidth-weighted shares.
    Optimal,
}

/// A fragment ready to be sent on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFragment {
    /// Link the fragment is assigned to.
    pub link: LinkId,
    /// Sequence number and position flags.
    pub header: MpHeader,
    /// Fragment payload.
    pub payload: Vec<u8>,
}

impl OutboundFragment {
    /// Sequence number of this fragment.
    pub fn seq(&self) -> Seq {
        self.header.seq
    }

    /// Wire frame: MP header followed by the payload.
    pub fn encode(&self, mode: SeqMode) -> Vec<u8> {
        self.header.encode_frame(mode, &self.payload)
    }
}

/// Transmit side of a bundle: next sequence number and round-robin cursor.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    mode: SeqMode,
    xseq: Seq,
    cursor: usize,
}

impl Fragmenter {
    /// Create a fragmenter starting at the initial sequence number.
    pub fn new(mode: SeqMode) -> Self {
        Self {
            mode,
            xseq: INITIAL_XSEQ,
            cursor: 0,
        }
    }

    /// Sequence number the next fragment will carry.
    pub fn xseq(&self) -> Seq {
        self.xseq
    }

    /// Transmit sequence width.
    pub fn mode(&self) -> SeqMode {
        self.mode
    }

    /// Return to the initial sequence number with a (possibly new) width.
    pub(crate) fn reset(&mut self, mode: SeqMode) {
        self.mode = mode;
        self.xseq = INITIAL_XSEQ;
        self.cursor = 0;
    }

    /// Strategy that would be used for a datagram of `len` bytes.
    pub fn strategy(&self, links: &LinkTable, round_robin: bool, len: usize) -> Strategy {
        if round_robin || len < SPLIT_THRESHOLD {
            Strategy::RoundRobin
        } else if links.all_equal() {
            Strategy::EqualSplit
        } else {
            Strategy::Optimal
        }
    }

    /// Bytes to send on each active link, parallel to `links.active()`.
    pub fn plan(
        &mut self,
        links: &mut LinkTable,
        round_robin: bool,
        len: usize,
        now: Instant,
    ) -> Vec<usize> {
        let count = links.active().len();
        let mut distrib = vec![0usize; count];
        if count == 0 {
            return distrib;
        }

        match self.strategy(links, round_robin, len) {
            Strategy::RoundRobin => {
                distrib[self.cursor % count] = len;
                self.cursor = self.cursor.wrapping_add(1);
            }
            Strategy::EqualSplit => {
                let frags = count.min(len / MIN_FRAG_LEN).max(1);
                let share = len / frags;
                let mut remain = len - share * frags;
                for _ in 0..frags {
                    let extra = usize::from(remain > 0);
                    remain -= extra;
                    distrib[self.cursor % count] = share + extra;
                    self.cursor = self.cursor.wrapping_add(1);
                }
            }
            Strategy::Optimal => {
                let active: Vec<LinkId> = links.active().to_vec();
                let profile: Vec<(u64, u32)> = active
                    .iter()
                    .filter_map(|&id| {
                        let link = links.get_mut(id)?;
                        let bandwidth = link.config().bandwidth;
                        Some((link.effective_latency_us(now), bandwidth))
                    })
                    .collect();
                distrib = optimal_split(&profile, len);
            }
        }
        distrib
    }

    /// Split `datagram` into fragments over the active links.
    ///
    /// Each link with a nonzero share gets exactly one fragment. Sequence
    /// numbers are consumed as fragments are built; link MRUs are checked
    /// when the fragments are sent.
    pub fn fragment(
        &mut self,
        links: &mut LinkTable,
        round_robin: bool,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Vec<OutboundFragment>, MpError> {
        if datagram.is_empty() {
            return Err(MpError::EmptyDatagram);
        }
        if links.active().is_empty() {
            return Err(MpError::LinkDown);
        }

        let distrib = self.plan(links, round_robin, datagram.len(), now);
        let mut fragments = Vec::new();
        let mut offset = 0;

        for (&id, &len) in links.active().iter().zip(&distrib) {
            if len == 0 {
                continue;
            }
            let header = MpHeader::new(self.xseq, offset == 0, offset + len == datagram.len());
            self.xseq = self.mode.next(self.xseq);
            fragments.push(OutboundFragment {
                link: id,
                header,
                payload: try_copy(&datagram[offset..offset + len])?,
            });
            offset += len;
        }

        debug_assert_eq!(offset, datagram.len(), "allocation must cover the datagram");
        Ok(fragments)
    }
}

/// Byte shares minimising the arrival time of the last byte.
///
/// `profile` holds `(effective latency in µs, bandwidth in 10 bytes/sec)`
/// per link; the result is parallel to it and sums to `len`.
pub fn optimal_split(profile: &[(u64, u32)], len: usize) -> Vec<usize> {
    let count = profile.len();
    let mut distrib = vec![0i64; count];
    if count == 0 {
        return Vec::new();
    }

    let latency = |i: usize| profile[i].0 as i64;
    let bandwidth = |i: usize| i64::from(profile[i].1.max(1));
    let len = len as i64;

    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by_key(|&i| profile[i].0);

    // Add links fastest first until the ones already included could carry
    // the whole datagram before the next link's first byte arrives
    let mut included = 1;
    while included < count {
        let horizon = latency(order[included]);
        let capacity: i64 = order[..included]
            .iter()
            .map(|&i| ((horizon - latency(i)) * bandwidth(i) + US_PER_BYTE_UNIT - 1) / US_PER_BYTE_UNIT)
            .sum();
        if capacity >= len {
            break;
        }
        included += 1;
    }
    let order = &order[..included];

    // Solve sum(bw_i * (t0 - lat_i)) = len for t0
    let (top, bottom) = order.iter().fold((0i64, 0i64), |(top, bottom), &i| {
        (top + latency(i) * bandwidth(i), bottom + bandwidth(i))
    });
    let t0 = (len * US_PER_BYTE_UNIT + top + bottom / 2) / bottom;

    let mut total = 0;
    for &i in order {
        let share = ((bandwidth(i) * (t0 - latency(i)) + US_PER_BYTE_UNIT / 2) / US_PER_BYTE_UNIT).max(0);
        distrib[i] = share;
        total += share;
    }

    if total < len {
        // Give the shortfall to the highest-bandwidth link
        let mut fast = order[0];
        for &i in &order[1..] {
            if bandwidth(i) > bandwidth(fast) {
                fast = i;
            }
        }
        distrib[fast] += len - total;
    } else {
        // Take the excess from the lowest-bandwidth links that still have bytes
        while total > len {
            let Some(slow) = order
                .iter()
                .copied()
                .filter(|&i| distrib[i] > 0)
                .min_by_key(|&i| bandwidth(i))
            else {
                break;
            };
            let delta = (total - len).min(distrib[slow]);
            distrib[slow] -= delta;
            total -= delta;
        }
    }

    distrib.into_iter().map(|d| d.max(0) as usize).collect()
}
