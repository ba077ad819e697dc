//! Ordered set of missing sequence numbers, stored as disjoint, non-adjacent,
//! strictly increasing half-open-in-spirit (but inclusive-bounds here)
//! intervals (`SPEC_FULL.md` §3, §4.2).
//!
//! The range-compression shape of `write()` is grounded on the teacher's
//! `optimize_ack_nack_records` (`src/raknet/protocol/ack.rs`): a sorted run
//! of consecutive values collapses into one range record instead of many
//! singletons. Sequence numbers here are treated as a locally monotonic
//! window rather than doing full `seqoff`-wrapped interval arithmetic —
//! a connection's in-flight loss window never approaches the 15-bit wrap
//! boundary in practice, matching how the teacher's own loss tracking
//! (`BTreeSet<u32>` in `send_window.rs`) ignores wraparound too.

use crate::seq::SequenceNumber;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// Maps each interval's low endpoint to its high endpoint (inclusive).
#[derive(Debug, Default, Clone)]
pub struct LossList {
    intervals: BTreeMap<u16, u16>,
}

impl LossList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total count of missing sequence numbers across all intervals.
    pub fn length(&self) -> usize {
        self.intervals
            .iter()
            .map(|(&lo, &hi)| (hi - lo) as usize + 1)
            .sum()
    }

    pub fn first_sequence_number(&self) -> Option<SequenceNumber> {
        self.intervals.keys().next().copied().map(SequenceNumber::new)
    }

    /// Appends a single missing sequence number, merging with a touching
    /// neighbor interval if one exists.
    pub fn append(&mut self, seq: SequenceNumber) {
        self.append_range(seq, seq);
    }

    /// Unions `[from, to]` into the list, merging any intervals it touches
    /// or overlaps.
    pub fn append_range(&mut self, from: SequenceNumber, to: SequenceNumber) {
        let (mut lo, hi) = (from.value(), to.value());
        if hi < lo {
            return;
        }
        let mut hi = hi;

        // Absorb a preceding interval that touches or overlaps [lo, hi].
        if let Some((&prev_lo, &prev_hi)) = self.intervals.range(..=lo).next_back() {
            if prev_hi.saturating_add(1) >= lo {
                lo = prev_lo;
                hi = hi.max(prev_hi);
                self.intervals.remove(&prev_lo);
            }
        }

        // Absorb every following interval that touches or overlaps [lo, hi].
        let touched: Vec<u16> = self
            .intervals
            .range(lo..)
            .take_while(|(&next_lo, _)| next_lo <= hi.saturating_add(1))
            .map(|(&next_lo, _)| next_lo)
            .collect();
        for next_lo in touched {
            if let Some(next_hi) = self.intervals.remove(&next_lo) {
                hi = hi.max(next_hi);
            }
        }

        self.intervals.insert(lo, hi);
    }

    /// Removes a single sequence number, splitting its interval if it was
    /// interior. No-op if `seq` is not present.
    pub fn remove(&mut self, seq: SequenceNumber) {
        let v = seq.value();
        let Some((&lo, &hi)) = self.intervals.range(..=v).next_back() else {
            return;
        };
        if v < lo || v > hi {
            return;
        }
        self.intervals.remove(&lo);
        if lo < v {
            self.intervals.insert(lo, v - 1);
        }
        if v < hi {
            self.intervals.insert(v + 1, hi);
        }
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        let v = seq.value();
        self.intervals
            .range(..=v)
            .next_back()
            .is_some_and(|(&lo, &hi)| lo <= v && v <= hi)
    }

    /// Serializes the entire list for a TimeoutNAK body: each interval as
    /// either a bare low value (bit 15 clear, singleton) or a low value with
    /// bit 15 set followed by the high value (a range).
    pub fn write(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.intervals.len() * 2);
        for (&lo, &hi) in &self.intervals {
            if lo == hi {
                buf.extend_from_slice(&lo.to_le_bytes());
            } else {
                buf.extend_from_slice(&(lo | 0x8000).to_le_bytes());
                buf.extend_from_slice(&hi.to_le_bytes());
            }
        }
        buf.freeze()
    }

    /// Rebuilds a `LossList` from a serialized TimeoutNAK body, as
    /// `SendQueue::overrideNAKListFromPacket` does with the decoded list.
    pub fn read(mut data: Bytes) -> Self {
        use crate::binary::BinaryReader;
        let mut list = Self::new();
        while data.len() >= 2 {
            let Ok(word) = data.read_u16_le() else {
                break;
            };
            let is_range = word & 0x8000 != 0;
            let lo = word & 0x7FFF;
            if is_range {
                let Ok(hi) = data.read_u16_le() else {
                    break;
                };
                list.append_range(SequenceNumber::new(lo), SequenceNumber::new(hi));
            } else {
                list.append(SequenceNumber::new(lo));
            }
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: u16) -> SequenceNumber {
        SequenceNumber::new(v)
    }

    #[test]
    fn append_merges_adjacent_singletons_into_a_range() {
        let mut ll = LossList::new();
        ll.append(s(4));
        ll.append(s(5));
        ll.append(s(6));
        assert_eq!(ll.length(), 3);
        assert_eq!(ll.first_sequence_number(), Some(s(4)));
        assert!(ll.contains(s(5)));
        assert!(!ll.contains(s(7)));
    }

    #[test]
    fn append_range_bridges_two_existing_intervals() {
        let mut ll = LossList::new();
        ll.append_range(s(4), s(5));
        ll.append_range(s(9), s(10));
        ll.append_range(s(6), s(8));
        assert_eq!(ll.length(), 7);
        assert_eq!(ll.first_sequence_number(), Some(s(4)));
    }

    #[test]
    fn remove_interior_splits_the_interval() {
        let mut ll = LossList::new();
        ll.append_range(s(4), s(7));
        ll.remove(s(5));
        assert!(ll.contains(s(4)));
        assert!(!ll.contains(s(5)));
        assert!(ll.contains(s(6)));
        assert!(ll.contains(s(7)));
        assert_eq!(ll.length(), 3);
    }

    #[test]
    fn remove_endpoint_shrinks_the_interval() {
        let mut ll = LossList::new();
        ll.append_range(s(4), s(7));
        ll.remove(s(4));
        assert_eq!(ll.first_sequence_number(), Some(s(5)));
        ll.remove(s(7));
        assert!(!ll.contains(s(7)));
        assert_eq!(ll.length(), 2);
    }

    #[test]
    fn remove_absent_is_a_no_op() {
        let mut ll = LossList::new();
        ll.append_range(s(4), s(7));
        ll.remove(s(100));
        assert_eq!(ll.length(), 4);
    }

    #[test]
    fn write_then_read_round_trips_mixed_singletons_and_ranges() {
        let mut ll = LossList::new();
        ll.append(s(2));
        ll.append_range(s(10), s(15));
        ll.append(s(20));

        let encoded = ll.write();
        let decoded = LossList::read(encoded);
        assert_eq!(decoded.length(), ll.length());
        assert!(decoded.contains(s(2)));
        assert!(decoded.contains(s(12)));
        assert!(decoded.contains(s(20)));
        assert!(!decoded.contains(s(16)));
    }
}
