//! Receive-side state machine for one stream.
//!
//! [`Receiver`] tracks the next expected sequence number and holds segments
//! that arrive early:
//!
//! - A segment with `seq == expected` is delivered immediately, after which
//!   the reorder buffer is drained for as long as it holds `expected`.
//! - A segment after `expected` is parked in the reorder buffer, bounded by a
//!   frame count and a byte budget.  Overflow is fatal for the stream.
//! - A segment before `expected` was already delivered and is discarded.
//!
//! In every case the caller should answer with a cumulative ACK carrying
//! [`Receiver::ack_number`].  Message de-duplication lives here too, since it
//! is also a receive-side concern.

use std::collections::{HashMap, HashSet};

use crate::sender::Segment;
use crate::seq::Seq;

/// The reorder buffer hit one of its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderOverflow;

/// What happened to one inbound segment.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// In-order delivery, possibly followed by previously buffered segments.
    Delivered(Vec<Segment>),
    /// Arrived early and was parked.
    Buffered,
    /// Already delivered or already buffered.
    Duplicate,
}

/// Receive-side state for one stream.
#[derive(Debug)]
pub struct Receiver {
    /// Next expected sequence number (`RCV.NXT`).
    expected: Seq,
    reorder: HashMap<Seq, Segment>,
    reorder_bytes: usize,
    max_frames: usize,
    max_bytes: usize,
    /// Set once any segment has been accepted.
    touched: bool,
    /// The peer's END has been delivered; nothing follows it.
    finished: bool,
    messages: MessageFilter,
}

impl Receiver {
    pub fn new(expected: Seq, max_frames: usize, max_bytes: usize, dedup_window: usize) -> Self {
        Self {
            expected,
            reorder: HashMap::new(),
            reorder_bytes: 0,
            max_frames,
            max_bytes,
            touched: false,
            finished: false,
            messages: MessageFilter::new(dedup_window),
        }
    }

    /// Move the expected sequence number.  Ignored once anything was
    /// delivered.  Segments parked against the old value are dropped.
    pub fn reset_expected(&mut self, seq: Seq) -> bool {
        if self.touched {
            return false;
        }
        if seq != self.expected {
            self.expected = seq;
            self.clear();
        }
        true
    }

    /// Cumulative ACK number to place in outbound frames.
    pub fn ack_number(&self) -> Seq {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.reorder_bytes
    }

    /// Process one inbound DATA segment.
    pub fn on_segment(&mut self, seq: Seq, segment: Segment) -> Result<Received, ReorderOverflow> {
        if self.finished || seq.is_before(self.expected) {
            return Ok(Received::Duplicate);
        }

        if seq == self.expected {
            self.touched = true;
            let mut delivered = Vec::new();
            self.accept(segment, &mut delivered);
            while !self.finished {
                let Some(next) = self.reorder.remove(&self.expected) else {
                    break;
                };
                self.reorder_bytes -= next.len();
                self.accept(next, &mut delivered);
            }
            if self.finished {
                self.reorder.clear();
                self.reorder_bytes = 0;
            }
            return Ok(Received::Delivered(delivered));
        }

        if self.reorder.contains_key(&seq) {
            return Ok(Received::Duplicate);
        }
        if self.reorder.len() >= self.max_frames
            || self.reorder_bytes + segment.len() > self.max_bytes
        {
            return Err(ReorderOverflow);
        }
        self.reorder_bytes += segment.len();
        self.reorder.insert(seq, segment);
        Ok(Received::Buffered)
    }

    fn accept(&mut self, segment: Segment, delivered: &mut Vec<Segment>) {
        self.expected = self.expected.next();
        self.finished = segment.is_end();
        delivered.push(segment);
    }

    /// `true` the first time message `id` is seen.
    pub fn first_sighting(&mut self, id: u32) -> bool {
        self.messages.insert(id)
    }

    /// Forget buffered state (stream destroyed).
    pub fn clear(&mut self) {
        self.reorder.clear();
        self.reorder_bytes = 0;
    }
}

/// Message ids seen within `window` of the newest one.
///
/// Anything further behind the newest id counts as already delivered.  The
/// sending side never lets its ids run `window` past an unacknowledged
/// message, so a retransmission always lands inside the window.
#[derive(Debug)]
struct MessageFilter {
    seen: HashSet<Seq>,
    newest: Option<Seq>,
    window: u32,
}

impl MessageFilter {
    fn new(window: usize) -> Self {
        Self {
            seen: HashSet::new(),
            newest: None,
            window: u32::try_from(window).unwrap_or(u32::MAX).max(1),
        }
    }

    fn insert(&mut self, id: u32) -> bool {
        let id = Seq(id);
        match self.newest {
            Some(newest) if id.is_before(newest) => {
                if id.distance_to(newest) >= self.window {
                    return false;
                }
            }
            _ => self.newest = Some(id),
        }
        if !self.seen.insert(id) {
            return false;
        }
        if self.seen.len() > 2 * self.window as usize {
            self.prune();
        }
        true
    }

    fn prune(&mut self) {
        let Some(newest) = self.newest else { return };
        let window = self.window;
        self.seen.retain(|id| id.distance_to(newest) < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver(expected: u32) -> Receiver {
        Receiver::new(Seq(expected), 16, 1024, 8)
    }

    fn data(bytes: &[u8]) -> Segment {
        Segment::Data(bytes.to_vec())
    }

    #[test]
    fn in_order_segment_delivered() {
        let mut r = receiver(100);
        let got = r.on_segment(Seq(100), data(b"hello")).unwrap();
        assert_eq!(got, Received::Delivered(vec![data(b"hello")]));
        assert_eq!(r.ack_number(), Seq(101));
    }

    #[test]
    fn early_segment_is_buffered_then_drained() {
        let mut r = receiver(0);
        assert_eq!(r.on_segment(Seq(2), data(b"c")).unwrap(), Received::Buffered);
        assert_eq!(r.on_segment(Seq(1), data(b"b")).unwrap(), Received::Buffered);
        assert_eq!(r.ack_number(), Seq(0));
        assert_eq!(r.buffered(), 2);

        let got = r.on_segment(Seq(0), data(b"a")).unwrap();
        assert_eq!(
            got,
            Received::Delivered(vec![data(b"a"), data(b"b"), data(b"c")])
        );
        assert_eq!(r.ack_number(), Seq(3));
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.buffered_bytes(), 0);
    }

    #[test]
    fn duplicate_segment_discarded() {
        let mut r = receiver(0);
        r.on_segment(Seq(0), data(b"x")).unwrap();
        assert_eq!(r.on_segment(Seq(0), data(b"x")).unwrap(), Received::Duplicate);
        r.on_segment(Seq(3), data(b"y")).unwrap();
        assert_eq!(r.on_segment(Seq(3), data(b"y")).unwrap(), Received::Duplicate);
        assert_eq!(r.buffered(), 1);
    }

    #[test]
    fn reorder_frame_cap_overflows() {
        let mut r = Receiver::new(Seq(0), 2, 1024, 8);
        r.on_segment(Seq(1), data(b"a")).unwrap();
        r.on_segment(Seq(2), data(b"b")).unwrap();
        assert_eq!(r.on_segment(Seq(3), data(b"c")), Err(ReorderOverflow));
    }

    #[test]
    fn reorder_byte_cap_overflows() {
        let mut r = Receiver::new(Seq(0), 16, 4, 8);
        r.on_segment(Seq(1), data(b"abc")).unwrap();
        assert_eq!(r.on_segment(Seq(2), data(b"de")), Err(ReorderOverflow));
    }

    #[test]
    fn nothing_is_delivered_after_end() {
        let mut r = receiver(0);
        r.on_segment(Seq(2), data(b"late")).unwrap();
        let got = r.on_segment(Seq(0), Segment::End).unwrap();
        assert_eq!(got, Received::Delivered(vec![Segment::End]));
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.on_segment(Seq(1), data(b"x")).unwrap(), Received::Duplicate);
    }

    #[test]
    fn seq_wrap_around() {
        let start = u32::MAX - 1;
        let mut r = receiver(start);
        r.on_segment(Seq(0), data(b"2")).unwrap();
        r.on_segment(Seq(u32::MAX), data(b"1")).unwrap();
        let got = r.on_segment(Seq(start), data(b"0")).unwrap();
        assert_eq!(
            got,
            Received::Delivered(vec![data(b"0"), data(b"1"), data(b"2")])
        );
        assert_eq!(r.ack_number(), Seq(1));
    }

    #[test]
    fn expected_is_fixed_after_first_segment() {
        let mut r = receiver(0);
        assert!(r.reset_expected(Seq(9)));
        r.on_segment(Seq(9), data(b"")).unwrap();
        assert!(!r.reset_expected(Seq(0)));
    }

    #[test]
    fn moving_expected_drops_parked_segments() {
        let mut r = receiver(0);
        r.on_segment(Seq(5), data(b"early")).unwrap();
        assert!(r.reset_expected(Seq(3)));
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.buffered_bytes(), 0);

        let got = r.on_segment(Seq(3), data(b"a")).unwrap();
        assert_eq!(got, Received::Delivered(vec![data(b"a")]));
        assert_eq!(r.ack_number(), Seq(4));
    }

    #[test]
    fn message_ids_within_window_are_deduplicated() {
        let mut r = Receiver::new(Seq(0), 1, 1, 4);
        assert!(r.first_sighting(10));
        assert!(r.first_sighting(8));
        assert!(!r.first_sighting(8));
        assert!(r.first_sighting(13));
        // Four behind the newest id: treated as delivered.
        assert!(!r.first_sighting(9));
        assert!(r.first_sighting(11));
        assert!(!r.first_sighting(10));
    }

    #[test]
    fn old_message_id_is_remembered_across_many_newer() {
        let mut r = Receiver::new(Seq(0), 1, 1, 1024);
        assert!(r.first_sighting(0));
        for id in 1..1024 {
            assert!(r.first_sighting(id));
        }
        assert!(!r.first_sighting(0));
        for id in 1024..5000 {
            assert!(r.first_sighting(id));
        }
        assert!(!r.first_sighting(0));
        assert!(!r.first_sighting(4000));
    }

    #[test]
    fn message_ids_wrap() {
        let mut r = Receiver::new(Seq(0), 1, 1, 8);
        assert!(r.first_sighting(u32::MAX));
        assert!(r.first_sighting(1));
        assert!(!r.first_sighting(u32::MAX));
        assert!(r.first_sighting(0));
    }
}
