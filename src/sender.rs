//! Send-side state machine for one stream.
//!
//! [`Sender`] owns every outbound DATA segment from the moment it is written
//! until the peer acknowledges it, plus the reliable messages awaiting their
//! own acknowledgement.
//!
//! # Sequence-number layout
//!
//! ```text
//!  send_base        next_unsent        next_seq
//!      │                 │                 │
//!  ────┼─────────────────┼─────────────────┼──────────▶ seq space
//!      │ <── in flight ─▶│ <── queued ────▶│
//! ```
//!
//! - Every segment (data or END) consumes exactly one sequence number.
//! - At most `window` segments are in flight; the rest wait in `queued`.
//! - ACKs are **cumulative**: `ack = K` releases every in-flight segment whose
//!   sequence number is modularly before `K`.
//! - Three duplicate ACKs, or a partial ACK while recovering, ask the caller
//!   to retransmit the oldest in-flight segment.
//!
//! This module only manages state; building frames and all I/O are the
//! caller's responsibility.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::seq::Seq;

/// Duplicate ACKs that trigger a fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// Default spread between the oldest unacknowledged message id and the next
/// id handed out.
const DEFAULT_MESSAGE_WINDOW: u32 = 1024;

/// Payload of one sequenced segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Data(Vec<u8>),
    /// End of the sender's direction.
    End,
}

impl Segment {
    /// Payload bytes carried by this segment.
    pub fn len(&self) -> usize {
        match self {
            Self::Data(bytes) => bytes.len(),
            Self::End => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

/// A segment that has been handed to the socket but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub seq: Seq,
    pub segment: Segment,
    /// Total number of times this segment has been transmitted.
    pub tx_count: u32,
    /// Time of the most recent transmission (for RTT sampling).
    pub sent_at: Instant,
}

/// A reliable message awaiting its acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: u32,
    pub payload: Vec<u8>,
    pub tx_count: u32,
    pub sent_at: Instant,
}

/// What a cumulative ACK changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Segments released by this ACK.
    pub acked: usize,
    /// The END segment was among the released ones.
    pub end_acked: bool,
    /// RTT measured from a segment transmitted exactly once.
    pub rtt_sample: Option<Duration>,
    /// The caller should retransmit the oldest in-flight segment now.
    pub retransmit: bool,
}

/// Send-side state for one stream.
#[derive(Debug)]
pub struct Sender {
    /// Oldest sequence number not yet acknowledged (left window edge).
    send_base: Seq,
    /// Sequence number for the next written segment.
    next_seq: Seq,
    /// Maximum number of segments in flight at once.
    window: usize,
    /// Written, waiting for window space (front = oldest).
    queued: VecDeque<(Seq, Segment)>,
    /// Handed to the socket, awaiting acknowledgement (front = oldest).
    in_flight: VecDeque<InFlight>,
    dup_acks: u32,
    /// While set, ACKs below this point are partial ACKs of a recovery.
    recover: Option<Seq>,
    /// Set once any segment has been written.
    touched: bool,
    next_message_id: u32,
    /// New ids stay less than this far past the oldest pending message, so
    /// the peer's de-dup window always covers every retransmission.
    message_window: u32,
    /// Sent, awaiting acknowledgement, in id order.
    messages: VecDeque<PendingMessage>,
    /// Accepted reliable messages still waiting for an id.
    held: VecDeque<Vec<u8>>,
}

impl Sender {
    /// Create a new [`Sender`] whose first segment will carry `initial_seq`.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(initial_seq: Seq, window: usize) -> Self {
        assert!(window >= 1, "window must be at least 1");
        Self {
            send_base: initial_seq,
            next_seq: initial_seq,
            window,
            queued: VecDeque::new(),
            in_flight: VecDeque::with_capacity(window),
            dup_acks: 0,
            recover: None,
            touched: false,
            next_message_id: 0,
            message_window: DEFAULT_MESSAGE_WINDOW,
            messages: VecDeque::new(),
            held: VecDeque::new(),
        }
    }

    /// Limit how far message ids may run ahead of the oldest unacknowledged
    /// one.  Should match the receiver's de-dup window.
    pub fn with_message_window(mut self, window: usize) -> Self {
        self.message_window = u32::try_from(window).unwrap_or(u32::MAX).max(1);
        self
    }

    /// Move the starting sequence number.  Ignored once anything was written.
    pub fn reset_initial_seq(&mut self, seq: Seq) -> bool {
        if self.touched {
            return false;
        }
        self.send_base = seq;
        self.next_seq = seq;
        true
    }

    pub fn next_seq(&self) -> Seq {
        self.next_seq
    }

    pub fn send_base(&self) -> Seq {
        self.send_base
    }

    /// First sequence number that has not been handed to the socket.
    pub fn next_unsent(&self) -> Seq {
        self.queued.front().map_or(self.next_seq, |(seq, _)| *seq)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Reliable messages not yet acknowledged, including held ones.
    pub fn pending_messages(&self) -> usize {
        self.messages.len() + self.held.len()
    }

    /// `true` while any segment or reliable message awaits acknowledgement.
    pub fn has_unacked(&self) -> bool {
        !self.queued.is_empty()
            || !self.in_flight.is_empty()
            || !self.messages.is_empty()
            || !self.held.is_empty()
    }

    /// `true` once every segment written before `target` was handed off.
    pub fn dispatched_before(&self, target: Seq) -> bool {
        !self.next_unsent().is_before(target)
    }

    /// Assign the next sequence number to `segment` and queue it.
    pub fn push(&mut self, segment: Segment) -> Seq {
        let seq = self.next_seq;
        self.queued.push_back((seq, segment));
        self.next_seq = seq.next();
        self.touched = true;
        seq
    }

    /// Move the oldest queued segment into the window, if there is room.
    ///
    /// The returned entry is what the caller must transmit now.
    pub fn dispatch_next(&mut self, now: Instant) -> Option<&InFlight> {
        if self.in_flight.len() >= self.window {
            return None;
        }
        let (seq, segment) = self.queued.pop_front()?;
        self.in_flight.push_back(InFlight {
            seq,
            segment,
            tx_count: 1,
            sent_at: now,
        });
        self.in_flight.back()
    }

    /// Process a cumulative ACK.
    ///
    /// ACKs outside `[send_base, next_unsent]` are stale or bogus and change
    /// nothing.  Only `pure` ACKs (no piggybacked payload) count as
    /// duplicates.
    pub fn on_ack(&mut self, ack: Seq, pure: bool, now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let next_unsent = self.next_unsent();
        if !ack.in_range(self.send_base, next_unsent.next()) {
            return outcome;
        }

        if ack == self.send_base {
            if pure && !self.in_flight.is_empty() {
                self.dup_acks += 1;
                if self.dup_acks == DUP_ACK_THRESHOLD && self.recover.is_none() {
                    self.recover = self.in_flight.back().map(|e| e.seq.next());
                    outcome.retransmit = true;
                }
            }
            return outcome;
        }

        while let Some(entry) = self.in_flight.pop_front() {
            if !entry.seq.is_before(ack) {
                self.in_flight.push_front(entry);
                break;
            }
            outcome.acked += 1;
            outcome.end_acked |= entry.segment.is_end();
            // Karn's rule: only unambiguous samples.
            if entry.tx_count == 1 {
                outcome.rtt_sample = Some(now.saturating_duration_since(entry.sent_at));
            }
        }
        self.send_base = ack;
        self.dup_acks = 0;

        if let Some(recover) = self.recover {
            if ack.is_before(recover) {
                // Partial ACK: the next hole is lost too.
                outcome.retransmit = !self.in_flight.is_empty();
            } else {
                self.recover = None;
            }
        }
        outcome
    }

    /// The oldest in-flight segment, marked as retransmitted.
    pub fn retransmit_oldest(&mut self, now: Instant) -> Option<&InFlight> {
        let entry = self.in_flight.front_mut()?;
        entry.tx_count += 1;
        entry.sent_at = now;
        Some(entry)
    }

    /// Begin a retransmission episode after a timeout.
    pub fn on_timeout(&mut self) {
        self.dup_acks = 0;
        self.recover = self.in_flight.back().map(|e| e.seq.next());
    }

    /// Register a reliable message.
    ///
    /// Returns the id to transmit it under, or `None` if the message is held
    /// until older messages are acknowledged (see [`Sender::release_messages`]).
    pub fn push_message(&mut self, payload: Vec<u8>, now: Instant) -> Option<u32> {
        if !self.held.is_empty() || !self.message_id_available() {
            self.held.push_back(payload);
            return None;
        }
        Some(self.start_message(payload, now))
    }

    /// Id for a best-effort message that will never be tracked.  `None` while
    /// the id window is exhausted.
    pub fn allocate_message_id(&mut self) -> Option<u32> {
        if !self.message_id_available() {
            return None;
        }
        Some(self.next_id())
    }

    /// Held messages the id window now admits, oldest first.
    pub fn release_messages(&mut self, now: Instant) -> Vec<(u32, Vec<u8>)> {
        let mut released = Vec::new();
        while self.message_id_available() {
            let Some(payload) = self.held.pop_front() else {
                break;
            };
            let id = self.start_message(payload.clone(), now);
            released.push((id, payload));
        }
        released
    }

    fn message_id_available(&self) -> bool {
        self.messages.front().map_or(true, |oldest| {
            self.next_message_id.wrapping_sub(oldest.id) < self.message_window
        })
    }

    fn start_message(&mut self, payload: Vec<u8>, now: Instant) -> u32 {
        let id = self.next_id();
        self.messages.push_back(PendingMessage {
            id,
            payload,
            tx_count: 1,
            sent_at: now,
        });
        id
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = id.wrapping_add(1);
        id
    }

    /// Drop a message once the peer acknowledged it.  Returns `false` for
    /// unknown (already acknowledged or bogus) ids.
    pub fn ack_message(&mut self, id: u32) -> bool {
        match self.messages.iter().position(|m| m.id == id) {
            Some(index) => {
                self.messages.remove(index);
                true
            }
            None => false,
        }
    }

    /// Every pending message, marked as retransmitted.
    pub fn retransmit_messages(&mut self, now: Instant) -> impl Iterator<Item = &PendingMessage> {
        for message in &mut self.messages {
            message.tx_count += 1;
            message.sent_at = now;
        }
        self.messages.iter()
    }

    /// Forget everything (stream destroyed).
    pub fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
        self.messages.clear();
        self.held.clear();
        self.recover = None;
        self.dup_acks = 0;
    }
}
