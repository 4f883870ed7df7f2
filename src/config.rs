//! Tunables shared by every socket and stream of a [`crate::Transport`].

use std::time::Duration;

use crate::error::{Error, Result};
use crate::packet::HEADER_LEN;
use crate::timer::TimerConfig;

/// Largest UDP payload over IPv4.
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Largest `max_payload` whose frames still fit in one datagram.
pub const MAX_FRAME_PAYLOAD: usize = MAX_UDP_PAYLOAD - HEADER_LEN;

/// Message ids are compared in a modular space; the de-dup window must stay
/// well inside half of it.
const MAX_DEDUP_WINDOW: usize = 1 << 30;

/// Protocol limits and buffer sizes.
///
/// `Config::default()` is sized for loopback and LAN use; the binary exposes
/// the interesting knobs as command-line flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest payload put in a single DATA or MESSAGE frame.
    pub max_payload: usize,
    /// DATA frames allowed in flight (sent, unacknowledged) per stream.
    pub window: usize,
    /// Unflushed bytes above which a stream reports itself full.
    pub high_water: usize,
    /// Unflushed bytes at or below which a full stream drains.
    pub low_water: usize,
    /// Unflushed bytes above which the stream is destroyed.
    pub max_send_buffer: usize,
    /// Frames the reorder buffer may hold.
    pub reorder_max_frames: usize,
    /// Payload bytes the reorder buffer may hold.
    pub reorder_max_bytes: usize,
    /// Reliable messages awaiting acknowledgement per stream.
    pub max_pending_messages: usize,
    /// Distance behind the newest message id that is still de-duplicated.
    /// Senders keep new ids within this distance of their oldest unacked
    /// message.
    pub message_dedup_window: usize,
    /// How long a gracefully closed stream id keeps answering retransmissions.
    pub linger: Duration,
    pub timer: TimerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload: 1200,
            window: 64,
            high_water: 256 * 1024,
            low_water: 64 * 1024,
            max_send_buffer: 64 * 1024 * 1024,
            reorder_max_frames: 1024,
            reorder_max_bytes: 4 * 1024 * 1024,
            max_pending_messages: 256,
            message_dedup_window: 1024,
            linger: Duration::from_secs(2),
            timer: TimerConfig::default(),
        }
    }
}

impl Config {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_payload == 0 || self.max_payload > MAX_FRAME_PAYLOAD {
            return Err(invalid("max_payload must be between 1 and 65483"));
        }
        if self.window == 0 {
            return Err(invalid("window must be at least 1"));
        }
        if self.low_water > self.high_water {
            return Err(invalid("low_water must not exceed high_water"));
        }
        if self.max_pending_messages == 0 {
            return Err(invalid("max_pending_messages must be at least 1"));
        }
        if self.message_dedup_window == 0 || self.message_dedup_window > MAX_DEDUP_WINDOW {
            return Err(invalid("message_dedup_window must be between 1 and 2^30"));
        }
        if self.timer.min_rto.is_zero() || self.timer.min_rto > self.timer.max_rto {
            return Err(invalid("min_rto must be non-zero and at most max_rto"));
        }
        if self.timer.initial_rto.is_zero() {
            return Err(invalid("initial_rto must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(reason: &'static str) -> Error {
    Error::InvalidConfig(reason)
}
