//! Per-stream retransmission deadline.
//!
//! [`RetransmitTimer`] holds the RTO estimate and, while outbound work is
//! unacknowledged, the instant at which the oldest frame is re-sent.  It never
//! sleeps; the dispatch loop polls [`RetransmitTimer::deadline`] across all
//! streams and calls back in once it passes.
//!
//! The estimator follows RFC 6298.  Samples only come from frames sent
//! exactly once (Karn's rule is enforced by the sender).  Each expiry doubles
//! the RTO up to `max_rto`; the next fresh sample or ACK progress restores it.

use std::time::{Duration, Instant};

/// Timer tunables.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Used until the first RTT sample arrives.
    pub initial_rto: Duration,
    pub min_rto: Duration,
    /// Ceiling for back-off.
    pub max_rto: Duration,
    /// Consecutive expiries tolerated before the stream gives up.
    pub max_retries: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            max_retries: 6,
        }
    }
}

/// Smoothed round-trip time and its mean deviation.
#[derive(Debug, Clone, Copy)]
struct Estimate {
    srtt: Duration,
    rttvar: Duration,
}

impl Estimate {
    fn first(sample: Duration) -> Self {
        Self {
            srtt: sample,
            rttvar: sample / 2,
        }
    }

    /// Fold in a later sample with gains 1/8 (SRTT) and 1/4 (RTTVAR).
    fn update(self, sample: Duration) -> Self {
        let deviation = sample.abs_diff(self.srtt);
        Self {
            srtt: self.srtt * 7 / 8 + sample / 8,
            rttvar: self.rttvar * 3 / 4 + deviation / 4,
        }
    }

    fn rto(self) -> Duration {
        self.srtt + self.rttvar * 4
    }
}

#[derive(Debug)]
pub struct RetransmitTimer {
    config: TimerConfig,
    rto: Duration,
    estimate: Option<Estimate>,
    deadline: Option<Instant>,
}

impl RetransmitTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            rto: config.initial_rto,
            config,
            estimate: None,
            deadline: None,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.estimate.map(|e| e.srtt)
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn record_rtt_sample(&mut self, sample: Duration) {
        self.estimate = Some(match self.estimate {
            Some(estimate) => estimate.update(sample),
            None => Estimate::first(sample),
        });
        self.reset();
    }

    /// Exponential back-off after an expiry.
    pub fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(self.config.max_rto);
    }

    /// Drop any back-off and recompute the RTO from the estimate.
    pub fn reset(&mut self) {
        self.rto = match self.estimate {
            Some(estimate) => estimate
                .rto()
                .clamp(self.config.min_rto, self.config.max_rto),
            None => self.config.initial_rto,
        };
    }

    /// Expire one RTO after `now`, replacing any earlier deadline.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.rto);
    }

    /// Like [`RetransmitTimer::arm`], but keeps a running deadline.
    pub fn arm_if_idle(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.arm(now);
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_initial_rto() {
        let timer = RetransmitTimer::new(TimerConfig::default());
        assert_eq!(timer.rto(), Duration::from_millis(1000));
        assert!(timer.deadline().is_none());
        assert!(timer.srtt().is_none());
    }

    #[test]
    fn first_sample_sets_srtt() {
        let mut timer = RetransmitTimer::new(TimerConfig::default());
        timer.record_rtt_sample(Duration::from_millis(100));
        assert_eq!(timer.srtt(), Some(Duration::from_millis(100)));
        // 100 + 4 * 50
        assert_eq!(timer.rto(), Duration::from_millis(300));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut timer = RetransmitTimer::new(TimerConfig::default());
        timer.record_rtt_sample(Duration::from_millis(100));
        timer.record_rtt_sample(Duration::from_millis(180));
        // srtt = 87.5 + 22.5, rttvar = 37.5 + 20
        assert_eq!(timer.srtt(), Some(Duration::from_millis(110)));
        assert_eq!(timer.rto(), Duration::from_millis(340));
    }

    #[test]
    fn tiny_samples_are_clamped_to_min_rto() {
        let mut timer = RetransmitTimer::new(TimerConfig::default());
        timer.record_rtt_sample(Duration::from_micros(50));
        assert_eq!(timer.rto(), Duration::from_millis(200));
    }

    #[test]
    fn back_off_doubles_up_to_max_and_reset_restores() {
        let config = TimerConfig {
            max_rto: Duration::from_secs(3),
            ..TimerConfig::default()
        };
        let mut timer = RetransmitTimer::new(config);
        timer.back_off();
        assert_eq!(timer.rto(), Duration::from_secs(2));
        timer.back_off();
        assert_eq!(timer.rto(), Duration::from_secs(3));
        timer.reset();
        assert_eq!(timer.rto(), Duration::from_secs(1));
    }

    #[test]
    fn deadline_expires() {
        let mut timer = RetransmitTimer::new(TimerConfig::default());
        let now = Instant::now();
        timer.arm(now);
        assert!(!timer.is_expired(now));
        assert!(timer.is_expired(now + Duration::from_secs(1)));

        timer.arm_if_idle(now + Duration::from_secs(5));
        assert_eq!(timer.deadline(), Some(now + Duration::from_secs(1)));

        timer.cancel();
        assert!(!timer.is_expired(now + Duration::from_secs(10)));
    }
}
