//! Deterministic network simulator for testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the reliability machinery without depending on real network conditions,
//! [`Network`] wires several [`Mux`] endpoints together through a faulty
//! [`Link`] and runs them on virtual time:
//!
//! | Fault       | Description                                           |
//! |-------------|-------------------------------------------------------|
//! | Loss        | Drop a datagram with probability `loss_rate`.         |
//! | Reordering  | Add up to `jitter` of extra delay, letting later      |
//! |             | datagrams overtake it.                                |
//! | Duplication | Deliver a datagram twice.                             |
//! | Corruption  | Flip one random bit.                                  |
//!
//! Every random choice comes from a seeded [`StdRng`], so a failing run
//! replays exactly.  Nothing here touches a real socket or clock.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::connection::{ConnectOptions, Connection, Notice, Remote};
use crate::error::Result;
use crate::mux::{Mux, PendingStreams, SocketId, StreamKey, Transmit};
use crate::socket::SocketEvent;
use crate::stream::StreamEvent;

/// Fault model.  All probabilities are in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub loss_rate: f64,
    pub reorder_rate: f64,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    /// One-way delay of every datagram.
    pub latency: Duration,
    /// Maximum extra delay of a reordered datagram.
    pub jitter: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        // No faults by default: a transparent pipe.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            latency: Duration::from_millis(10),
            jitter: Duration::from_millis(40),
        }
    }
}

struct Scheduled {
    at: Instant,
    order: u64,
    from: SocketAddr,
    transmit: Transmit,
}

/// A lossy pipe carrying datagrams between endpoints.
pub struct Link {
    config: LinkConfig,
    rng: StdRng,
    queue: Vec<Scheduled>,
    next_order: u64,
    sent: u64,
    dropped: u64,
}

impl Link {
    pub fn new(config: LinkConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            queue: Vec::new(),
            next_order: 0,
            sent: 0,
            dropped: 0,
        }
    }

    /// Datagrams offered to the link so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Datagrams the link dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn send(&mut self, now: Instant, from: SocketAddr, mut transmit: Transmit) {
        self.sent += 1;
        if self.rng.gen_bool(self.config.loss_rate) {
            self.dropped += 1;
            return;
        }
        if !transmit.bytes.is_empty() && self.rng.gen_bool(self.config.corrupt_rate) {
            let bit = self.rng.gen_range(0..transmit.bytes.len() * 8);
            transmit.bytes[bit / 8] ^= 1 << (bit % 8);
        }
        if self.rng.gen_bool(self.config.duplicate_rate) {
            let at = self.arrival(now);
            self.schedule(at, from, transmit.clone());
        }
        let at = self.arrival(now);
        self.schedule(at, from, transmit);
    }

    fn arrival(&mut self, now: Instant) -> Instant {
        let mut at = now + self.config.latency;
        if self.rng.gen_bool(self.config.reorder_rate) {
            let jitter = self.config.jitter.as_micros() as u64;
            at += Duration::from_micros(self.rng.gen_range(0..=jitter));
        }
        at
    }

    fn schedule(&mut self, at: Instant, from: SocketAddr, transmit: Transmit) {
        let order = self.next_order;
        self.next_order += 1;
        self.queue.push(Scheduled {
            at,
            order,
            from,
            transmit,
        });
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.queue.iter().map(|s| s.at).min()
    }

    /// Remove every datagram due by `now`, in arrival order.
    pub fn deliver(&mut self, now: Instant) -> Vec<(SocketAddr, Transmit)> {
        let (mut due, rest): (Vec<_>, Vec<_>) = self.queue.drain(..).partition(|s| s.at <= now);
        self.queue = rest;
        due.sort_by_key(|s| (s.at, s.order));
        due.into_iter().map(|s| (s.from, s.transmit)).collect()
    }
}

/// One simulated socket.
pub struct Endpoint {
    pub mux: Mux,
    pub pending: PendingStreams,
    addr: SocketAddr,
    notices: Vec<(StreamKey, Notice)>,
    events: Vec<SocketEvent>,
}

/// Several endpoints sharing one [`Link`] and one virtual clock.
pub struct Network {
    config: Config,
    link: Link,
    now: Instant,
    endpoints: Vec<Endpoint>,
}

impl Network {
    pub fn new(config: Config, link: Link) -> Self {
        Self {
            config,
            link,
            now: Instant::now(),
            endpoints: Vec::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Add a bound endpoint at `addr` and return its index.
    pub fn add_endpoint(&mut self, addr: SocketAddr) -> Result<usize> {
        self.config.validate()?;
        let index = self.endpoints.len();
        let mut mux = Mux::new(SocketId::new(index as u64), self.config.clone());
        mux.bind(addr)?;
        self.endpoints.push(Endpoint {
            mux,
            pending: PendingStreams::default(),
            addr,
            notices: Vec::new(),
            events: Vec::new(),
        });
        Ok(index)
    }

    pub fn addr(&self, endpoint: usize) -> SocketAddr {
        self.endpoints[endpoint].addr
    }

    pub fn endpoint(&mut self, endpoint: usize) -> &mut Endpoint {
        &mut self.endpoints[endpoint]
    }

    /// Register and connect a fresh stream on `endpoint`.
    pub fn open(
        &mut self,
        endpoint: usize,
        local_id: u32,
        remote: Remote,
        options: ConnectOptions,
    ) -> Result<StreamKey> {
        let key = StreamKey::new(((endpoint as u64) << 32) | u64::from(local_id));
        let conn = Connection::new(key, local_id, None, None, &self.config);
        let mux = &mut self.endpoints[endpoint].mux;
        mux.register(conn).map_err(|(err, _)| err)?;
        mux.connect(local_id, remote, options, self.now)?;
        self.collect();
        Ok(key)
    }

    /// Run a host operation against a registered stream.
    pub fn stream_op<T>(
        &mut self,
        endpoint: usize,
        local_id: u32,
        op: impl FnOnce(&mut Connection, Instant) -> Result<T>,
    ) -> Result<T> {
        let now = self.now;
        let result = self.endpoints[endpoint]
            .mux
            .stream_op(local_id, now, |conn| op(conn, now));
        self.collect();
        result
    }

    /// Stream events seen on `endpoint` since the last call.
    pub fn take_events(&mut self, endpoint: usize) -> Vec<(StreamKey, StreamEvent)> {
        self.endpoints[endpoint]
            .notices
            .drain(..)
            .filter_map(|(key, notice)| match notice {
                Notice::Event(event) => Some((key, event)),
                Notice::Flushed(_) => None,
            })
            .collect()
    }

    /// Flush tokens completed on `endpoint` since the last call.
    pub fn take_flushed(&mut self, endpoint: usize) -> Vec<u64> {
        let notices = &mut self.endpoints[endpoint].notices;
        let mut flushed = Vec::new();
        notices.retain(|(_, notice)| match notice {
            Notice::Flushed(token) => {
                flushed.push(*token);
                false
            }
            Notice::Event(_) => true,
        });
        flushed
    }

    pub fn take_socket_events(&mut self, endpoint: usize) -> Vec<SocketEvent> {
        std::mem::take(&mut self.endpoints[endpoint].events)
    }

    /// Advance to the next scheduled instant and process it.
    ///
    /// Returns `false` once nothing is scheduled any more.
    pub fn step(&mut self) -> bool {
        self.collect();
        let next = self
            .endpoints
            .iter()
            .filter_map(|e| e.mux.poll_timeout())
            .chain(self.link.poll_timeout())
            .min();
        let Some(next) = next else {
            return false;
        };
        if next > self.now {
            self.now = next;
        }
        let now = self.now;

        for (from, transmit) in self.link.deliver(now) {
            let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.addr == transmit.to) else {
                continue;
            };
            endpoint
                .mux
                .on_datagram(from, &transmit.bytes, now, &mut endpoint.pending);
        }
        for endpoint in &mut self.endpoints {
            endpoint.mux.on_timeout(now);
        }
        self.collect();
        true
    }

    /// Step until `done` holds or `max_steps` ran out.  Returns whether
    /// `done` held.
    pub fn run_until(&mut self, max_steps: usize, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        for _ in 0..max_steps {
            if done(self) {
                return true;
            }
            if !self.step() {
                return done(self);
            }
        }
        done(self)
    }

    fn collect(&mut self) {
        let now = self.now;
        for endpoint in &mut self.endpoints {
            while let Some(transmit) = endpoint.mux.poll_transmit() {
                self.link.send(now, endpoint.addr, transmit);
            }
            endpoint.notices.extend(std::iter::from_fn(|| endpoint.mux.poll_notice()));
            endpoint.events.extend(std::iter::from_fn(|| endpoint.mux.poll_event()));
        }
    }
}
