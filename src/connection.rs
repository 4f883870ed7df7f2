//! Per-stream protocol state machine.
//!
//! A [`Connection`] is one virtual stream multiplexed over a UDP socket.  It
//! is sans-IO: inputs are host operations ([`Connection::write`],
//! [`Connection::connect`], ...), inbound frames ([`Connection::on_frame`])
//! and timer expiry ([`Connection::on_timeout`]); outputs are drained with
//! [`Connection::poll_transmit`] and [`Connection::poll_notice`].  The owning
//! [`crate::mux::Mux`] does the routing and the [`crate::transport`] loop does
//! the actual I/O.
//!
//! # Lifecycle
//!
//! ```text
//!  create ─▶ Unconnected ──(firewall accepts)──▶ Unconnected + PRECONNECT
//!                 │                                       │
//!                 └──────────── connect() ────────────────┘
//!                                  │
//!                                  ▼
//!                    Connected ──end() / peer END──▶ Closing
//!                                                       │
//!            local END acked and peer END received      ▼
//!                                                   Destroyed
//! ```
//!
//! `destroy()`, a peer DESTROY, a resource overflow or a retransmission
//! timeout move any state straight to `Destroyed`.
//!
//! In PRECONNECT mode received data is surfaced right away but nothing is
//! transmitted; the ACKs owed for it go out on `connect()`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::Config;
use crate::error::{Error, Resource, Result};
use crate::flow::{Admission, FlowController};
use crate::mux::{Firewall, StreamKey};
use crate::packet::{flags, Frame, FrameType};
use crate::receiver::{Received, Receiver};
use crate::sender::{InFlight, Segment, Sender};
use crate::seq::Seq;
use crate::state::StreamState;
use crate::stream::StreamEvent;
use crate::timer::RetransmitTimer;

/// Where the peer stream lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remote {
    /// The peer's local id; our frames carry it as destination.
    pub id: u32,
    pub addr: SocketAddr,
}

/// Initial sequence numbers for `connect`.  Each applies only while its
/// direction is untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub seq: Option<u32>,
    pub ack: Option<u32>,
}

/// Output for the host side of a stream.
#[derive(Debug, Clone)]
pub enum Notice {
    Event(StreamEvent),
    /// The flush request with this token completed.
    Flushed(u64),
}

pub struct Connection {
    key: StreamKey,
    local_id: u32,
    state: StreamState,
    remote: Option<Remote>,
    /// Source address accepted by the firewall while still unconnected.
    candidate: Option<SocketAddr>,
    firewall: Option<Firewall>,

    sender: Sender,
    receiver: Receiver,
    flow: FlowController,
    timer: RetransmitTimer,
    retries: u32,

    max_payload: usize,
    max_send_buffer: usize,
    max_pending_messages: usize,

    local_ended: bool,
    end_acked: bool,
    remote_ended: bool,
    /// Mutual close completed without error.
    graceful: bool,
    /// Peer DESTROY seen before connect.
    reset_pending: bool,
    /// DATA received before connect needs a cumulative ACK.
    ack_owed: bool,
    /// Reliable messages received before connect.
    message_acks_owed: Vec<u32>,

    /// Flush tokens waiting for everything before `Seq` to be dispatched.
    flushes: Vec<(Seq, u64)>,
    outbox: VecDeque<(SocketAddr, Frame)>,
    notices: VecDeque<Notice>,
}

impl Connection {
    pub fn new(
        key: StreamKey,
        local_id: u32,
        initial_seq: Option<u32>,
        firewall: Option<Firewall>,
        config: &Config,
    ) -> Self {
        Self {
            key,
            local_id,
            state: StreamState::Unconnected,
            remote: None,
            candidate: None,
            firewall,
            sender: Sender::new(Seq(initial_seq.unwrap_or(0)), config.window)
                .with_message_window(config.message_dedup_window),
            receiver: Receiver::new(
                Seq(0),
                config.reorder_max_frames,
                config.reorder_max_bytes,
                config.message_dedup_window,
            ),
            flow: FlowController::new(config.high_water, config.low_water),
            timer: RetransmitTimer::new(config.timer.clone()),
            retries: 0,
            max_payload: config.max_payload,
            max_send_buffer: config.max_send_buffer,
            max_pending_messages: config.max_pending_messages,
            local_ended: false,
            end_acked: false,
            remote_ended: false,
            graceful: false,
            reset_pending: false,
            ack_owed: false,
            message_acks_owed: Vec::new(),
            flushes: Vec::new(),
            outbox: VecDeque::new(),
            notices: VecDeque::new(),
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn remote(&self) -> Option<Remote> {
        self.remote
    }

    pub fn firewall(&self) -> Option<&Firewall> {
        self.firewall.as_ref()
    }

    /// Unconnected, but a firewall accepted a remote candidate.
    pub fn is_preconnect(&self) -> bool {
        self.state == StreamState::Unconnected && self.candidate.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.is_destroyed()
    }

    /// Outstanding outbound work: queued or in-flight DATA, unacked messages.
    pub fn has_unacked(&self) -> bool {
        !self.is_destroyed() && self.sender.has_unacked()
    }

    /// Bind the stream to the remote the firewall accepted.
    pub fn accept_candidate(&mut self, addr: SocketAddr) {
        log::debug!("[stream {}] pre-connect candidate {addr}", self.local_id);
        self.candidate = Some(addr);
    }

    // -----------------------------------------------------------------------
    // Host operations
    // -----------------------------------------------------------------------

    pub fn connect(&mut self, remote: Remote, options: ConnectOptions, now: Instant) -> Result<()> {
        self.ensure_alive()?;
        if self.state != StreamState::Unconnected {
            return Err(self.violation("connect"));
        }
        if let Some(seq) = options.seq {
            self.sender.reset_initial_seq(Seq(seq));
        }
        if let Some(ack) = options.ack {
            self.receiver.reset_expected(Seq(ack));
        }

        self.state = StreamState::Connecting;
        self.remote = Some(remote);
        self.candidate = None;
        self.state = StreamState::Connected;
        log::info!(
            "[stream {}] connected to {} at {}",
            self.local_id,
            remote.id,
            remote.addr
        );
        self.emit(StreamEvent::Connect);

        if std::mem::take(&mut self.ack_owed) {
            self.queue_ack();
        }
        for id in std::mem::take(&mut self.message_acks_owed) {
            self.queue_message_ack(id);
        }
        if self.reset_pending {
            self.fail(Error::ConnectionReset, false);
            return Ok(());
        }
        if self.remote_ended {
            self.state = StreamState::Closing;
        }
        self.pump(now);
        Ok(())
    }

    /// Queue `bytes` for ordered delivery.
    pub fn write(&mut self, bytes: Vec<u8>, now: Instant) -> Result<Admission> {
        self.ensure_writable("write")?;
        self.queue_bytes(bytes);
        self.pump(now);
        self.enforce_send_cap()?;
        Ok(self.flow.admission())
    }

    /// Half-close the local direction, optionally writing `bytes` first.
    pub fn end(&mut self, bytes: Option<Vec<u8>>, now: Instant) -> Result<()> {
        self.ensure_writable("end")?;
        if let Some(bytes) = bytes {
            self.queue_bytes(bytes);
        }
        self.sender.push(Segment::End);
        self.local_ended = true;
        self.state = StreamState::Closing;
        log::debug!("[stream {}] local end queued", self.local_id);
        self.pump(now);
        self.enforce_send_cap()
    }

    /// Reliable, unordered message.
    pub fn send_message(&mut self, payload: Vec<u8>, now: Instant) -> Result<()> {
        self.ensure_messaging("send", payload.len())?;
        if self.sender.pending_messages() >= self.max_pending_messages {
            let err = Error::ResourceExhausted(Resource::MessageQueue);
            self.fail(err.clone(), true);
            return Err(err);
        }
        if let Some(id) = self.sender.push_message(payload.clone(), now) {
            let frame = self.message_frame(id, payload, 0);
            self.transmit(frame);
        } else {
            log::debug!("[stream {}] message held behind unacked ids", self.local_id);
        }
        self.timer.arm_if_idle(now);
        Ok(())
    }

    /// Best-effort message: the frame to hand to the socket right away.
    ///
    /// Nothing is retained, so a frame the caller cannot send is simply lost.
    /// `None` while an old reliable message holds the id window closed.
    pub fn try_message(&mut self, payload: Vec<u8>) -> Result<Option<(SocketAddr, Frame)>> {
        let remote = self.ensure_messaging("try_send", payload.len())?;
        let Some(id) = self.sender.allocate_message_id() else {
            log::debug!("[stream {}] best-effort message dropped", self.local_id);
            return Ok(None);
        };
        Ok(Some((
            remote.addr,
            self.message_frame(id, payload, flags::UNRELIABLE),
        )))
    }

    /// Register a flush request.  Completes immediately if nothing is queued.
    pub fn flush(&mut self, token: u64) -> Result<()> {
        self.ensure_alive()?;
        self.flushes.push((self.sender.next_seq(), token));
        self.resolve_flushes();
        Ok(())
    }

    /// Tear the stream down.  Idempotent.
    pub fn destroy(&mut self, error: Option<Error>) {
        self.teardown(error, true);
    }

    // -----------------------------------------------------------------------
    // Network input
    // -----------------------------------------------------------------------

    pub fn on_frame(&mut self, from: SocketAddr, frame: Frame, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        let connected = self.state.is_connected();
        match (self.remote, self.candidate) {
            (Some(remote), _) if remote.addr == from && remote.id == frame.src => {}
            (None, Some(candidate)) if candidate == from => {}
            _ => {
                log::debug!(
                    "[stream {}] dropping {:?} from unexpected peer {from}/{}",
                    self.local_id,
                    frame.kind,
                    frame.src
                );
                return;
            }
        }

        match frame.kind {
            FrameType::Destroy => {
                log::info!("[stream {}] ← DESTROY", self.local_id);
                if connected {
                    self.fail(Error::ConnectionReset, false);
                } else {
                    self.reset_pending = true;
                }
                return;
            }
            FrameType::Ack if frame.has_flag(flags::MESSAGE) => {
                if connected && self.sender.ack_message(frame.seq) {
                    log::debug!("[stream {}] ← ACK message {}", self.local_id, frame.seq);
                    for (id, payload) in self.sender.release_messages(now) {
                        let message = self.message_frame(id, payload, 0);
                        self.transmit(message);
                    }
                    self.on_progress(now);
                }
            }
            FrameType::Ack => {
                if connected {
                    self.on_ack(Seq(frame.ack), true, now);
                }
            }
            FrameType::Data => {
                if connected {
                    self.on_ack(Seq(frame.ack), false, now);
                }
                self.on_data(frame);
            }
            FrameType::Message => {
                if connected {
                    self.on_ack(Seq(frame.ack), false, now);
                }
                self.on_message(frame);
            }
        }

        if !self.is_destroyed() {
            self.pump(now);
            self.check_closed();
        }
    }

    /// Retransmission timer expiry.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.is_destroyed() || !self.timer.is_expired(now) {
            return;
        }
        if self.retries >= self.timer.max_retries() {
            log::warn!(
                "[stream {}] giving up after {} retransmissions",
                self.local_id,
                self.retries
            );
            self.fail(
                Error::Timeout {
                    retries: self.retries,
                },
                true,
            );
            return;
        }
        self.retries += 1;
        self.sender.on_timeout();

        if let Some(entry) = self.sender.retransmit_oldest(now) {
            let entry = entry.clone();
            log::debug!(
                "[stream {}] timeout, retransmitting seq={} (try {})",
                self.local_id,
                entry.seq,
                entry.tx_count
            );
            self.transmit_segment(&entry);
        }
        let messages: Vec<(u32, Vec<u8>)> = self
            .sender
            .retransmit_messages(now)
            .map(|m| (m.id, m.payload.clone()))
            .collect();
        for (id, payload) in messages {
            let frame = self.message_frame(id, payload, 0);
            self.transmit(frame);
        }

        self.timer.back_off();
        self.timer.arm(now);
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.is_destroyed() {
            return None;
        }
        self.timer.deadline()
    }

    pub fn poll_transmit(&mut self) -> Option<(SocketAddr, Frame)> {
        self.outbox.pop_front()
    }

    pub fn poll_notice(&mut self) -> Option<Notice> {
        self.notices.pop_front()
    }

    /// The ACK that answers late retransmissions after a graceful close.
    pub fn final_ack(&self) -> Option<(SocketAddr, Frame)> {
        if !self.graceful {
            return None;
        }
        let remote = self.remote?;
        let mut frame = Frame::new(FrameType::Ack, remote.id, self.local_id);
        frame.seq = self.sender.next_seq().raw();
        frame.ack = self.receiver.ack_number().raw();
        Some((remote.addr, frame))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn on_ack(&mut self, ack: Seq, pure: bool, now: Instant) {
        let outcome = self.sender.on_ack(ack, pure, now);
        if let Some(rtt) = outcome.rtt_sample {
            self.timer.record_rtt_sample(rtt);
        }
        if outcome.acked > 0 {
            log::debug!(
                "[stream {}] ← ACK {ack} released {}",
                self.local_id,
                outcome.acked
            );
            self.end_acked |= outcome.end_acked;
            self.on_progress(now);
        }
        if outcome.retransmit {
            if let Some(entry) = self.sender.retransmit_oldest(now) {
                let entry = entry.clone();
                log::debug!(
                    "[stream {}] fast retransmit seq={}",
                    self.local_id,
                    entry.seq
                );
                self.transmit_segment(&entry);
            }
        }
    }

    /// Some outbound work was acknowledged.
    fn on_progress(&mut self, now: Instant) {
        self.retries = 0;
        self.timer.reset();
        if self.sender.in_flight() > 0 || self.sender.pending_messages() > 0 {
            self.timer.arm(now);
        } else {
            self.timer.cancel();
        }
    }

    fn on_data(&mut self, frame: Frame) {
        let segment = if frame.has_flag(flags::END) {
            Segment::End
        } else {
            Segment::Data(frame.payload)
        };
        match self.receiver.on_segment(Seq(frame.seq), segment) {
            Ok(Received::Delivered(segments)) => {
                for segment in segments {
                    match segment {
                        Segment::Data(bytes) => self.emit(StreamEvent::Data(bytes)),
                        Segment::End => {
                            log::debug!("[stream {}] ← END", self.local_id);
                            self.remote_ended = true;
                            if self.state == StreamState::Connected {
                                self.state = StreamState::Closing;
                            }
                            self.emit(StreamEvent::End);
                        }
                    }
                }
            }
            Ok(Received::Buffered) => {
                log::debug!(
                    "[stream {}] buffered seq={} (expecting {})",
                    self.local_id,
                    frame.seq,
                    self.receiver.ack_number()
                );
            }
            Ok(Received::Duplicate) => {}
            Err(_) => {
                log::warn!("[stream {}] reorder buffer overflow", self.local_id);
                self.fail(Error::ResourceExhausted(Resource::ReorderBuffer), true);
                return;
            }
        }
        if self.state.is_connected() {
            self.queue_ack();
        } else {
            self.ack_owed = true;
        }
    }

    fn on_message(&mut self, frame: Frame) {
        let reliable = !frame.has_flag(flags::UNRELIABLE);
        if self.receiver.first_sighting(frame.seq) {
            self.emit(StreamEvent::Message(frame.payload));
        }
        if !reliable {
            return;
        }
        if self.state.is_connected() {
            self.queue_message_ack(frame.seq);
        } else {
            self.message_acks_owed.push(frame.seq);
        }
    }

    /// Move queued segments into the window.
    fn pump(&mut self, now: Instant) {
        if !self.state.is_connected() {
            return;
        }
        let mut dispatched = false;
        while let Some(entry) = self.sender.dispatch_next(now) {
            let entry = entry.clone();
            self.transmit_segment(&entry);
            dispatched = true;
            if entry.segment.is_end() {
                self.emit(StreamEvent::Finish);
            }
            if self.flow.on_released(entry.segment.len()) {
                self.emit(StreamEvent::Drain);
            }
        }
        if dispatched {
            self.timer.arm_if_idle(now);
        }
        self.resolve_flushes();
    }

    fn resolve_flushes(&mut self) {
        let sender = &self.sender;
        let mut done = Vec::new();
        self.flushes.retain(|&(target, token)| {
            let reached = sender.dispatched_before(target);
            if reached {
                done.push(token);
            }
            !reached
        });
        self.notices.extend(done.into_iter().map(Notice::Flushed));
    }

    fn check_closed(&mut self) {
        if self.local_ended && self.end_acked && self.remote_ended && !self.sender.has_unacked() {
            log::info!("[stream {}] closed", self.local_id);
            self.graceful = true;
            self.teardown(None, false);
        }
    }

    fn fail(&mut self, error: Error, notify_peer: bool) {
        log::warn!("[stream {}] destroyed: {error}", self.local_id);
        self.teardown(Some(error), notify_peer);
    }

    fn teardown(&mut self, error: Option<Error>, notify_peer: bool) {
        if self.is_destroyed() {
            return;
        }
        if notify_peer && self.state.is_connected() {
            if let Some(remote) = self.remote {
                let mut frame = Frame::new(FrameType::Destroy, remote.id, self.local_id);
                frame.ack = self.receiver.ack_number().raw();
                self.outbox.push_back((remote.addr, frame));
            }
        }
        self.state = StreamState::Destroyed;
        self.sender.clear();
        self.receiver.clear();
        self.flow.clear();
        self.timer.cancel();
        self.flushes.clear();
        if let Some(error) = error {
            self.emit(StreamEvent::Error(error));
        }
        self.emit(StreamEvent::Close);
    }

    fn queue_bytes(&mut self, bytes: Vec<u8>) {
        self.flow.on_queued(bytes.len());
        if bytes.len() <= self.max_payload {
            self.sender.push(Segment::Data(bytes));
            return;
        }
        for chunk in bytes.chunks(self.max_payload) {
            self.sender.push(Segment::Data(chunk.to_vec()));
        }
    }

    fn enforce_send_cap(&mut self) -> Result<()> {
        if self.flow.queued() > self.max_send_buffer {
            let err = Error::ResourceExhausted(Resource::SendBuffer);
            self.fail(err.clone(), true);
            return Err(err);
        }
        Ok(())
    }

    fn queue_ack(&mut self) {
        let Some(remote) = self.remote else { return };
        let mut frame = Frame::new(FrameType::Ack, remote.id, self.local_id);
        frame.seq = self.sender.next_seq().raw();
        frame.ack = self.receiver.ack_number().raw();
        self.outbox.push_back((remote.addr, frame));
    }

    fn queue_message_ack(&mut self, id: u32) {
        let Some(remote) = self.remote else { return };
        let mut frame = Frame::new(FrameType::Ack, remote.id, self.local_id);
        frame.flags = flags::MESSAGE;
        frame.seq = id;
        frame.ack = self.receiver.ack_number().raw();
        self.outbox.push_back((remote.addr, frame));
    }

    fn transmit_segment(&mut self, entry: &InFlight) {
        let Some(remote) = self.remote else { return };
        let mut frame = Frame::new(FrameType::Data, remote.id, self.local_id);
        frame.seq = entry.seq.raw();
        frame.ack = self.receiver.ack_number().raw();
        match &entry.segment {
            Segment::Data(bytes) => frame.payload = bytes.clone(),
            Segment::End => frame.flags = flags::END,
        }
        self.outbox.push_back((remote.addr, frame));
    }

    fn message_frame(&self, id: u32, payload: Vec<u8>, flags: u8) -> Frame {
        let dst = self.remote.map_or(0, |r| r.id);
        let mut frame = Frame::new(FrameType::Message, dst, self.local_id);
        frame.flags = flags;
        frame.seq = id;
        frame.ack = self.receiver.ack_number().raw();
        frame.payload = payload;
        frame
    }

    fn transmit(&mut self, frame: Frame) {
        if let Some(remote) = self.remote {
            self.outbox.push_back((remote.addr, frame));
        }
    }

    fn emit(&mut self, event: StreamEvent) {
        self.notices.push_back(Notice::Event(event));
    }

    fn violation(&self, operation: &'static str) -> Error {
        Error::StateViolation {
            state: self.state,
            operation,
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::StreamClosed);
        }
        Ok(())
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<()> {
        self.ensure_alive()?;
        if !self.state.is_connected() || self.local_ended {
            return Err(self.violation(operation));
        }
        Ok(())
    }

    fn ensure_messaging(&self, operation: &'static str, len: usize) -> Result<Remote> {
        self.ensure_alive()?;
        let remote = match self.remote {
            Some(remote) if self.state.is_connected() => remote,
            _ => return Err(self.violation(operation)),
        };
        if len > self.max_payload {
            return Err(Error::MessageTooLarge {
                len,
                max: self.max_payload,
            });
        }
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::timer::TimerConfig;

    const PEER: &str = "127.0.0.1:9000";

    fn config() -> Config {
        Config {
            max_payload: 4,
            window: 2,
            high_water: 8,
            low_water: 2,
            max_send_buffer: 64,
            timer: TimerConfig {
                max_retries: 2,
                ..TimerConfig::default()
            },
            ..Config::default()
        }
    }

    fn peer() -> SocketAddr {
        PEER.parse().unwrap()
    }

    fn connected() -> (Connection, Instant) {
        let now = Instant::now();
        let mut conn = Connection::new(StreamKey::new(1), 1, None, None, &config());
        conn.connect(Remote { id: 2, addr: peer() }, ConnectOptions::default(), now)
            .unwrap();
        drain_notices(&mut conn);
        (conn, now)
    }

    fn drain_frames(conn: &mut Connection) -> Vec<Frame> {
        std::iter::from_fn(|| conn.poll_transmit()).map(|(_, f)| f).collect()
    }

    fn drain_notices(conn: &mut Connection) -> Vec<Notice> {
        std::iter::from_fn(|| conn.poll_notice()).collect()
    }

    fn events(conn: &mut Connection) -> Vec<StreamEvent> {
        drain_notices(conn)
            .into_iter()
            .filter_map(|n| match n {
                Notice::Event(e) => Some(e),
                Notice::Flushed(_) => None,
            })
            .collect()
    }

    fn data(seq: u32, payload: &[u8]) -> Frame {
        let mut f = Frame::new(FrameType::Data, 1, 2);
        f.seq = seq;
        f.payload = payload.to_vec();
        f
    }

    fn ack(ack: u32) -> Frame {
        let mut f = Frame::new(FrameType::Ack, 1, 2);
        f.ack = ack;
        f
    }

    #[test]
    fn write_before_connect_is_a_state_violation() {
        let mut conn = Connection::new(StreamKey::new(1), 1, None, None, &config());
        let err = conn.write(b"x".to_vec(), Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            Error::StateViolation {
                state: StreamState::Unconnected,
                operation: "write"
            }
        ));
    }

    #[test]
    fn connect_twice_fails() {
        let (mut conn, now) = connected();
        let err = conn
            .connect(Remote { id: 2, addr: peer() }, ConnectOptions::default(), now)
            .unwrap_err();
        assert!(matches!(err, Error::StateViolation { .. }));
    }

    #[test]
    fn large_write_is_split_and_windowed() {
        let (mut conn, now) = connected();
        conn.write(b"abcdefghij".to_vec(), now).unwrap();
        let frames = drain_frames(&mut conn);
        // 3 segments, window of 2.
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"abcd");
        assert_eq!(frames[1].payload, b"efgh");
        assert!(conn.has_unacked());

        conn.on_frame(peer(), ack(1), now);
        let frames = drain_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 2);
        assert_eq!(frames[0].payload, b"ij");
    }

    #[test]
    fn empty_write_sends_one_empty_frame() {
        let (mut conn, now) = connected();
        conn.write(Vec::new(), now).unwrap();
        let frames = drain_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
        assert!(!frames[0].has_flag(flags::END));
    }

    #[test]
    fn full_then_drain() {
        let (mut conn, now) = connected();
        // Two frames go in flight, the remaining 12 bytes stay queued.
        let admission = conn.write(vec![0u8; 20], now).unwrap();
        assert_eq!(admission, Admission::Full);

        conn.on_frame(peer(), ack(2), now);
        conn.on_frame(peer(), ack(4), now);
        let drained = events(&mut conn)
            .iter()
            .filter(|e| matches!(e, StreamEvent::Drain))
            .count();
        assert_eq!(drained, 1);
    }

    #[test]
    fn send_buffer_cap_destroys() {
        let (mut conn, now) = connected();
        let err = conn.write(vec![0u8; 200], now).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(Resource::SendBuffer)));
        assert!(conn.is_destroyed());
        let evs = events(&mut conn);
        assert!(matches!(evs[0], StreamEvent::Error(Error::ResourceExhausted(_))));
        assert!(matches!(evs[1], StreamEvent::Close));
    }

    #[test]
    fn in_order_data_is_delivered_and_acked() {
        let (mut conn, now) = connected();
        conn.on_frame(peer(), data(0, b"hi"), now);
        let evs = events(&mut conn);
        assert!(matches!(&evs[..], [StreamEvent::Data(b)] if b == b"hi"));
        let frames = drain_frames(&mut conn);
        assert_eq!(frames[0].kind, FrameType::Ack);
        assert_eq!(frames[0].ack, 1);
    }

    #[test]
    fn duplicate_data_is_reacked() {
        let (mut conn, now) = connected();
        conn.on_frame(peer(), data(0, b"hi"), now);
        conn.on_frame(peer(), data(0, b"hi"), now);
        assert_eq!(events(&mut conn).len(), 1);
        assert_eq!(drain_frames(&mut conn).len(), 2);
    }

    #[test]
    fn frames_from_other_peers_are_ignored() {
        let (mut conn, now) = connected();
        let stranger: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        conn.on_frame(stranger, data(0, b"no"), now);
        assert!(events(&mut conn).is_empty());
        assert!(drain_frames(&mut conn).is_empty());
    }

    #[test]
    fn peer_destroy_resets() {
        let (mut conn, now) = connected();
        conn.on_frame(peer(), Frame::new(FrameType::Destroy, 1, 2), now);
        let evs = events(&mut conn);
        assert!(matches!(evs[0], StreamEvent::Error(Error::ConnectionReset)));
        assert!(matches!(evs[1], StreamEvent::Close));
        // No DESTROY back to a peer that is already gone.
        assert!(drain_frames(&mut conn).is_empty());
    }

    #[test]
    fn destroy_is_idempotent_and_notifies_peer() {
        let (mut conn, _) = connected();
        conn.destroy(None);
        conn.destroy(Some(Error::Aborted("again".into())));
        let evs = events(&mut conn);
        assert_eq!(evs.len(), 1);
        assert!(matches!(evs[0], StreamEvent::Close));
        let frames = drain_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameType::Destroy);
        assert!(matches!(
            conn.write(b"x".to_vec(), Instant::now()),
            Err(Error::StreamClosed)
        ));
    }

    #[test]
    fn graceful_close_after_both_ends() {
        let (mut conn, now) = connected();
        conn.end(None, now).unwrap();
        let frames = drain_frames(&mut conn);
        assert!(frames[0].has_flag(flags::END));
        assert!(matches!(events(&mut conn)[..], [StreamEvent::Finish]));

        let mut end = data(0, b"");
        end.flags = flags::END;
        end.ack = 1;
        conn.on_frame(peer(), end, now);
        let evs = events(&mut conn);
        assert!(matches!(evs[..], [StreamEvent::End, StreamEvent::Close]));
        assert!(conn.is_destroyed());
        assert_eq!(conn.final_ack().unwrap().1.ack, 1);
    }

    #[test]
    fn write_after_end_is_rejected() {
        let (mut conn, now) = connected();
        conn.end(None, now).unwrap();
        assert!(matches!(
            conn.write(b"late".to_vec(), now),
            Err(Error::StateViolation { operation: "write", .. })
        ));
    }

    #[test]
    fn timeout_retransmits_then_gives_up() {
        let (mut conn, now) = connected();
        conn.write(b"x".to_vec(), now).unwrap();
        drain_frames(&mut conn);

        let mut t = now;
        for _ in 0..2 {
            t = conn.poll_timeout().unwrap();
            conn.on_timeout(t);
            let frames = drain_frames(&mut conn);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].seq, 0);
        }
        conn.on_timeout(conn.poll_timeout().unwrap_or(t + Duration::from_secs(60)));
        assert!(conn.is_destroyed());
        let evs = events(&mut conn);
        assert!(matches!(evs[0], StreamEvent::Error(Error::Timeout { retries: 2 })));
        assert_eq!(drain_frames(&mut conn)[0].kind, FrameType::Destroy);
    }

    #[test]
    fn fast_retransmit_after_three_duplicate_acks() {
        let (mut conn, now) = connected();
        conn.write(b"aaaabbbb".to_vec(), now).unwrap();
        drain_frames(&mut conn);
        for _ in 0..3 {
            conn.on_frame(peer(), ack(0), now);
        }
        let frames = drain_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 0);
    }

    #[test]
    fn reliable_message_is_acked_and_deduplicated() {
        let (mut conn, now) = connected();
        let mut msg = Frame::new(FrameType::Message, 1, 2);
        msg.seq = 7;
        msg.payload = b"m".to_vec();
        conn.on_frame(peer(), msg.clone(), now);
        conn.on_frame(peer(), msg, now);
        assert_eq!(events(&mut conn).len(), 1);
        let frames = drain_frames(&mut conn);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.has_flag(flags::MESSAGE) && f.seq == 7));
    }

    #[test]
    fn sent_message_retransmits_until_acked() {
        let (mut conn, now) = connected();
        conn.send_message(b"m".to_vec(), now).unwrap();
        let sent = drain_frames(&mut conn);
        assert_eq!(sent[0].kind, FrameType::Message);
        assert!(conn.has_unacked());

        conn.on_timeout(conn.poll_timeout().unwrap());
        assert_eq!(drain_frames(&mut conn).len(), 1);

        let mut ack = Frame::new(FrameType::Ack, 1, 2);
        ack.flags = flags::MESSAGE;
        ack.seq = sent[0].seq;
        conn.on_frame(peer(), ack, now);
        assert!(!conn.has_unacked());
        assert!(conn.poll_timeout().is_none());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let (mut conn, now) = connected();
        assert!(matches!(
            conn.send_message(vec![0; 5], now),
            Err(Error::MessageTooLarge { len: 5, max: 4 })
        ));
        assert!(conn.try_message(vec![0; 5]).is_err());
    }

    #[test]
    fn old_message_retransmitted_after_many_newer_is_delivered_once() {
        let now = Instant::now();
        let mut a = Connection::new(StreamKey::new(1), 1, None, None, &config());
        let mut b = Connection::new(StreamKey::new(2), 2, None, None, &config());
        a.connect(Remote { id: 2, addr: peer() }, ConnectOptions::default(), now)
            .unwrap();
        b.connect(Remote { id: 1, addr: peer() }, ConnectOptions::default(), now)
            .unwrap();
        drain_notices(&mut a);
        drain_notices(&mut b);

        a.send_message(b"zero".to_vec(), now).unwrap();
        for frame in drain_frames(&mut a) {
            b.on_frame(peer(), frame, now);
        }
        // The ACK for "zero" is lost.
        drain_frames(&mut b);

        let newer = config().message_dedup_window + 76;
        for _ in 0..newer {
            a.send_message(b"m".to_vec(), now).unwrap();
            for frame in drain_frames(&mut a) {
                b.on_frame(peer(), frame, now);
            }
            for frame in drain_frames(&mut b) {
                a.on_frame(peer(), frame, now);
            }
        }
        assert!(a.has_unacked());

        let deadline = a.poll_timeout().unwrap();
        a.on_timeout(deadline);
        loop {
            let from_a = drain_frames(&mut a);
            if from_a.is_empty() {
                break;
            }
            for frame in from_a {
                b.on_frame(peer(), frame, deadline);
            }
            for frame in drain_frames(&mut b) {
                a.on_frame(peer(), frame, deadline);
            }
        }

        let delivered: Vec<Vec<u8>> = events(&mut b)
            .into_iter()
            .filter_map(|e| match e {
                StreamEvent::Message(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(delivered.iter().filter(|m| m.as_slice() == b"zero").count(), 1);
        assert_eq!(delivered.len(), newer + 1);
        assert!(!a.has_unacked());
        assert!(!a.is_destroyed());
    }

    #[test]
    fn preconnect_surfaces_data_and_defers_acks() {
        let now = Instant::now();
        let mut conn = Connection::new(StreamKey::new(1), 1, None, None, &config());
        conn.accept_candidate(peer());
        assert!(conn.is_preconnect());

        conn.on_frame(peer(), data(0, b"early"), now);
        assert!(matches!(&events(&mut conn)[..], [StreamEvent::Data(b)] if b == b"early"));
        assert!(drain_frames(&mut conn).is_empty());

        conn.connect(Remote { id: 2, addr: peer() }, ConnectOptions::default(), now)
            .unwrap();
        let frames = drain_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameType::Ack);
        assert_eq!(frames[0].ack, 1);
    }

    #[test]
    fn destroy_seen_in_preconnect_resets_on_connect() {
        let now = Instant::now();
        let mut conn = Connection::new(StreamKey::new(1), 1, None, None, &config());
        conn.accept_candidate(peer());
        conn.on_frame(peer(), Frame::new(FrameType::Destroy, 1, 2), now);
        assert!(events(&mut conn).is_empty());

        conn.connect(Remote { id: 2, addr: peer() }, ConnectOptions::default(), now)
            .unwrap();
        let evs = events(&mut conn);
        assert!(matches!(
            evs[..],
            [
                StreamEvent::Connect,
                StreamEvent::Error(Error::ConnectionReset),
                StreamEvent::Close
            ]
        ));
    }

    #[test]
    fn connect_options_set_initial_sequences() {
        let now = Instant::now();
        let mut conn = Connection::new(StreamKey::new(1), 1, Some(5), None, &config());
        let options = ConnectOptions {
            seq: Some(u32::MAX),
            ack: Some(40),
        };
        conn.connect(Remote { id: 2, addr: peer() }, options, now).unwrap();
        conn.write(b"x".to_vec(), now).unwrap();
        let frames = drain_frames(&mut conn);
        assert_eq!(frames[0].seq, u32::MAX);
        assert_eq!(frames[0].ack, 40);
    }

    #[test]
    fn flush_resolves_when_queue_is_dispatched() {
        let (mut conn, now) = connected();
        conn.write(vec![0u8; 12], now).unwrap();
        conn.flush(9).unwrap();
        assert!(!drain_notices(&mut conn)
            .iter()
            .any(|n| matches!(n, Notice::Flushed(9))));

        conn.on_frame(peer(), ack(1), now);
        assert!(drain_notices(&mut conn)
            .iter()
            .any(|n| matches!(n, Notice::Flushed(9))));
    }
}
