//! Socket-level routing for many streams over one UDP endpoint.
//!
//! A [`Mux`] owns every [`Connection`] registered on its socket, keyed by
//! local id.  Inbound datagrams are decoded and routed by destination id:
//!
//! ```text
//!  datagram ─▶ decode ─┬─ dst registered ──────────▶ Connection::on_frame
//!                      ├─ dst lingering ───────────▶ re-send final ACK
//!                      ├─ pending stream with id == dst
//!                      │     firewall accepts ─────▶ adopt (PRECONNECT)
//!                      │     firewall rejects ─────▶ drop
//!                      └─ otherwise ───────────────▶ drop
//! ```
//!
//! Like [`Connection`], the mux never performs I/O.  Encoded datagrams, socket
//! events and per-stream notices are queued for the dispatch loop.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::connection::{ConnectOptions, Connection, Notice, Remote};
use crate::error::{Error, Result};
use crate::packet::{Frame, FrameType};
use crate::socket::SocketEvent;
use crate::state::StreamState;

/// Identifies a socket within one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifies a stream within one transport, independent of its local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(u64);

impl StreamKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Snapshot of an unsolicited sender, shown to a firewall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub socket: SocketId,
    pub port: u16,
    pub host: std::net::IpAddr,
    /// 4 or 6.
    pub family: u8,
}

/// Returns `true` to reject the candidate.
pub type Firewall = Arc<dyn Fn(&Candidate) -> bool + Send + Sync>;

/// One encoded datagram ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Streams that were created but are not attached to any socket yet.
///
/// They are offered unsolicited frames addressed to their local id, in
/// creation order.
#[derive(Default)]
pub struct PendingStreams {
    streams: BTreeMap<StreamKey, Connection>,
}

impl PendingStreams {
    pub fn insert(&mut self, conn: Connection) {
        self.streams.insert(conn.key(), conn);
    }

    pub fn remove(&mut self, key: StreamKey) -> Option<Connection> {
        self.streams.remove(&key)
    }

    pub fn get_mut(&mut self, key: StreamKey) -> Option<&mut Connection> {
        self.streams.get_mut(&key)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn waiting_for(&self, local_id: u32) -> Vec<StreamKey> {
        self.streams
            .values()
            .filter(|c| c.local_id() == local_id)
            .map(Connection::key)
            .collect()
    }
}

/// Answers retransmissions addressed to a gracefully closed stream.
struct Linger {
    to: SocketAddr,
    ack: Frame,
    expires: Instant,
}

pub struct Mux {
    id: SocketId,
    config: Config,
    local_addr: Option<SocketAddr>,
    closed: bool,
    busy: bool,
    conns: HashMap<u32, Connection>,
    lingering: HashMap<u32, Linger>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<SocketEvent>,
    notices: VecDeque<(StreamKey, Notice)>,
}

impl Mux {
    pub fn new(id: SocketId, config: Config) -> Self {
        Self {
            id,
            config,
            local_addr: None,
            closed: false,
            busy: false,
            conns: HashMap::new(),
            lingering: HashMap::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            notices: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_bound(&self) -> bool {
        self.local_addr.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Registered streams, including those in PRECONNECT mode.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn contains(&self, local_id: u32) -> bool {
        self.conns.contains_key(&local_id)
    }

    pub fn stream_state(&self, local_id: u32) -> Option<StreamState> {
        self.conns.get(&local_id).map(Connection::state)
    }

    pub fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        if self.closed {
            return Err(Error::SocketClosed);
        }
        if self.local_addr.is_some() {
            return Err(Error::AlreadyBound);
        }
        log::info!("[mux] socket {:?} bound to {addr}", self.id);
        self.local_addr = Some(addr);
        Ok(())
    }

    /// Add `conn` to the routing table.
    ///
    /// On failure the connection is handed back untouched.
    pub fn register(&mut self, conn: Connection) -> std::result::Result<(), (Error, Connection)> {
        let local_id = conn.local_id();
        if self.conns.contains_key(&local_id) {
            return Err((Error::DuplicateId(local_id), conn));
        }
        self.lingering.remove(&local_id);
        self.conns.insert(local_id, conn);
        Ok(())
    }

    /// Bind a registered stream to its remote.
    pub fn connect(
        &mut self,
        local_id: u32,
        remote: Remote,
        options: ConnectOptions,
        now: Instant,
    ) -> Result<()> {
        self.stream_op(local_id, now, |conn| conn.connect(remote, options, now))
    }

    /// Run `op` against one registered stream, then collect its output.
    pub fn stream_op<T>(
        &mut self,
        local_id: u32,
        now: Instant,
        op: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conns.get_mut(&local_id).ok_or(Error::StreamClosed)?;
        let result = op(conn);
        self.collect(local_id, now);
        self.update_busy();
        result
    }

    /// Build the best-effort frame for `try_send`.  `None` once closed or
    /// when the stream has no message id to spare.
    pub fn try_message(&mut self, local_id: u32, payload: Vec<u8>) -> Result<Option<Transmit>> {
        let conn = self.conns.get_mut(&local_id).ok_or(Error::StreamClosed)?;
        let Some((to, frame)) = conn.try_message(payload)? else {
            return Ok(None);
        };
        if self.closed {
            return Ok(None);
        }
        Ok(encode(to, &frame))
    }

    /// Feed one received datagram.
    ///
    /// Returns the key of a pending stream adopted by this socket.
    pub fn on_datagram(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
        pending: &mut PendingStreams,
    ) -> Option<StreamKey> {
        if self.closed {
            return None;
        }
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[mux] dropping datagram from {from}: {e}");
                return None;
            }
        };
        log::debug!(
            "[mux] ← {:?} {}→{} seq={} ack={} len={} from {from}",
            frame.kind,
            frame.src,
            frame.dst,
            frame.seq,
            frame.ack,
            frame.payload.len()
        );

        let dst = frame.dst;
        let mut adopted = None;
        if let Some(conn) = self.conns.get_mut(&dst) {
            conn.on_frame(from, frame, now);
            self.collect(dst, now);
        } else if let Some(linger) = self.lingering.get(&dst) {
            if linger.to == from && frame.kind == FrameType::Data {
                log::debug!("[mux] re-acking lingering stream {dst}");
                let (to, ack) = (linger.to, linger.ack.clone());
                self.queue(to, &ack);
            }
        } else {
            adopted = self.offer(from, frame, now, pending);
        }
        self.update_busy();
        adopted
    }

    /// Offer an unsolicited frame to pending streams waiting on its id.
    fn offer(
        &mut self,
        from: SocketAddr,
        frame: Frame,
        now: Instant,
        pending: &mut PendingStreams,
    ) -> Option<StreamKey> {
        let candidate = Candidate {
            socket: self.id,
            port: from.port(),
            host: from.ip(),
            family: if from.is_ipv4() { 4 } else { 6 },
        };
        for key in pending.waiting_for(frame.dst) {
            let Some(firewall) = pending.get_mut(key).and_then(|c| c.firewall().cloned()) else {
                continue;
            };
            match screen(&firewall, &candidate) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(reason) => {
                    log::warn!("[mux] firewall of stream {} panicked: {reason}", frame.dst);
                    self.events
                        .push_back(SocketEvent::Fault(Error::CallbackFault(reason)));
                    continue;
                }
            }
            let Some(mut conn) = pending.remove(key) else {
                continue;
            };
            log::info!("[mux] stream {} accepted pre-connect peer {from}", frame.dst);
            let dst = frame.dst;
            conn.accept_candidate(from);
            conn.on_frame(from, frame, now);
            self.conns.insert(dst, conn);
            self.collect(dst, now);
            return Some(key);
        }
        log::debug!("[mux] no stream for id {}, dropping", frame.dst);
        None
    }

    /// Fire every expired stream timer and forget expired linger entries.
    pub fn on_timeout(&mut self, now: Instant) {
        let due: Vec<u32> = self
            .conns
            .iter()
            .filter(|(_, c)| c.poll_timeout().is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();
        for local_id in due {
            if let Some(conn) = self.conns.get_mut(&local_id) {
                conn.on_timeout(now);
            }
            self.collect(local_id, now);
        }
        self.lingering.retain(|_, l| l.expires > now);
        self.update_busy();
    }

    /// Earliest instant at which [`Mux::on_timeout`] has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let streams = self.conns.values().filter_map(Connection::poll_timeout);
        let lingers = self.lingering.values().map(|l| l.expires);
        streams.chain(lingers).min()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<SocketEvent> {
        self.events.pop_front()
    }

    pub fn poll_notice(&mut self) -> Option<(StreamKey, Notice)> {
        self.notices.pop_front()
    }

    /// Stop sending and receiving.  Registered streams are left alone.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        log::info!("[mux] socket {:?} closed", self.id);
        self.closed = true;
        self.transmits.clear();
        self.lingering.clear();
        self.events.push_back(SocketEvent::Close);
    }

    /// Drain one stream's output; drop it once destroyed.
    fn collect(&mut self, local_id: u32, now: Instant) {
        let Some(conn) = self.conns.get_mut(&local_id) else {
            return;
        };
        let key = conn.key();
        let mut frames = Vec::new();
        while let Some(out) = conn.poll_transmit() {
            frames.push(out);
        }
        while let Some(notice) = conn.poll_notice() {
            self.notices.push_back((key, notice));
        }
        let destroyed = conn.is_destroyed();
        let final_ack = if destroyed { conn.final_ack() } else { None };

        for (to, frame) in frames {
            self.queue(to, &frame);
        }
        if destroyed {
            self.conns.remove(&local_id);
            if let Some((to, ack)) = final_ack {
                if !self.closed {
                    self.lingering.insert(
                        local_id,
                        Linger {
                            to,
                            ack,
                            expires: now + self.config.linger,
                        },
                    );
                }
            }
        }
    }

    fn queue(&mut self, to: SocketAddr, frame: &Frame) {
        if self.closed {
            return;
        }
        if let Some(transmit) = encode(to, frame) {
            self.transmits.push_back(transmit);
        }
    }

    fn update_busy(&mut self) {
        let busy = self.conns.values().any(Connection::has_unacked);
        if busy == self.busy {
            return;
        }
        self.busy = busy;
        if self.closed {
            return;
        }
        self.events
            .push_back(if busy { SocketEvent::Busy } else { SocketEvent::Idle });
    }
}

fn encode(to: SocketAddr, frame: &Frame) -> Option<Transmit> {
    match frame.encode() {
        Ok(bytes) => Some(Transmit { to, bytes }),
        Err(e) => {
            log::warn!("[mux] cannot encode {:?} frame: {e}", frame.kind);
            None
        }
    }
}

/// Run a firewall, turning a panic into an error message.
fn screen(firewall: &Firewall, candidate: &Candidate) -> std::result::Result<bool, String> {
    panic::catch_unwind(AssertUnwindSafe(|| firewall(candidate))).map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "firewall panicked".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamEvent;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn mux(id: u64) -> Mux {
        let mut mux = Mux::new(SocketId::new(id), Config::default());
        mux.bind(addr(1000 + id as u16)).unwrap();
        mux
    }

    fn conn(key: u64, local_id: u32, firewall: Option<Firewall>) -> Connection {
        Connection::new(StreamKey::new(key), local_id, None, firewall, &Config::default())
    }

    fn datagram(dst: u32, src: u32, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = Frame::new(FrameType::Data, dst, src);
        frame.seq = seq;
        frame.payload = payload.to_vec();
        frame.encode().unwrap()
    }

    fn events(mux: &mut Mux) -> Vec<SocketEvent> {
        std::iter::from_fn(|| mux.poll_event()).collect()
    }

    fn stream_events(mux: &mut Mux) -> Vec<StreamEvent> {
        std::iter::from_fn(|| mux.poll_notice())
            .filter_map(|(_, n)| match n {
                Notice::Event(e) => Some(e),
                Notice::Flushed(_) => None,
            })
            .collect()
    }

    fn connected(mux: &mut Mux, local_id: u32, remote_id: u32, peer: SocketAddr) {
        let now = Instant::now();
        assert!(mux.register(conn(local_id as u64, local_id, None)).is_ok());
        mux.connect(
            local_id,
            Remote {
                id: remote_id,
                addr: peer,
            },
            ConnectOptions::default(),
            now,
        )
        .unwrap();
    }

    #[test]
    fn duplicate_local_id_is_rejected() {
        let mut mux = mux(1);
        assert!(mux.register(conn(1, 7, None)).is_ok());
        let Err((err, returned)) = mux.register(conn(2, 7, None)) else {
            panic!("duplicate registration accepted");
        };
        assert!(matches!(err, Error::DuplicateId(7)));
        assert_eq!(returned.key(), StreamKey::new(2));
    }

    #[test]
    fn routes_by_destination_id() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        connected(&mut mux, 1, 10, addr(2000));
        connected(&mut mux, 2, 20, addr(2000));
        stream_events(&mut mux);

        let now = Instant::now();
        mux.on_datagram(addr(2000), &datagram(2, 20, 0, b"two"), now, &mut pending);
        let (key, notice) = mux.poll_notice().unwrap();
        assert_eq!(key, StreamKey::new(2));
        assert!(matches!(notice, Notice::Event(StreamEvent::Data(b)) if b == b"two"));
        // One ACK back to the sender.
        let transmit = mux.poll_transmit().unwrap();
        assert_eq!(transmit.to, addr(2000));
        assert_eq!(Frame::decode(&transmit.bytes).unwrap().kind, FrameType::Ack);
    }

    #[test]
    fn corrupt_datagram_is_dropped() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        connected(&mut mux, 1, 10, addr(2000));
        stream_events(&mut mux);

        let mut bytes = datagram(1, 10, 0, b"data");
        bytes[30] ^= 0x01;
        mux.on_datagram(addr(2000), &bytes, Instant::now(), &mut pending);
        assert!(mux.poll_notice().is_none());
        assert!(mux.poll_transmit().is_none());
    }

    #[test]
    fn firewall_accepts_pending_stream() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        let firewall: Firewall = Arc::new(|c: &Candidate| c.family != 4);
        pending.insert(conn(5, 3, Some(firewall)));

        let adopted = mux.on_datagram(addr(2000), &datagram(3, 9, 0, b"hi"), Instant::now(), &mut pending);
        assert_eq!(adopted, Some(StreamKey::new(5)));
        assert!(pending.is_empty());
        assert!(mux.contains(3));
        assert!(matches!(&stream_events(&mut mux)[..], [StreamEvent::Data(b)] if b == b"hi"));
        // Nothing is sent before connect.
        assert!(mux.poll_transmit().is_none());
    }

    #[test]
    fn destroy_adopts_pending_stream_and_resets_on_connect() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        let firewall: Firewall = Arc::new(|_: &Candidate| false);
        pending.insert(conn(5, 3, Some(firewall)));

        let destroy = Frame::new(FrameType::Destroy, 3, 9).encode().unwrap();
        let now = Instant::now();
        let adopted = mux.on_datagram(addr(2000), &destroy, now, &mut pending);
        assert_eq!(adopted, Some(StreamKey::new(5)));
        assert!(mux.contains(3));
        assert!(stream_events(&mut mux).is_empty());
        assert!(mux.poll_transmit().is_none());

        let remote = Remote {
            id: 9,
            addr: addr(2000),
        };
        mux.connect(3, remote, ConnectOptions::default(), now).unwrap();
        assert!(matches!(
            stream_events(&mut mux)[..],
            [
                StreamEvent::Connect,
                StreamEvent::Error(Error::ConnectionReset),
                StreamEvent::Close
            ]
        ));
    }

    #[test]
    fn firewall_rejection_is_silent() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        let firewall: Firewall = Arc::new(|_: &Candidate| true);
        pending.insert(conn(5, 3, Some(firewall)));

        let adopted = mux.on_datagram(addr(2000), &datagram(3, 9, 0, b"hi"), Instant::now(), &mut pending);
        assert_eq!(adopted, None);
        assert_eq!(pending.len(), 1);
        assert!(events(&mut mux).is_empty());
        assert!(mux.poll_notice().is_none());
    }

    #[test]
    fn pending_stream_without_firewall_is_not_adopted() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        pending.insert(conn(5, 3, None));
        let adopted = mux.on_datagram(addr(2000), &datagram(3, 9, 0, b"hi"), Instant::now(), &mut pending);
        assert_eq!(adopted, None);
    }

    #[test]
    fn panicking_firewall_reports_fault() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        let firewall: Firewall = Arc::new(|_: &Candidate| panic!("boom"));
        pending.insert(conn(5, 3, Some(firewall)));

        let adopted = mux.on_datagram(addr(2000), &datagram(3, 9, 0, b"hi"), Instant::now(), &mut pending);
        assert_eq!(adopted, None);
        let evs = events(&mut mux);
        assert!(matches!(&evs[..], [SocketEvent::Fault(Error::CallbackFault(m))] if m == "boom"));
        assert!(mux.poll_notice().is_none());
    }

    #[test]
    fn busy_and_idle_fire_once_per_transition() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        connected(&mut mux, 1, 10, addr(2000));
        let now = Instant::now();

        mux.stream_op(1, now, |c| c.write(b"a".to_vec(), now)).unwrap();
        mux.stream_op(1, now, |c| c.write(b"b".to_vec(), now)).unwrap();
        assert!(mux.is_busy());
        assert!(matches!(&events(&mut mux)[..], [SocketEvent::Busy]));

        let mut ack = Frame::new(FrameType::Ack, 1, 10);
        ack.ack = 2;
        mux.on_datagram(addr(2000), &ack.encode().unwrap(), now, &mut pending);
        assert!(!mux.is_busy());
        assert!(matches!(&events(&mut mux)[..], [SocketEvent::Idle]));
    }

    #[test]
    fn no_idle_after_close() {
        let mut mux = mux(1);
        connected(&mut mux, 1, 10, addr(2000));
        let now = Instant::now();
        mux.stream_op(1, now, |c| c.write(b"a".to_vec(), now)).unwrap();
        events(&mut mux);

        mux.close();
        mux.stream_op(1, now, |c| {
            c.destroy(None);
            Ok(())
        })
        .unwrap();
        assert!(matches!(&events(&mut mux)[..], [SocketEvent::Close]));
        assert!(mux.poll_transmit().is_none());
        assert!(mux.is_empty());
    }

    #[test]
    fn lingering_stream_reacks_retransmitted_end() {
        let mut mux = mux(1);
        let mut pending = PendingStreams::default();
        connected(&mut mux, 1, 10, addr(2000));
        let now = Instant::now();
        mux.stream_op(1, now, |c| c.end(None, now)).unwrap();

        let mut end = Frame::new(FrameType::Data, 1, 10);
        end.flags = crate::packet::flags::END;
        end.ack = 1;
        let bytes = end.encode().unwrap();
        mux.on_datagram(addr(2000), &bytes, now, &mut pending);
        assert!(mux.is_empty());
        while mux.poll_transmit().is_some() {}

        // The peer never saw our ACK and resends its END.
        mux.on_datagram(addr(2000), &bytes, now, &mut pending);
        let transmit = mux.poll_transmit().unwrap();
        let frame = Frame::decode(&transmit.bytes).unwrap();
        assert_eq!((frame.kind, frame.ack), (FrameType::Ack, 1));

        // Linger expires.
        let later = mux.poll_timeout().unwrap();
        mux.on_timeout(later);
        mux.on_datagram(addr(2000), &bytes, later, &mut pending);
        assert!(mux.poll_transmit().is_none());
    }
}
