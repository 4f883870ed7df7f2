//! The dispatch loop that owns every socket and stream.
//!
//! # Architecture
//!
//! ```text
//!  Stream / Socket handles            Engine task (one per Transport)
//!  ───────────────────────            ─────────────────────────────────
//!   write / connect / ...  ──Command──▶  select! {
//!                                          command   → Mux / Connection
//!   recv task per socket   ──Datagram─▶    deadline  → on_timeout
//!                                        }
//!   StreamEvents / SocketEvents ◀─────  drive(): send datagrams,
//!                                        forward events, resolve flushes
//! ```
//!
//! All protocol state is mutated from the engine task only, so the sans-IO
//! types need no locking.  The loop never waits on host code: events go out
//! over unbounded channels and replies over `oneshot`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{ConnectOptions, Connection, Notice, Remote};
use crate::error::{Error, Result};
use crate::flow::Admission;
use crate::mux::{Mux, PendingStreams, SocketId, StreamKey};
use crate::socket::{Socket, SocketEvent, SocketEvents, SocketShared};
use crate::state::StreamState;
use crate::stream::{Stream, StreamEvent, StreamEvents, StreamOptions};

/// Maximum UDP payload size.
const MAX_DATAGRAM: usize = 65_535;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests from handles and receive tasks to the engine.
pub(crate) enum Command {
    CreateSocket {
        socket: SocketId,
        shared: Arc<SocketShared>,
        events: mpsc::UnboundedSender<SocketEvent>,
    },
    Attach {
        socket: SocketId,
        udp: Arc<UdpSocket>,
        reply: Reply<SocketAddr>,
    },
    CloseSocket {
        socket: SocketId,
        reply: Reply<()>,
    },
    Datagram {
        socket: SocketId,
        from: SocketAddr,
        bytes: Vec<u8>,
    },
    CreateStream {
        key: StreamKey,
        local_id: u32,
        options: StreamOptions,
        events: mpsc::UnboundedSender<StreamEvent>,
        writable: watch::Sender<bool>,
    },
    Connect {
        key: StreamKey,
        socket: SocketId,
        remote_id: u32,
        addr: SocketAddr,
        options: ConnectOptions,
        reply: Reply<SocketAddr>,
    },
    Write {
        key: StreamKey,
        bytes: Vec<u8>,
        reply: Reply<Admission>,
    },
    End {
        key: StreamKey,
        bytes: Option<Vec<u8>>,
        reply: Reply<()>,
    },
    Send {
        key: StreamKey,
        bytes: Vec<u8>,
        reply: Reply<()>,
    },
    TrySend {
        key: StreamKey,
        bytes: Vec<u8>,
        reply: Reply<bool>,
    },
    Flush {
        key: StreamKey,
        reply: Reply<()>,
    },
    Destroy {
        key: StreamKey,
        error: Option<Error>,
    },
}

/// Send `command` to the engine and wait for its reply.
pub(crate) async fn call<T>(
    commands: &mpsc::UnboundedSender<Command>,
    command: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(command(reply))
        .map_err(|_| Error::EngineStopped)?;
    rx.await.map_err(|_| Error::EngineStopped)?
}

/// Entry point: a factory for sockets and streams sharing one engine task.
///
/// Must be created inside a tokio runtime.  The engine stops once every
/// handle (transport, sockets, streams) has been dropped.
#[derive(Debug, Clone)]
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl Transport {
    pub fn new() -> Self {
        Self::spawn(Config::default())
    }

    /// Like [`Transport::new`] with custom tunables.  Fails with
    /// [`Error::InvalidConfig`] before anything is spawned.
    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::spawn(config))
    }

    fn spawn(config: Config) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(config, commands.downgrade());
        tokio::spawn(engine.run(rx));
        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A new, unbound socket.
    pub fn create_socket(&self) -> (Socket, SocketEvents) {
        let id = SocketId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(SocketShared::default());
        let (events, rx) = mpsc::unbounded_channel();
        self.submit(Command::CreateSocket {
            socket: id,
            shared: Arc::clone(&shared),
            events,
        });
        (
            Socket::new(id, self.commands.clone(), shared),
            SocketEvents::new(rx),
        )
    }

    /// A new, unconnected stream with the given local id.
    ///
    /// Local ids only need to be unique per socket, and only once the stream
    /// is connected or adopted.
    pub fn create_stream(&self, local_id: u32, options: StreamOptions) -> (Stream, StreamEvents) {
        let key = StreamKey::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (events, rx) = mpsc::unbounded_channel();
        let (writable, writable_rx) = watch::channel(true);
        self.submit(Command::CreateStream {
            key,
            local_id,
            options,
            events,
            writable,
        });
        (
            Stream::new(key, local_id, self.commands.clone(), writable_rx),
            StreamEvents::new(rx),
        )
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("[transport] engine stopped; request dropped");
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct SocketSlot {
    mux: Mux,
    shared: Arc<SocketShared>,
    events: mpsc::UnboundedSender<SocketEvent>,
    udp: Option<Arc<UdpSocket>>,
    recv_task: Option<JoinHandle<()>>,
}

impl Drop for SocketSlot {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Pending,
    Socket(SocketId),
}

struct StreamSlot {
    local_id: u32,
    location: Location,
    events: mpsc::UnboundedSender<StreamEvent>,
    writable: watch::Sender<bool>,
    flushes: HashMap<u64, Reply<()>>,
    next_flush: u64,
}

struct Engine {
    config: Config,
    /// Handed to receive tasks; weak so they do not keep the engine alive.
    commands: mpsc::WeakUnboundedSender<Command>,
    sockets: HashMap<SocketId, SocketSlot>,
    streams: HashMap<StreamKey, StreamSlot>,
    pending: PendingStreams,
}

impl Engine {
    fn new(config: Config, commands: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self {
            config,
            commands,
            sockets: HashMap::new(),
            streams: HashMap::new(),
            pending: PendingStreams::default(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        // A "disarmed" timer sleeps very far into the future.  The
        // `timer_armed` guard keeps select! from acting on it.
        let far_future = Duration::from_secs(365 * 24 * 3600);
        let timer = tokio::time::sleep(far_future);
        tokio::pin!(timer);
        let mut timer_armed = false;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                }
                _ = &mut timer, if timer_armed => {
                    let now = Instant::now();
                    for slot in self.sockets.values_mut() {
                        slot.mux.on_timeout(now);
                    }
                }
            }

            self.drive().await;

            match self.poll_timeout() {
                Some(deadline) => {
                    timer
                        .as_mut()
                        .reset(tokio::time::Instant::from_std(deadline));
                    timer_armed = true;
                }
                None => timer_armed = false,
            }
        }
        log::debug!("[transport] all handles dropped, engine stopping");
    }

    async fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::CreateSocket {
                socket,
                shared,
                events,
            } => {
                let slot = SocketSlot {
                    mux: Mux::new(socket, self.config.clone()),
                    shared,
                    events,
                    udp: None,
                    recv_task: None,
                };
                self.sockets.insert(socket, slot);
            }
            Command::Attach { socket, udp, reply } => {
                let _ = reply.send(self.attach(socket, udp));
            }
            Command::CloseSocket { socket, reply } => {
                let _ = reply.send(self.close_socket(socket).await);
            }
            Command::Datagram {
                socket,
                from,
                bytes,
            } => {
                let Some(slot) = self.sockets.get_mut(&socket) else {
                    return;
                };
                let adopted = slot.mux.on_datagram(from, &bytes, now, &mut self.pending);
                if let Some(stream) = adopted.and_then(|key| self.streams.get_mut(&key)) {
                    stream.location = Location::Socket(socket);
                }
            }
            Command::CreateStream {
                key,
                local_id,
                options,
                events,
                writable,
            } => {
                let conn = Connection::new(key, local_id, options.seq, options.firewall, &self.config);
                self.pending.insert(conn);
                let slot = StreamSlot {
                    local_id,
                    location: Location::Pending,
                    events,
                    writable,
                    flushes: HashMap::new(),
                    next_flush: 0,
                };
                self.streams.insert(key, slot);
            }
            Command::Connect {
                key,
                socket,
                remote_id,
                addr,
                options,
                reply,
            } => {
                let remote = Remote { id: remote_id, addr };
                let _ = reply.send(self.connect(key, socket, remote, options, now));
            }
            Command::Write { key, bytes, reply } => {
                let result = self.stream_op(key, now, |c| c.write(bytes, now));
                if let (Ok(Admission::Full), Some(slot)) = (&result, self.streams.get(&key)) {
                    slot.writable.send_replace(false);
                }
                let _ = reply.send(result);
            }
            Command::End { key, bytes, reply } => {
                let _ = reply.send(self.stream_op(key, now, |c| c.end(bytes, now)));
            }
            Command::Send { key, bytes, reply } => {
                let _ = reply.send(self.stream_op(key, now, |c| c.send_message(bytes, now)));
            }
            Command::TrySend { key, bytes, reply } => {
                let _ = reply.send(self.try_send(key, bytes, now));
            }
            Command::Flush { key, reply } => {
                let Some(slot) = self.streams.get_mut(&key) else {
                    let _ = reply.send(Err(Error::StreamClosed));
                    return;
                };
                let token = slot.next_flush;
                slot.next_flush += 1;
                slot.flushes.insert(token, reply);
                if let Err(e) = self.stream_op(key, now, |c| c.flush(token)) {
                    let waiter = self
                        .streams
                        .get_mut(&key)
                        .and_then(|slot| slot.flushes.remove(&token));
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(e));
                    }
                }
            }
            Command::Destroy { key, error } => {
                let _ = self.stream_op(key, now, |c| {
                    c.destroy(error);
                    Ok(())
                });
            }
        }
    }

    fn attach(&mut self, socket: SocketId, udp: Arc<UdpSocket>) -> Result<SocketAddr> {
        let slot = self.sockets.get_mut(&socket).ok_or(Error::SocketClosed)?;
        let local = udp.local_addr()?;
        slot.mux.bind(local)?;
        let task = tokio::spawn(recv_loop(socket, Arc::clone(&udp), self.commands.clone()));
        slot.udp = Some(udp);
        slot.recv_task = Some(task);
        Ok(local)
    }

    async fn close_socket(&mut self, socket: SocketId) -> Result<()> {
        let slot = self.sockets.get_mut(&socket).ok_or(Error::SocketClosed)?;
        if slot.mux.is_closed() {
            return Ok(());
        }
        if let Some(task) = slot.recv_task.take() {
            task.abort();
            // The endpoint is released once the task is gone.
            let _ = task.await;
        }
        slot.udp = None;
        slot.mux.close();
        slot.shared.closed.store(true, Ordering::Release);
        forward_socket_events(slot);
        Ok(())
    }

    fn connect(
        &mut self,
        key: StreamKey,
        socket: SocketId,
        remote: Remote,
        options: ConnectOptions,
        now: Instant,
    ) -> Result<SocketAddr> {
        let stream = self.streams.get(&key).ok_or(Error::StreamClosed)?;
        let (location, local_id) = (stream.location, stream.local_id);

        if let Location::Socket(owner) = location {
            if owner != socket {
                let state = self
                    .sockets
                    .get(&owner)
                    .and_then(|slot| slot.mux.stream_state(local_id))
                    .unwrap_or(StreamState::Destroyed);
                return Err(Error::StateViolation {
                    state,
                    operation: "connect",
                });
            }
        }

        let slot = self.sockets.get_mut(&socket).ok_or(Error::SocketClosed)?;
        if slot.mux.is_closed() {
            return Err(Error::SocketClosed);
        }
        let local = slot.mux.local_addr().ok_or(Error::SocketNotBound)?;

        if location == Location::Pending {
            let conn = self.pending.remove(key).ok_or(Error::StreamClosed)?;
            if let Err((err, conn)) = slot.mux.register(conn) {
                self.pending.insert(conn);
                return Err(err);
            }
            if let Some(stream) = self.streams.get_mut(&key) {
                stream.location = Location::Socket(socket);
            }
        }
        slot.mux.connect(local_id, remote, options, now)?;
        Ok(local)
    }

    fn try_send(&mut self, key: StreamKey, bytes: Vec<u8>, now: Instant) -> Result<bool> {
        let stream = self.streams.get(&key).ok_or(Error::StreamClosed)?;
        let Location::Socket(socket) = stream.location else {
            // Unconnected: let the stream report why.
            return self.stream_op(key, now, |c| c.try_message(bytes).map(|_| false));
        };
        let local_id = stream.local_id;
        let slot = self.sockets.get_mut(&socket).ok_or(Error::SocketClosed)?;
        let Some(transmit) = slot.mux.try_message(local_id, bytes)? else {
            return Ok(false);
        };
        let Some(udp) = &slot.udp else {
            return Ok(false);
        };
        match udp.try_send_to(&transmit.bytes, transmit.to) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => {
                log::warn!("[transport] try_send to {} failed: {e}", transmit.to);
                Ok(false)
            }
        }
    }

    /// Run `op` on a stream wherever it currently lives.
    fn stream_op<T>(
        &mut self,
        key: StreamKey,
        now: Instant,
        op: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let stream = self.streams.get(&key).ok_or(Error::StreamClosed)?;
        let (location, local_id) = (stream.location, stream.local_id);
        match location {
            Location::Socket(socket) => {
                let slot = self.sockets.get_mut(&socket).ok_or(Error::StreamClosed)?;
                slot.mux.stream_op(local_id, now, op)
            }
            Location::Pending => {
                let conn = self.pending.get_mut(key).ok_or(Error::StreamClosed)?;
                let result = op(conn);
                let notices: Vec<Notice> = std::iter::from_fn(|| conn.poll_notice()).collect();
                if conn.is_destroyed() {
                    self.pending.remove(key);
                }
                for notice in notices {
                    deliver(&mut self.streams, key, notice);
                }
                result
            }
        }
    }

    /// Push everything the muxes produced out to the network and the host.
    async fn drive(&mut self) {
        for slot in self.sockets.values_mut() {
            while let Some((key, notice)) = slot.mux.poll_notice() {
                deliver(&mut self.streams, key, notice);
            }
            forward_socket_events(slot);

            let Some(udp) = &slot.udp else {
                while slot.mux.poll_transmit().is_some() {}
                continue;
            };
            while let Some(transmit) = slot.mux.poll_transmit() {
                if let Err(e) = udp.send_to(&transmit.bytes, transmit.to).await {
                    log::warn!("[transport] send to {} failed: {e}", transmit.to);
                }
            }
        }
        // A closed socket is forgotten once its last stream is gone.
        self.sockets
            .retain(|_, slot| !(slot.mux.is_closed() && slot.mux.is_empty()));
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.sockets
            .values()
            .filter_map(|slot| slot.mux.poll_timeout())
            .min()
    }
}

fn forward_socket_events(slot: &mut SocketSlot) {
    while let Some(event) = slot.mux.poll_event() {
        match event {
            SocketEvent::Busy => slot.shared.busy.store(true, Ordering::Release),
            SocketEvent::Idle => slot.shared.busy.store(false, Ordering::Release),
            _ => {}
        }
        let _ = slot.events.send(event);
    }
}

/// Hand one notice to the host side of a stream.
fn deliver(streams: &mut HashMap<StreamKey, StreamSlot>, key: StreamKey, notice: Notice) {
    let Some(slot) = streams.get_mut(&key) else {
        return;
    };
    let event = match notice {
        Notice::Flushed(token) => {
            if let Some(waiter) = slot.flushes.remove(&token) {
                let _ = waiter.send(Ok(()));
            }
            return;
        }
        Notice::Event(event) => event,
    };

    let closed = matches!(event, StreamEvent::Close);
    if matches!(event, StreamEvent::Drain | StreamEvent::Close) {
        slot.writable.send_replace(true);
    }
    let _ = slot.events.send(event);

    if closed {
        if let Some(slot) = streams.remove(&key) {
            for (_, waiter) in slot.flushes {
                let _ = waiter.send(Err(Error::StreamClosed));
            }
        }
    }
}

/// Forward datagrams from one UDP endpoint into the engine.
async fn recv_loop(
    socket: SocketId,
    udp: Arc<UdpSocket>,
    commands: mpsc::WeakUnboundedSender<Command>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match udp.recv_from(&mut buf).await {
            Ok(v) => v,
            // ICMP port unreachable from an earlier send on some platforms.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => {
                log::warn!("[transport] receive on socket {socket:?} failed: {e}");
                break;
            }
        };
        let Some(commands) = commands.upgrade() else {
            break;
        };
        let command = Command::Datagram {
            socket,
            from,
            bytes: buf[..n].to_vec(),
        };
        if commands.send(command).is_err() {
            break;
        }
    }
}
