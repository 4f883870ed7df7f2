//! Host-facing stream handle.
//!
//! A [`Stream`] forwards every operation to the dispatch loop and waits for
//! the result.  Everything the peer does shows up on the paired
//! [`StreamEvents`] channel as a [`StreamEvent`].

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::flow::Admission;
use crate::mux::{Candidate, Firewall, StreamKey};
use crate::socket::Socket;
use crate::transport::{call, Command};

pub use crate::connection::ConnectOptions;

/// Stream notifications, in the order they happened.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The remote identity is bound.
    Connect,
    /// In-order bytes from the peer.  One event per DATA frame.
    Data(Vec<u8>),
    Message(Vec<u8>),
    /// The peer ended its direction.
    End,
    /// Our END was handed to the socket.
    Finish,
    /// Unflushed bytes fell back to the low-water mark.
    Drain,
    /// The stream failed.  Always followed by [`StreamEvent::Close`].
    Error(Error),
    /// Terminal.
    Close,
}

/// Options for [`crate::Transport::create_stream`].
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Admission check for unsolicited peers while unconnected.  Returning
    /// `true` rejects the peer.  Without one every unsolicited frame is
    /// dropped.
    pub firewall: Option<Firewall>,
    /// First outbound sequence number.
    pub seq: Option<u32>,
}

impl StreamOptions {
    pub fn with_firewall<F>(firewall: F) -> Self
    where
        F: Fn(&Candidate) -> bool + Send + Sync + 'static,
    {
        Self {
            firewall: Some(Arc::new(firewall)),
            seq: None,
        }
    }
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("firewall", &self.firewall.is_some())
            .field("seq", &self.seq)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Stream {
    key: StreamKey,
    local_id: u32,
    commands: mpsc::UnboundedSender<Command>,
    writable: watch::Receiver<bool>,
    local: Arc<OnceLock<SocketAddr>>,
}

impl Stream {
    pub(crate) fn new(
        key: StreamKey,
        local_id: u32,
        commands: mpsc::UnboundedSender<Command>,
        writable: watch::Receiver<bool>,
    ) -> Self {
        Self {
            key,
            local_id,
            commands,
            writable,
            local: Arc::new(OnceLock::new()),
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Bind this stream to `remote_id` at `host:port`, over `socket`.
    pub async fn connect(
        &self,
        socket: &Socket,
        remote_id: u32,
        port: u16,
        host: IpAddr,
        options: ConnectOptions,
    ) -> Result<()> {
        let local = call(&self.commands, |reply| Command::Connect {
            key: self.key,
            socket: socket.id(),
            remote_id,
            addr: SocketAddr::new(host, port),
            options,
            reply,
        })
        .await?;
        let _ = self.local.set(local);
        Ok(())
    }

    /// Queue bytes for ordered delivery.
    ///
    /// When the stream reports [`Admission::Full`] the future also waits for
    /// the buffer to drain, so a loop of writes is paced automatically.
    pub async fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<Admission> {
        let bytes = bytes.into();
        let admission = call(&self.commands, |reply| Command::Write {
            key: self.key,
            bytes,
            reply,
        })
        .await?;
        if admission == Admission::Full {
            self.drained().await;
        }
        Ok(admission)
    }

    /// Half-close our direction.
    pub async fn end(&self) -> Result<()> {
        self.end_inner(None).await
    }

    /// Write `bytes`, then half-close.
    pub async fn end_with(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.end_inner(Some(bytes.into())).await
    }

    async fn end_inner(&self, bytes: Option<Vec<u8>>) -> Result<()> {
        call(&self.commands, |reply| Command::End {
            key: self.key,
            bytes,
            reply,
        })
        .await
    }

    /// Reliable message outside the byte stream.
    pub async fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let bytes = bytes.into();
        call(&self.commands, |reply| Command::Send {
            key: self.key,
            bytes,
            reply,
        })
        .await
    }

    /// Best-effort message.  `Ok(false)` if the socket could not take it.
    pub async fn try_send(&self, bytes: impl Into<Vec<u8>>) -> Result<bool> {
        let bytes = bytes.into();
        call(&self.commands, |reply| Command::TrySend {
            key: self.key,
            bytes,
            reply,
        })
        .await
    }

    /// Resolves once everything written so far was handed to the socket.
    pub async fn flush(&self) -> Result<()> {
        call(&self.commands, |reply| Command::Flush {
            key: self.key,
            reply,
        })
        .await
    }

    /// Tear the stream down now.
    pub fn destroy(&self) {
        self.destroy_inner(None);
    }

    /// Tear the stream down, reporting `error` as a [`StreamEvent::Error`].
    pub fn destroy_with(&self, error: Error) {
        self.destroy_inner(Some(error));
    }

    fn destroy_inner(&self, error: Option<Error>) {
        let command = Command::Destroy {
            key: self.key,
            error,
        };
        if self.commands.send(command).is_err() {
            log::debug!("[stream {}] destroy after engine stopped", self.local_id);
        }
    }

    /// `None` before connect.
    pub fn local_host(&self) -> Option<IpAddr> {
        self.local.get().map(SocketAddr::ip)
    }

    /// 0 before connect.
    pub fn local_port(&self) -> u16 {
        self.local.get().map_or(0, SocketAddr::port)
    }

    /// 4 or 6, 0 before connect.
    pub fn local_family(&self) -> u8 {
        match self.local.get() {
            Some(addr) if addr.is_ipv4() => 4,
            Some(_) => 6,
            None => 0,
        }
    }

    async fn drained(&self) {
        let mut writable = self.writable.clone();
        // A closed channel means the stream is gone; nothing to wait for.
        let _ = writable.wait_for(|ready| *ready).await;
    }
}

/// Receiving half of a stream's notifications.
#[derive(Debug)]
pub struct StreamEvents {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` after [`StreamEvent::Close`] was taken.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}
