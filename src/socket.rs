//! Host-facing socket handle.
//!
//! A [`Socket`] is a cheap, cloneable handle to one UDP endpoint owned by the
//! transport's dispatch loop.  Notifications arrive on the paired
//! [`SocketEvents`] channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::mux::SocketId;
use crate::transport::{call, Command};

/// Bound address of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub port: u16,
    pub host: IpAddr,
}

impl Address {
    /// 4 or 6.
    pub fn family(&self) -> u8 {
        if self.host.is_ipv4() {
            4
        } else {
            6
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self {
            port: addr.port(),
            host: addr.ip(),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::new(addr.host, addr.port)
    }
}

/// Socket notifications.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Some stream has unacknowledged outbound work.
    Busy,
    /// No stream has outstanding work any more.
    Idle,
    /// The endpoint was released.
    Close,
    /// A firewall predicate panicked.
    Fault(Error),
}

/// State the dispatch loop publishes for synchronous getters.
#[derive(Debug, Default)]
pub(crate) struct SocketShared {
    pub(crate) busy: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) address: OnceLock<Address>,
}

#[derive(Debug, Clone)]
pub struct Socket {
    id: SocketId,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<SocketShared>,
}

impl Socket {
    pub(crate) fn new(
        id: SocketId,
        commands: mpsc::UnboundedSender<Command>,
        shared: Arc<SocketShared>,
    ) -> Self {
        Self {
            id,
            commands,
            shared,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Bind to `port` on `host` (all IPv4 interfaces by default).
    ///
    /// Port 0 lets the OS pick one; [`Socket::address`] reports it afterwards.
    pub async fn bind(&self, port: u16, host: Option<IpAddr>) -> Result<Address> {
        if self.is_closed() {
            return Err(Error::SocketClosed);
        }
        if self.shared.address.get().is_some() {
            return Err(Error::AlreadyBound);
        }
        let host = host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let udp = UdpSocket::bind(SocketAddr::new(host, port)).await?;
        let udp = Arc::new(udp);
        let local = call(&self.commands, |reply| Command::Attach {
            socket: self.id,
            udp,
            reply,
        })
        .await?;

        let address = Address::from(local);
        // The loop already rejected a concurrent second bind.
        let _ = self.shared.address.set(address);
        log::info!("[transport] socket {:?} listening on {local}", self.id);
        Ok(address)
    }

    /// `None` until bound.
    pub fn address(&self) -> Option<Address> {
        self.shared.address.get().copied()
    }

    /// Release the endpoint.  Streams on this socket are not destroyed.
    pub async fn close(&self) -> Result<()> {
        call(&self.commands, |reply| Command::CloseSocket {
            socket: self.id,
            reply,
        })
        .await
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        !self.is_busy()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

/// Receiving half of a socket's notifications.
#[derive(Debug)]
pub struct SocketEvents {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SocketEvent>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SocketEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_family() {
        let v4 = Address::from("127.0.0.1:80".parse::<SocketAddr>().unwrap());
        assert_eq!(v4.family(), 4);
        let v6 = Address::from("[::1]:80".parse::<SocketAddr>().unwrap());
        assert_eq!(v6.family(), 6);
        assert_eq!(SocketAddr::from(v6).port(), 80);
    }
}
