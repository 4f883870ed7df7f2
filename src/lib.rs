//! `mux-over-udp`: many reliable streams multiplexed over one UDP socket.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────┐  ┌────────┐           host handles (async)
//!  │ Stream │  │ Socket │
//!  └───┬────┘  └───┬────┘
//!      │ Command   │
//!  ┌───▼───────────▼─────────────────────────────────┐
//!  │ transport: one engine task                      │
//!  │   ┌────────────────────────────────┐            │
//!  │   │ Mux (per socket)               │            │
//!  │   │   Connection ─ Sender          │            │
//!  │   │              ─ Receiver        │  sans-IO   │
//!  │   │              ─ FlowController  │            │
//!  │   │              ─ RetransmitTimer │            │
//!  │   └────────────────────────────────┘            │
//!  └───┬─────────────────────────────────────────────┘
//!      │ raw UDP datagrams
//!  ┌───▼───────────────────┐
//!  │ tokio::net::UdpSocket │
//!  └───────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: wire format (serialise / deserialise)
//! - [`seq`]: modular 32-bit sequence arithmetic
//! - [`sender`]: outbound window, cumulative ACKs, reliable messages
//! - [`receiver`]: expected sequence, reorder buffer, message de-dup
//! - [`flow`]: backpressure over unflushed bytes
//! - [`timer`]: RTO estimation and retransmit deadline
//! - [`state`]: stream state machine types
//! - [`connection`]: one stream's protocol logic
//! - [`mux`]: routing, firewall and busy/idle for one socket
//! - [`transport`]: the async dispatch loop
//! - [`socket`], [`stream`]: host-facing handles and events
//! - [`simulator`]: deterministic lossy network for tests
//!
//! # Example
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use mux_over_udp::{ConnectOptions, StreamEvent, StreamOptions, Transport};
//!
//! # async fn run() -> mux_over_udp::Result<()> {
//! let transport = Transport::new();
//! let (socket, _socket_events) = transport.create_socket();
//! socket.bind(0, Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).await?;
//!
//! let (stream, mut events) = transport.create_stream(1, StreamOptions::default());
//! let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
//! stream.connect(&socket, 2, 9000, localhost, ConnectOptions::default()).await?;
//! stream.write(b"hello".to_vec()).await?;
//! while let Some(event) = events.recv().await {
//!     if let StreamEvent::Data(bytes) = event {
//!         println!("{}", String::from_utf8_lossy(&bytes));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod mux;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stream;
pub mod timer;
pub mod transport;

pub use config::{Config, MAX_FRAME_PAYLOAD};
pub use error::{Error, Resource, Result};
pub use flow::Admission;
pub use mux::{Candidate, Firewall, SocketId, StreamKey};
pub use socket::{Address, Socket, SocketEvent, SocketEvents};
pub use state::StreamState;
pub use stream::{ConnectOptions, Stream, StreamEvent, StreamEvents, StreamOptions};
pub use timer::TimerConfig;
pub use transport::Transport;
