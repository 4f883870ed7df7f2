//! Entry point for `mux-over-udp`.
//!
//! Parses CLI arguments and runs a line-based chat over one stream.  All
//! protocol work is delegated to the library; `main.rs` owns only process
//! setup (logging, argument parsing, stdin/stdout).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use mux_over_udp::{
    Config, ConnectOptions, SocketEvent, StreamEvent, StreamOptions, TimerConfig, Transport,
    MAX_FRAME_PAYLOAD,
};

/// Multiplexed reliable streams over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Largest payload per frame.
    #[arg(
        long,
        global = true,
        default_value_t = 1200,
        value_parser = clap::value_parser!(u16).range(1..=MAX_FRAME_PAYLOAD as i64)
    )]
    max_payload: u16,

    /// Frames allowed in flight per stream.
    #[arg(
        long,
        global = true,
        default_value_t = 64,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    window: u32,

    /// Retransmissions before a stream gives up.
    #[arg(long, global = true, default_value_t = 6)]
    max_retries: u32,
}

#[derive(Subcommand)]
enum Mode {
    /// Relay stdin lines to a peer and print what it sends back.
    Chat {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Peer address (e.g. 127.0.0.1:9001).
        #[arg(short, long)]
        peer: SocketAddr,
        /// Our stream id.
        #[arg(long, default_value_t = 1)]
        local_id: u32,
        /// The peer's stream id.
        #[arg(long, default_value_t = 2)]
        remote_id: u32,
        /// Send lines as messages instead of stream data.
        #[arg(long)]
        messages: bool,
    },
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            max_payload: usize::from(self.max_payload),
            window: self.window as usize,
            timer: TimerConfig {
                max_retries: self.max_retries,
                ..TimerConfig::default()
            },
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.mode {
        Mode::Chat {
            bind,
            peer,
            local_id,
            remote_id,
            messages,
        } => chat(config, bind, peer, local_id, remote_id, messages).await,
    }
}

async fn chat(
    config: Config,
    bind: SocketAddr,
    peer: SocketAddr,
    local_id: u32,
    remote_id: u32,
    messages: bool,
) -> Result<()> {
    let transport = Transport::with_config(config).context("invalid configuration")?;
    let (socket, mut socket_events) = transport.create_socket();
    let address = socket
        .bind(bind.port(), Some(bind.ip()))
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Bound to {}:{}", address.host, address.port);

    let (stream, mut events) = transport.create_stream(local_id, StreamOptions::default());
    let host: IpAddr = peer.ip();
    stream
        .connect(&socket, remote_id, peer.port(), host, ConnectOptions::default())
        .await
        .context("connecting stream")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("reading stdin")? {
                    Some(line) if messages => stream.send(line.into_bytes()).await?,
                    Some(mut line) => {
                        line.push('\n');
                        stream.write(line.into_bytes()).await?;
                    }
                    None => {
                        stdin_open = false;
                        stream.end().await?;
                    }
                }
            }
            event = events.recv() => match event {
                Some(StreamEvent::Data(bytes)) => print!("{}", String::from_utf8_lossy(&bytes)),
                Some(StreamEvent::Message(bytes)) => {
                    println!("[message] {}", String::from_utf8_lossy(&bytes));
                }
                Some(StreamEvent::End) => log::info!("Peer ended its side"),
                Some(StreamEvent::Error(e)) => log::warn!("Stream failed: {e}"),
                Some(StreamEvent::Close) | None => break,
                Some(_) => {}
            },
            event = socket_events.recv() => {
                if let Some(SocketEvent::Fault(e)) = event {
                    log::warn!("Socket fault: {e}");
                }
            }
        }
    }

    // Give the final ACK a moment to leave before the socket goes away.
    tokio::time::sleep(Duration::from_millis(100)).await;
    socket.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: [&str; 4] = ["mux-over-udp", "chat", "--peer", "127.0.0.1:9001"];

    #[test]
    fn default_flags_give_a_valid_config() {
        let cli = Cli::try_parse_from(CHAT).unwrap();
        assert!(cli.config().validate().is_ok());
    }

    #[test]
    fn zero_window_is_refused() {
        let args = CHAT.iter().copied().chain(["--window", "0"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn max_payload_is_bounded() {
        let zero = CHAT.iter().copied().chain(["--max-payload", "0"]);
        assert!(Cli::try_parse_from(zero).is_err());
        let huge = CHAT.iter().copied().chain(["--max-payload", "65484"]);
        assert!(Cli::try_parse_from(huge).is_err());
        let largest = CHAT.iter().copied().chain(["--max-payload", "65483"]);
        assert!(Cli::try_parse_from(largest).is_ok());
    }
}
