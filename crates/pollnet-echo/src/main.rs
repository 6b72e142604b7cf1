//! pollnet-echo - echo server and ping client on the pollnet reactor
//!
//! Usage:
//!   pollnet-echo serve --bind 127.0.0.1:7000 [--udp]
//!   pollnet-echo ping --connect 127.0.0.1:7000 [--count 10] [--interval-ms 500]

mod frame;

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pollnet_config::logging::init_logging;
use pollnet_config::{log_echo_info, log_echo_warn};
use pollnet_reactor::{now_millis, ConnectStatus, Event, EventKind, Reactor, SocketId};

use crate::frame::Frame;

/// Echo server and ping client for the pollnet reactor
#[derive(Parser)]
#[command(name = "pollnet-echo")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Longest readiness wait per tick, in milliseconds
    #[arg(long, global = true, default_value_t = 10)]
    tick_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo every received byte back to its sender
    Serve {
        /// host:port to listen on (empty host = all interfaces)
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        bind: String,

        /// Serve datagrams instead of streams
        #[arg(long)]
        udp: bool,

        /// Interval of the stats log line, in milliseconds
        #[arg(long, default_value_t = 5000)]
        stats_ms: u64,
    },

    /// Send numbered frames to an echo server and log the round trips
    Ping {
        /// host:port of the echo server
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        connect: String,

        /// Frames to send
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,

        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = pollnet_config::config().clone();
    init_logging(config.logging.log_level());

    let tick = Duration::from_millis(cli.tick_ms);
    match cli.command {
        Commands::Serve {
            bind,
            udp,
            stats_ms,
        } => {
            let (host, port) = split_endpoint(&bind)?;
            let addr = pollnet_reactor::bind_addr(host, port)
                .with_context(|| format!("Failed to resolve {}", bind))?;
            let mut reactor = Reactor::with_config(&config);
            if udp {
                serve_udp(&mut reactor, addr)?;
            } else {
                serve_tcp(&mut reactor, addr)?;
            }
            reactor.set_timer(Duration::from_millis(stats_ms), -1, |r, _| {
                log_echo_info!(sockets = r.len(), active = r.active_len(), "Stats");
                true
            });
            loop {
                reactor.tick(tick);
            }
        }
        Commands::Ping {
            connect,
            count,
            interval_ms,
        } => {
            let (host, port) = split_endpoint(&connect)?;
            let addr = pollnet_reactor::resolve(host, port)
                .with_context(|| format!("Failed to resolve {}", connect))?;
            let mut reactor = Reactor::with_config(&config);
            ping(&mut reactor, addr, count, Duration::from_millis(interval_ms), tick)
        }
        Commands::Config => {
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{}", rendered);
            Ok(())
        }
    }
}

/// Split `host:port`, accepting `[v6]:port`.
fn split_endpoint(endpoint: &str) -> Result<(&str, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Expected host:port, got {:?}", endpoint))?;
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in {:?}", endpoint))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host, port))
}

fn serve_tcp(reactor: &mut Reactor, addr: SocketAddr) -> Result<SocketId> {
    let server = reactor.tcp();
    reactor
        .listen_on(server, addr, None)
        .with_context(|| format!("Failed to listen on {}", addr))?;
    reactor.on(server, EventKind::Accept, |r, id, _| loop {
        match r.accept(id) {
            Ok(Some(conn)) => {
                if let Err(e) = install_echo(r, conn) {
                    log_echo_warn!(error = %e, "Cannot serve connection");
                    let _ = r.destroy(conn);
                }
            }
            Ok(None) => break,
            Err(e) => {
                log_echo_warn!(error = %e, "Accept failed");
                break;
            }
        }
    })?;
    let local = reactor.local_addr(server)?;
    log_echo_info!(addr = %local, "Serving TCP echo");
    Ok(server)
}

fn install_echo(reactor: &mut Reactor, conn: SocketId) -> Result<()> {
    let peer = reactor.peer_addr(conn)?;
    log_echo_info!(%peer, id = conn.as_u64(), "Client connected");

    reactor.on(conn, EventKind::Recv, |r, conn, _| {
        let mut chunk = [0u8; 4096];
        loop {
            let n = r.recv(conn, &mut chunk).unwrap_or(0);
            if n == 0 {
                break;
            }
            if let Err(e) = r.send(conn, &chunk[..n]) {
                log_echo_warn!(id = conn.as_u64(), error = %e, "Echo failed");
                let _ = r.close(conn);
                break;
            }
        }
    })?;
    reactor.on(conn, EventKind::Close, move |r, conn, _| {
        log_echo_info!(%peer, id = conn.as_u64(), "Client gone");
        let _ = r.destroy(conn);
    })?;
    Ok(())
}

fn serve_udp(reactor: &mut Reactor, addr: SocketAddr) -> Result<SocketId> {
    let server = reactor.udp();
    reactor
        .bind(server, addr)
        .with_context(|| format!("Failed to bind {}", addr))?;
    reactor.on(server, EventKind::Recv, |r, id, _| {
        let mut datagram = [0u8; 64 * 1024];
        loop {
            match r.recv_from(id, &mut datagram) {
                Ok(Some((n, from))) => {
                    if let Err(e) = r.send_to(id, from, &datagram[..n]) {
                        log_echo_warn!(%from, error = %e, "Reply failed");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log_echo_warn!(error = %e, "Receive failed");
                    break;
                }
            }
        }
    })?;
    let local = reactor.local_addr(server)?;
    log_echo_info!(addr = %local, "Serving UDP echo");
    Ok(server)
}

fn ping(
    reactor: &mut Reactor,
    addr: SocketAddr,
    count: u32,
    interval: Duration,
    tick: Duration,
) -> Result<()> {
    let client = reactor.tcp();
    let done = Rc::new(Cell::new(false));
    let received = Rc::new(Cell::new(0u32));

    let finished = Rc::clone(&done);
    reactor.on(client, EventKind::Connect, move |_, _, event| {
        if *event == (Event::Connect { ok: false }) {
            log_echo_warn!(%addr, "Connect failed");
            finished.set(true);
        } else {
            log_echo_info!(%addr, "Connected");
        }
    })?;

    let (finished, got) = (Rc::clone(&done), Rc::clone(&received));
    reactor.on(client, EventKind::Recv, move |r, id, _| {
        let Ok(inbuf) = r.inbuf_mut(id) else {
            return;
        };
        loop {
            match Frame::decode(inbuf) {
                Ok(Some(frame)) => {
                    let rtt = now_millis().saturating_sub(frame.sent_ms);
                    log_echo_info!(seq = frame.seq, rtt_ms = rtt, "Echo");
                    got.set(got.get() + 1);
                }
                Ok(None) => break,
                Err(e) => {
                    log_echo_warn!(error = %e, "Garbled echo");
                    finished.set(true);
                    break;
                }
            }
        }
        if got.get() >= count {
            finished.set(true);
        }
    })?;

    let finished = Rc::clone(&done);
    reactor.on(client, EventKind::Close, move |_, _, _| {
        log_echo_info!("Connection closed");
        finished.set(true);
    })?;

    if reactor.connect(client, addr)? == ConnectStatus::Failed {
        anyhow::bail!("Failed to connect to {}", addr);
    }

    let mut seq = 0u32;
    reactor.set_timer(interval, -1, move |r, _| {
        if seq >= count {
            return false;
        }
        if r.is_closed(client) {
            return false;
        }
        let frame = Frame {
            seq,
            sent_ms: now_millis(),
        };
        let queued = r
            .outbuf_mut(client)
            .map_err(anyhow::Error::from)
            .and_then(|out| frame.encode(out));
        if let Err(e) = queued {
            log_echo_warn!(error = %e, "Cannot queue frame");
            return false;
        }
        seq += 1;
        true
    });

    while !done.get() {
        reactor.tick(tick);
    }
    let _ = reactor.close(client);

    log_echo_info!(sent = count, received = received.get(), "Ping finished");
    if received.get() < count {
        anyhow::bail!("Lost {} of {} frames", count - received.get(), count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("127.0.0.1:7000").unwrap(), ("127.0.0.1", 7000));
        assert_eq!(split_endpoint("[::1]:80").unwrap(), ("::1", 80));
        assert_eq!(split_endpoint(":9000").unwrap(), ("", 9000));
        assert!(split_endpoint("localhost").is_err());
        assert!(split_endpoint("localhost:http").is_err());
    }

    #[test]
    fn test_ping_against_tcp_echo() {
        let mut reactor = Reactor::new();
        let server = serve_tcp(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = reactor.local_addr(server).unwrap();

        ping(
            &mut reactor,
            addr,
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
        )
        .unwrap();
    }

    #[test]
    fn test_udp_echo_replies_to_sender() {
        let mut reactor = Reactor::new();
        let server = serve_udp(&mut reactor, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = reactor.local_addr(server).unwrap();

        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();
        peer.send_to(b"marco", addr).unwrap();

        let mut buf = [0u8; 16];
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let reply = loop {
            reactor.tick(Duration::from_millis(5));
            if let Ok((n, from)) = peer.recv_from(&mut buf) {
                break Some((n, from));
            }
            if std::time::Instant::now() > deadline {
                break None;
            }
        };
        let (n, from) = reply.expect("no echo before the deadline");
        assert_eq!(&buf[..n], b"marco");
        assert_eq!(from, addr);
    }
}
