//! The driving loop: accept one client, connect to the upstream, bridge the two connections and
//!  run the reactor until the bridge shuts down.

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;

use socket2::Socket;
use tracing::{debug, info, warn};

use crate::bridge::bridge::{Bridge, BridgeStats};
use crate::config::RelayConfig;
use crate::net;
use crate::pipe::datagram_pipe::DatagramPipe;
use crate::pipe::tcp_pipe::TcpPipe;
use crate::pipe::Pipe;
use crate::reactor::reactor::Reactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Running,
    Stop { graceful: bool },
}

pub fn status_line(tick: u64, stats: &BridgeStats) -> String {
    format!("{:>6} | {}", tick, stats)
}

fn make_pipe(tcp: TcpPipe, framed: bool, max_datagram_size: usize) -> Box<dyn Pipe> {
    if framed {
        Box::new(DatagramPipe::new(tcp, max_datagram_size))
    }
    else {
        Box::new(tcp)
    }
}

/// A relay with its listening socket bound
pub struct Relay {
    config: RelayConfig,
    listener: Socket,
}

impl Relay {
    pub fn bind(config: RelayConfig) -> anyhow::Result<Relay> {
        config.validate()?;
        let listener = net::listen(config.listen_addr, config.backlog)?;
        Ok(Relay { config, listener })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        net::local_addr(&self.listener)
    }

    /// Waits for a client, relays its connection to the upstream, and returns whether the
    ///  connection was shut down gracefully. Failing to reach the upstream counts as an abrupt
    ///  shutdown.
    pub fn run(self) -> anyhow::Result<bool> {
        let (accepted, _) = net::accept(&self.listener)?;
        drop(self.listener);

        info!("connecting to {} ({} mode)", self.config.upstream_addr, self.config.mode);
        let upstream = match net::connect_nonblocking(self.config.upstream_addr) {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("{}", e);
                return Ok(false);
            }
        };

        run_bridge(&self.config, accepted, upstream)
    }
}

pub fn run_relay(config: RelayConfig) -> anyhow::Result<bool> {
    Relay::bind(config)?.run()
}

/// Bridges an accepted connection with a (possibly still connecting) upstream connection
pub fn run_bridge(config: &RelayConfig, accepted: Socket, upstream: Socket) -> anyhow::Result<bool> {
    let reactor = Reactor::new();

    let left = make_pipe(TcpPipe::connected(accepted), config.mode.frames_accepted(), config.max_datagram_size);
    let right = make_pipe(TcpPipe::connecting(upstream), config.mode.frames_upstream(), config.max_datagram_size);
    let bridge = Bridge::new(left, right, &config.bridge_config())?;

    let run_control = Rc::new(Cell::new(RunControl::Running));
    let on_shutdown = {
        let run_control = run_control.clone();
        move |graceful| run_control.set(RunControl::Stop { graceful })
    };
    bridge.init(&reactor, on_shutdown)?;

    let result = drive(config, &reactor, &bridge, &run_control);

    bridge.discard();
    reactor.discard();
    result
}

fn drive(config: &RelayConfig, reactor: &Reactor, bridge: &Bridge, run_control: &Cell<RunControl>) -> anyhow::Result<bool> {
    let mut tick = 0u64;
    loop {
        if let RunControl::Stop { graceful } = run_control.get() {
            info!("bridge down after {} ticks, graceful: {} - {}", tick, graceful, bridge.stats());
            return Ok(graceful);
        }

        let num_active = reactor.monitor(config.poll_interval)?;
        tick += 1;
        debug!("tick {}: {} active descriptors", tick, num_active);

        if tick % config.status_interval_ticks == 0 {
            info!("{}", status_line(tick, &bridge.stats()));
        }
    }
}
