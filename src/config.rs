use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::bridge::bridge_config::BridgeConfig;
use crate::util::varint::MAX_VARINT_VALUE;

/// Which side of the relay (if any) carries datagram framing. Chaining a `Client` relay with a
///  `Server` relay tunnels a TCP stream through a framed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// plain TCP on both sides
    Plain,
    /// the connection toward the upstream is framed
    Client,
    /// the accepted connection is framed
    Server,
}

impl RelayMode {
    pub fn frames_accepted(&self) -> bool {
        *self == RelayMode::Server
    }

    pub fn frames_upstream(&self) -> bool {
        *self == RelayMode::Client
    }
}

impl FromStr for RelayMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(RelayMode::Plain),
            "client" => Ok(RelayMode::Client),
            "server" => Ok(RelayMode::Server),
            _ => Err(anyhow!("unknown relay mode '{}', expected plain, client or server", s)),
        }
    }
}

impl Display for RelayMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayMode::Plain => write!(f, "plain"),
            RelayMode::Client => write!(f, "client"),
            RelayMode::Server => write!(f, "server"),
        }
    }
}

pub const DEFAULT_RECV_SIZE: usize = 8 * 1024;
pub const DEFAULT_FRAMED_RECV_SIZE: usize = 512 * 1024;
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 512 * 1024;

/// Configuration of a relay. The accepted connection is the bridge's left side, the connection
///  to the upstream its right side.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub backlog: i32,
    pub upstream_addr: SocketAddr,

    pub mode: RelayMode,

    /// Maximum number of bytes per `recv()` on the accepted connection. If that connection is
    ///  framed, this is a buffer for a whole datagram and must be at least `max_datagram_size`.
    ///  Otherwise every chunk read is relayed as a single datagram, so it must not exceed
    ///  `max_datagram_size`.
    pub left_recv_size: usize,
    /// see `left_recv_size`, for the upstream connection
    pub right_recv_size: usize,

    /// bytes relayed per reactor callback before yielding to other connections
    pub max_relay_per_event: usize,

    /// must fit into a 4 byte varint, i.e. be less than 2^28
    pub max_datagram_size: usize,

    /// `monitor()` timeout
    pub poll_interval: Duration,
    /// a status line is logged every this many `monitor()` calls
    pub status_interval_ticks: u64,
}

impl RelayConfig {
    pub fn new(listen_addr: SocketAddr, upstream_addr: SocketAddr, mode: RelayMode) -> RelayConfig {
        let recv_size = match mode {
            RelayMode::Plain => DEFAULT_RECV_SIZE,
            RelayMode::Client | RelayMode::Server => DEFAULT_FRAMED_RECV_SIZE,
        };

        RelayConfig {
            listen_addr,
            backlog: 8,
            upstream_addr,
            mode,
            left_recv_size: recv_size,
            right_recv_size: recv_size,
            max_relay_per_event: 8 * recv_size,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            poll_interval: Duration::from_millis(100),
            status_interval_ticks: 17,
        }
    }

    /// sets both receive sizes, scaling the relay budget along with them
    pub fn set_recv_size(&mut self, recv_size: usize) {
        self.left_recv_size = recv_size;
        self.right_recv_size = recv_size;
        self.max_relay_per_event = 8 * recv_size;
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bridge_config().validate()?;

        if self.backlog <= 0 {
            bail!("listen backlog must be positive");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        if self.status_interval_ticks == 0 {
            bail!("status interval must be positive");
        }

        if self.mode != RelayMode::Plain {
            if self.max_datagram_size == 0 || self.max_datagram_size > MAX_VARINT_VALUE {
                bail!("maximum datagram size must be between 1 and {}", MAX_VARINT_VALUE);
            }

            let (framed, unframed) = if self.mode.frames_accepted() {
                (self.left_recv_size, self.right_recv_size)
            }
            else {
                (self.right_recv_size, self.left_recv_size)
            };
            if framed < self.max_datagram_size {
                bail!("receive size of the framed connection ({}) is smaller than the maximum datagram size ({})", framed, self.max_datagram_size);
            }
            if unframed > self.max_datagram_size {
                bail!("receive size of the unframed connection ({}) exceeds the maximum datagram size ({})", unframed, self.max_datagram_size);
            }
        }

        Ok(())
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            left_recv_size: self.left_recv_size,
            right_recv_size: self.right_recv_size,
            max_relay_per_event: self.max_relay_per_event,
        }
    }
}
