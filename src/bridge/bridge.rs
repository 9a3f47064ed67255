use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::rc::Rc;

use tracing::{debug, info, trace, warn};

use crate::bridge::bridge_config::BridgeConfig;
use crate::pipe::{Pipe, PipeError, PipeEvents, PipeResult, PipeState, Recv};
use crate::reactor::reactor::{Reactor, SocketCallback};
use crate::reactor::socket_events::SocketEvents;
use crate::util::byte_buffer::ByteBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => write!(f, "L"),
            Side::Right => write!(f, "R"),
        }
    }
}

/// Counters for one side of a bridge. `bytes_rx` counts bytes received from this side's pipe,
///  `bytes_tx` bytes sent into it, and `congestion_count` the number of times a send into it
///  could not complete, so that the rest had to be queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SideStats {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub congestion_count: u64,
    pub state: PipeState,
}

impl Display for SideStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} {} {} {}]", self.state.flags_string(), self.bytes_tx, self.bytes_rx, self.congestion_count)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub left: SideStats,
    pub right: SideStats,
}

impl BridgeStats {
    pub fn side(&self, side: Side) -> &SideStats {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

impl Display for BridgeStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "L {}  R {}", self.left, self.right)
    }
}

struct BridgeSide {
    pipe: Box<dyn Pipe>,
    /// data received from the peer that this side's pipe did not accept yet. It is only present
    ///  while the pipe is not writable
    pending: Option<ByteBuffer>,
    recv_size: usize,
    stats: SideStats,
}

impl BridgeSide {
    fn new(pipe: Box<dyn Pipe>, recv_size: usize) -> BridgeSide {
        BridgeSide {
            pipe,
            pending: None,
            recv_size,
            stats: Default::default(),
        }
    }

    fn is_closed(&self) -> bool {
        let state = self.pipe.state();
        state.is_fin_sent() && state.is_fin_rcvd()
    }

    fn stats(&self) -> SideStats {
        SideStats {
            state: self.pipe.state(),
            ..self.stats
        }
    }
}

type ShutdownCallback = Box<dyn FnOnce(bool)>;

struct BridgeCore {
    sides: [BridgeSide; 2],
    buf: Vec<u8>,
    max_relay_per_event: usize,
    initialized: bool,
    dead: bool,
    /// snapshot taken at shutdown, so that a dead bridge never calls into its pipes
    final_stats: Option<BridgeStats>,
    on_shutdown: Option<ShutdownCallback>,
}

fn split_mut(sides: &mut [BridgeSide; 2], first: Side) -> (&mut BridgeSide, &mut BridgeSide) {
    let [left, right] = sides;
    match first {
        Side::Left => (left, right),
        Side::Right => (right, left),
    }
}

impl BridgeCore {
    fn side(&self, side: Side) -> &BridgeSide {
        &self.sides[side.index()]
    }

    fn side_mut(&mut self, side: Side) -> &mut BridgeSide {
        &mut self.sides[side.index()]
    }

    fn stats(&self) -> BridgeStats {
        if let Some(stats) = self.final_stats {
            return stats;
        }
        BridgeStats {
            left: self.side(Side::Left).stats(),
            right: self.side(Side::Right).stats(),
        }
    }

    fn is_closed(&self) -> bool {
        self.sides.iter().all(|s| s.is_closed())
    }

    /// Handles readiness of one side's socket. If this kills the bridge, the shutdown callback
    ///  is returned for the caller to invoke once it released the bridge.
    fn on_activity(&mut self, side: Side, socket_events: SocketEvents) -> Option<(ShutdownCallback, bool)> {
        if self.dead {
            trace!("bridge: ignoring {:?} on {} after shutdown", socket_events, side);
            return None;
        }

        let events = self.side_mut(side).pipe.on_transport_event(socket_events);
        trace!("bridge: {:?} on {} -> {:?}", socket_events, side, events);

        match self.handle(side, events) {
            Ok(()) if self.is_closed() => self.die(true),
            Ok(()) => None,
            Err(e) => {
                warn!("bridge: {} activity failed: {}", side, e);
                self.die(false)
            }
        }
    }

    fn handle(&mut self, side: Side, events: PipeEvents) -> PipeResult<()> {
        let peer = side.peer();

        if events.contains(PipeEvents::BROKEN) {
            return Err(PipeError::Broken);
        }

        if events.contains(PipeEvents::WRITABLE) {
            if self.side(side).pending.is_some() {
                self.flush(side)?;
            }
            if self.side(side).pipe.state().is_writable() {
                self.relay(peer, side)?;
            }
        }

        if events.contains(PipeEvents::READABLE) && self.side(peer).pipe.state().is_writable() {
            self.relay(side, peer)?;
        }

        Ok(())
    }

    fn die(&mut self, graceful: bool) -> Option<(ShutdownCallback, bool)> {
        let stats = self.stats();
        self.dead = true;
        self.final_stats = Some(stats);
        info!("bridge: shutdown, {} - {}", if graceful { "graceful" } else { "abrupt" }, stats);
        self.on_shutdown.take()
            .map(|on_shutdown| (on_shutdown, graceful))
    }

    /// sends data queued for a side, propagating a FIN that arrived from its peer in the meantime
    fn flush(&mut self, side: Side) -> PipeResult<()> {
        let (this, peer) = split_mut(&mut self.sides, side);
        let pending = match this.pending.as_mut() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        match this.pipe.send(pending.as_ref()) {
            Err(PipeError::WouldBlock) => return Ok(()),
            Err(e) => return Err(e),
            Ok(n) => {
                this.stats.bytes_tx += n as u64;
                if n < pending.len() {
                    pending.consume(n);
                    trace!("bridge: flushed {} bytes to {}, {} still pending", n, side, pending.len());
                    return Ok(());
                }
            }
        }

        debug!("bridge: {} is no longer congested", side);
        this.pending = None;

        if peer.pipe.state().is_fin_rcvd() && !this.pipe.state().is_fin_sent() {
            debug!("bridge: propagating FIN to {}", side);
            this.pipe.send_fin()?;
        }
        Ok(())
    }

    /// moves data from `src` to `dst` until one of them runs dry or the budget is used up
    fn relay(&mut self, src: Side, dst: Side) -> PipeResult<()> {
        let mut relayed = 0;

        while self.side(src).pipe.state().is_readable() && self.side(dst).pipe.state().is_writable() {
            if relayed >= self.max_relay_per_event {
                debug!("bridge: relayed {} bytes {} -> {}, yielding", relayed, src, dst);
                self.side_mut(src).pipe.reschedule_read();
                break;
            }
            relayed += self.rx_tx(src, dst)?;
        }
        Ok(())
    }

    /// a single receive from `src`, sent on to `dst`
    fn rx_tx(&mut self, src: Side, dst: Side) -> PipeResult<usize> {
        let BridgeCore { sides, buf, .. } = self;
        let (from, to) = split_mut(sides, src);
        debug_assert!(to.pending.is_none());

        let chunk = &mut buf[..from.recv_size];
        let n = match from.pipe.recv(chunk) {
            Ok(Recv::Data(n)) => n,
            Ok(Recv::Fin) => {
                debug!("bridge: FIN from {}, half-closing {}", src, dst);
                to.pipe.send_fin()?;
                return Ok(0);
            }
            Err(PipeError::WouldBlock) => return Ok(0),
            Err(e) => return Err(e),
        };
        from.stats.bytes_rx += n as u64;

        let sent = match to.pipe.send(&chunk[..n]) {
            Ok(sent) => sent,
            Err(PipeError::WouldBlock) => 0,
            Err(e) => return Err(e),
        };
        to.stats.bytes_tx += sent as u64;
        trace!("bridge: {} -> {}: received {}, sent {}", src, dst, n, sent);

        if sent < n {
            debug!("bridge: {} is congested, queueing {} bytes", dst, n - sent);
            to.pending = Some(ByteBuffer::copy_of(&chunk[sent..n]));
            to.stats.congestion_count += 1;
        }
        Ok(n)
    }
}

/// Relays data between two pipes in both directions.
///
/// A side is read only while its peer is writable. If the peer accepts only part of a chunk, the
///  rest is queued for that peer, and reading from the other side stops until it is flushed. A
///  FIN received on one side is propagated to the other. The bridge shuts down once both sides
///  have sent and received FIN (graceful), or as soon as either side fails (abrupt). The shutdown
///  callback is called exactly once, and after that the bridge does not touch its pipes except
///  to drop them.
///
/// The reactor callbacks of the two pipes refer to the bridge weakly, so dropping (or
///  discarding) the bridge releases it, including from inside the shutdown callback.
pub struct Bridge {
    core: Rc<RefCell<BridgeCore>>,
}

impl Bridge {
    pub fn new(left: Box<dyn Pipe>, right: Box<dyn Pipe>, config: &BridgeConfig) -> anyhow::Result<Bridge> {
        config.validate()?;

        let core = BridgeCore {
            sides: [
                BridgeSide::new(left, config.left_recv_size),
                BridgeSide::new(right, config.right_recv_size),
            ],
            buf: vec![0; config.buf_size()],
            max_relay_per_event: config.max_relay_per_event,
            initialized: false,
            dead: false,
            final_stats: None,
            on_shutdown: None,
        };

        Ok(Bridge {
            core: Rc::new(RefCell::new(core)),
        })
    }

    /// Registers both pipes with the reactor. `on_shutdown` is called with `true` for a graceful
    ///  shutdown and with `false` for an abrupt one.
    pub fn init(&self, reactor: &Reactor, on_shutdown: impl FnOnce(bool) + 'static) -> anyhow::Result<()> {
        let mut core = self.core.borrow_mut();
        assert!(!core.initialized, "bridge was initialized twice");
        core.initialized = true;
        core.on_shutdown = Some(Box::new(on_shutdown));

        for side in [Side::Left, Side::Right] {
            let callback = activity_callback(&self.core, side);
            core.side_mut(side).pipe.init(reactor, callback)?;
        }
        debug!("bridge: initialized");
        Ok(())
    }

    pub fn is_dead(&self) -> bool {
        self.core.borrow().dead
    }

    pub fn stats(&self) -> BridgeStats {
        self.core.borrow().stats()
    }

    /// Releases the bridge with both its pipes. When called from the shutdown callback, the
    ///  release completes when the reactor callback that triggered it returns.
    pub fn discard(self) {
        debug!("bridge: discarded - {}", self.stats());
    }
}

fn activity_callback(core: &Rc<RefCell<BridgeCore>>, side: Side) -> SocketCallback {
    let weak_core = Rc::downgrade(core);
    Box::new(move |events| {
        let core = match weak_core.upgrade() {
            Some(core) => core,
            None => return,
        };

        // the shutdown callback runs without a borrow: it may discard the bridge
        let shutdown = core.borrow_mut().on_activity(side, events);
        if let Some((on_shutdown, graceful)) = shutdown {
            on_shutdown(graceful);
        }
    })
}
