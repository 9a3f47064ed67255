//! Duplex non-blocking byte streams ("pipes") and their state machine.
//!
//! A pipe has six independent state bits (see [PipeState]). `READY` separates the *pending*
//!  phase (e.g. a connect in progress) from the *active* phase. `BROKEN` is sticky, and once it
//!  is set `READABLE` and `WRITABLE` are reported as cleared. `FIN_SENT` and `FIN_RCVD` record
//!  half-close in either direction.
//!
//! Pipes stack: the [tcp_pipe::TcpPipe] sits on a socket, an [atomic_pipe::AtomicPipe] makes
//!  sends all-or-nothing on top of another pipe, and a [datagram_pipe::DatagramPipe] frames
//!  messages on top of an atomic pipe. An outer pipe owns the pipe below it, and dropping the
//!  outer pipe releases the whole stack.
//!
//! Only the bottom-most pipe talks to the [Reactor]. Its owner passes a callback to
//!  [Pipe::init] that the reactor calls with socket readiness, and that callback hands the
//!  socket events to the top of the stack through [Pipe::on_transport_event]. Each layer passes
//!  them down, updates its own state from what the layer below reports, and returns its own
//!  [PipeEvents] upwards. A layer's state is therefore final before its owner sees an event,
//!  and the owner is free to drop the whole stack in response.

pub mod tcp_pipe;
pub mod atomic_pipe;
pub mod datagram_pipe;

use std::fmt::{Display, Formatter};
use std::io;

use bitflags::bitflags;
#[cfg(test)] use mockall::automock;

use crate::reactor::reactor::{Reactor, SocketCallback};
use crate::reactor::socket_events::SocketEvents;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
    pub struct PipeState: u8 {
        const READY    = 0b0000_0001;
        const BROKEN   = 0b0000_0010;
        const READABLE = 0b0000_0100;
        const WRITABLE = 0b0000_1000;
        const FIN_SENT = 0b0001_0000;
        const FIN_RCVD = 0b0010_0000;
    }
}

impl PipeState {
    pub fn is_ready(&self) -> bool {
        self.contains(PipeState::READY)
    }
    pub fn is_broken(&self) -> bool {
        self.contains(PipeState::BROKEN)
    }
    pub fn is_readable(&self) -> bool {
        self.contains(PipeState::READABLE) && !self.is_broken()
    }
    pub fn is_writable(&self) -> bool {
        self.contains(PipeState::WRITABLE) && !self.is_broken()
    }
    pub fn is_fin_sent(&self) -> bool {
        self.contains(PipeState::FIN_SENT)
    }
    pub fn is_fin_rcvd(&self) -> bool {
        self.contains(PipeState::FIN_RCVD)
    }

    /// `READABLE` and `WRITABLE` carry no meaning for a broken pipe
    pub fn normalized(self) -> PipeState {
        if self.is_broken() {
            self - PipeState::READABLE - PipeState::WRITABLE
        }
        else {
            self
        }
    }

    /// compact rendering for status output: `w`/`r` for writable / readable, `x` for FIN
    ///  sent / received, `!` for broken
    pub fn flags_string(&self) -> String {
        if self.is_broken() {
            return "!!".to_string();
        }
        let w = if self.is_writable() { 'w' } else if self.is_fin_sent() { 'x' } else { '-' };
        let r = if self.is_readable() { 'r' } else if self.is_fin_rcvd() { 'x' } else { '-' };
        format!("{}{}", w, r)
    }
}

bitflags! {
    /// What a pipe reports to its owner after handling socket events.
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
    pub struct PipeEvents: u8 {
        /// the pipe finished its pending phase successfully
        const READY    = 0b0000_0001;
        /// the pipe failed, either while pending (e.g. connect failure) or later
        const BROKEN   = 0b0000_0010;
        const READABLE = 0b0000_0100;
        const WRITABLE = 0b0000_1000;
        /// a `send_fin()` that returned [FinStatus::Pending] was executed
        const FIN_SENT = 0b0001_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// this many bytes were stored in the caller's buffer. For datagram pipes this is the
    ///  length of a complete datagram, which may be zero
    Data(usize),
    /// the peer half-closed its sending side
    Fin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinStatus {
    Sent,
    /// data is still queued in the pipe, and FIN is sent once it is flushed
    Pending,
}

#[derive(Debug)]
pub enum PipeError {
    /// nothing happened, try again after the next readiness notification
    WouldBlock,
    /// the transport failed, and the pipe is now broken
    Io(io::Error),
    /// the peer violated the framing protocol, and the pipe is now broken
    Protocol(String),
    /// the pipe was broken before the call
    Broken,
}

impl PipeError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipeError::WouldBlock)
    }
}

impl Display for PipeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeError::WouldBlock => write!(f, "operation would block"),
            PipeError::Io(e) => write!(f, "I/O error: {}", e),
            PipeError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            PipeError::Broken => write!(f, "pipe is broken"),
        }
    }
}

impl std::error::Error for PipeError {}

pub type PipeResult<T> = Result<T, PipeError>;

/// A duplex non-blocking byte stream, see the module documentation.
///
/// Dropping a pipe releases it and everything it owns, including its reactor registration.
#[cfg_attr(test, automock)]
pub trait Pipe {
    /// Binds the pipe to a reactor. `on_event` is registered for the underlying socket, and it
    ///  is expected to feed the events into this pipe's `on_transport_event()`.
    fn init(&mut self, reactor: &Reactor, on_event: SocketCallback) -> anyhow::Result<()>;

    fn state(&self) -> PipeState;

    fn recv(&mut self, buf: &mut [u8]) -> PipeResult<Recv>;

    /// Returns the number of bytes accepted, which may be less than `buf.len()` unless the
    ///  pipe guarantees atomic sends. Calling this after FIN was sent is a bug.
    fn send(&mut self, buf: &[u8]) -> PipeResult<usize>;

    /// Half-closes the sending side. Calling this twice is a bug.
    fn send_fin(&mut self) -> PipeResult<FinStatus>;

    /// Handles readiness of the underlying socket, returning the events to report to the owner.
    fn on_transport_event(&mut self, events: SocketEvents) -> PipeEvents;

    /// Asks for another `READABLE` notification on the next reactor pass, for owners that stop
    ///  reading while data is still available.
    fn reschedule_read(&mut self);
}
