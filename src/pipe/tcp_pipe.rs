use std::io::Read;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};

use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::net::{is_fatal_recv_error, is_fatal_send_error, pending_error, SEND_FLAGS};
use crate::pipe::{FinStatus, Pipe, PipeError, PipeEvents, PipeResult, PipeState, Recv};
use crate::reactor::reactor::{Reactor, SocketCallback};
use crate::reactor::socket_events::SocketEvents;

/// A pipe on top of a non-blocking TCP socket.
///
/// The reactor interest mask mirrors the state: the pipe asks for readability while it is not
///  known to be readable (and has not received FIN), and for writability while it is not known
///  to be writable (and has not sent FIN). A broken pipe asks for nothing.
pub struct TcpPipe {
    socket: Socket,
    fd: RawFd,
    reactor: Option<Reactor>,
    interest: SocketEvents,
    state: PipeState,
}

impl TcpPipe {
    /// Wraps a socket with a connect in progress (or a freshly connected socket). The pipe
    ///  becomes ready with the socket's first writability notification, or broken if the
    ///  connect failed.
    pub fn connecting(socket: Socket) -> TcpPipe {
        TcpPipe::with_state(socket, PipeState::empty())
    }

    /// Wraps an established connection, e.g. one returned by `accept()`
    pub fn connected(socket: Socket) -> TcpPipe {
        TcpPipe::with_state(socket, PipeState::READY)
    }

    fn with_state(socket: Socket, state: PipeState) -> TcpPipe {
        let fd = socket.as_raw_fd();
        TcpPipe {
            socket,
            fd,
            reactor: None,
            interest: SocketEvents::empty(),
            state,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    fn desired_interest(&self) -> SocketEvents {
        if !self.state.is_ready() {
            if self.state.is_broken() {
                return SocketEvents::empty();
            }
            return SocketEvents::WRITABLE;
        }

        let mut interest = SocketEvents::empty();
        if !self.state.is_broken() {
            if !self.state.contains(PipeState::READABLE) && !self.state.is_fin_rcvd() {
                interest |= SocketEvents::READABLE;
            }
            if !self.state.contains(PipeState::WRITABLE) && !self.state.is_fin_sent() {
                interest |= SocketEvents::WRITABLE;
            }
        }
        interest
    }

    fn adjust_interest(&mut self) {
        let interest = self.desired_interest();
        if interest == self.interest {
            return;
        }
        self.interest = interest;
        if let Some(reactor) = &self.reactor {
            reactor.modify(self.fd, interest);
        }
    }

    fn tag_broken(&mut self) {
        self.state |= PipeState::BROKEN;
        self.state -= PipeState::READABLE | PipeState::WRITABLE;
    }

    fn socket_error(&self) -> Option<std::io::Error> {
        match pending_error(&self.socket) {
            Ok(e) => e,
            Err(e) => Some(e),
        }
    }
}

impl Pipe for TcpPipe {
    fn init(&mut self, reactor: &Reactor, on_event: SocketCallback) -> anyhow::Result<()> {
        assert!(self.reactor.is_none(), "TCP pipe was initialized twice");

        self.interest = self.desired_interest();
        reactor.add(self.fd, self.interest, on_event)?;
        self.reactor = Some(reactor.clone());

        debug!("TCP pipe {}: initialized, state {:?}", self.fd, self.state);
        Ok(())
    }

    fn state(&self) -> PipeState {
        self.state.normalized()
    }

    fn recv(&mut self, buf: &mut [u8]) -> PipeResult<Recv> {
        if self.state.is_broken() {
            return Err(PipeError::Broken);
        }
        if buf.is_empty() {
            return Ok(Recv::Data(0));
        }

        let result = match (&self.socket).read(buf) {
            Ok(0) => {
                trace!("TCP pipe {}: received FIN", self.fd);
                self.state -= PipeState::READABLE;
                self.state |= PipeState::FIN_RCVD;
                Ok(Recv::Fin)
            }
            Ok(n) => {
                self.state |= PipeState::READABLE;
                Ok(Recv::Data(n))
            }
            Err(e) => {
                self.state -= PipeState::READABLE;
                if is_fatal_recv_error(&e) {
                    warn!("TCP pipe {}: recv failed: {}", self.fd, e);
                    self.tag_broken();
                    Err(PipeError::Io(e))
                }
                else {
                    Err(PipeError::WouldBlock)
                }
            }
        };

        self.adjust_interest();
        result
    }

    fn send(&mut self, buf: &[u8]) -> PipeResult<usize> {
        assert!(!self.state.is_fin_sent(), "send() on TCP pipe {} after FIN", self.fd);
        if self.state.is_broken() {
            return Err(PipeError::Broken);
        }

        let result = match self.socket.send_with_flags(buf, SEND_FLAGS) {
            Ok(n) if n == buf.len() => {
                self.state |= PipeState::WRITABLE;
                Ok(n)
            }
            Ok(n) => {
                trace!("TCP pipe {}: partial send, {} of {} bytes", self.fd, n, buf.len());
                self.state -= PipeState::WRITABLE;
                Ok(n)
            }
            Err(e) => {
                self.state -= PipeState::WRITABLE;
                if is_fatal_send_error(&e) {
                    warn!("TCP pipe {}: send failed: {}", self.fd, e);
                    self.tag_broken();
                    Err(PipeError::Io(e))
                }
                else {
                    Err(PipeError::WouldBlock)
                }
            }
        };

        self.adjust_interest();
        result
    }

    fn send_fin(&mut self) -> PipeResult<FinStatus> {
        assert!(!self.state.is_fin_sent(), "FIN on TCP pipe {} sent twice", self.fd);
        if self.state.is_broken() {
            return Err(PipeError::Broken);
        }

        let result = match self.socket.shutdown(Shutdown::Write) {
            Ok(()) => {
                debug!("TCP pipe {}: sent FIN", self.fd);
                self.state -= PipeState::WRITABLE;
                self.state |= PipeState::FIN_SENT;
                Ok(FinStatus::Sent)
            }
            Err(e) => {
                warn!("TCP pipe {}: shutdown failed: {}", self.fd, e);
                self.tag_broken();
                Err(PipeError::Io(e))
            }
        };

        self.adjust_interest();
        result
    }

    fn on_transport_event(&mut self, events: SocketEvents) -> PipeEvents {
        if self.state.is_broken() {
            return PipeEvents::empty();
        }

        let mut result = PipeEvents::empty();

        if !self.state.is_ready() {
            if !events.intersects(SocketEvents::WRITABLE | SocketEvents::ERROR) {
                return result;
            }

            let error = self.socket_error();
            if events.contains(SocketEvents::ERROR) || error.is_some() {
                match error {
                    Some(e) => warn!("TCP pipe {}: connect failed: {}", self.fd, e),
                    None => warn!("TCP pipe {}: connect failed", self.fd),
                }
                self.tag_broken();
                self.adjust_interest();
                return PipeEvents::BROKEN;
            }

            debug!("TCP pipe {}: connected", self.fd);
            self.state |= PipeState::READY;
            result |= PipeEvents::READY;
        }
        else if events.contains(SocketEvents::ERROR) {
            if let Some(e) = self.socket_error() {
                warn!("TCP pipe {}: socket error: {}", self.fd, e);
                self.tag_broken();
                self.adjust_interest();
                return PipeEvents::BROKEN;
            }
        }

        if events.contains(SocketEvents::READABLE) && !self.state.is_fin_rcvd() {
            self.state |= PipeState::READABLE;
            result |= PipeEvents::READABLE;
        }
        if events.contains(SocketEvents::WRITABLE) && !self.state.is_fin_sent() {
            self.state |= PipeState::WRITABLE;
            result |= PipeEvents::WRITABLE;
        }

        self.adjust_interest();
        trace!("TCP pipe {}: {:?} -> {:?}, state {:?}", self.fd, events, result, self.state);
        result
    }

    fn reschedule_read(&mut self) {
        if let Some(reactor) = &self.reactor {
            reactor.reschedule(self.fd, SocketEvents::READABLE);
        }
    }
}

impl Drop for TcpPipe {
    fn drop(&mut self) {
        if let Some(reactor) = self.reactor.take() {
            reactor.del(self.fd);
        }
        trace!("TCP pipe {}: closed", self.fd);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::Duration;

    use crate::test_util::{drive_pipe, run_until, socket_pair, tcp_pair};
    use super::*;

    #[test]
    fn test_connecting_becomes_ready() {
        let reactor = Reactor::new();
        let (client, _server) = tcp_pair();
        let driven = drive_pipe(TcpPipe::connecting(client), &reactor);
        let fd = driven.pipe.borrow().fd();

        assert_eq!(driven.pipe.borrow().state(), PipeState::empty());
        assert_eq!(reactor.interest(fd), Some(SocketEvents::WRITABLE));

        run_until(&reactor, || !driven.events.borrow().is_empty());

        let first = driven.events.borrow()[0];
        assert!(first.contains(PipeEvents::READY | PipeEvents::WRITABLE));
        assert_eq!(driven.pipe.borrow().state(), PipeState::READY | PipeState::WRITABLE);
        assert_eq!(reactor.interest(fd), Some(SocketEvents::READABLE));
    }

    #[test]
    fn test_connect_refused_is_broken() {
        let addr = {
            let listener = crate::net::listen("127.0.0.1:0".parse().unwrap(), 1).unwrap();
            crate::net::local_addr(&listener).unwrap()
        };
        let socket = match crate::net::connect_nonblocking(addr) {
            Ok(s) => s,
            // refused synchronously, nothing left for the pipe to do
            Err(_) => return,
        };

        let reactor = Reactor::new();
        let driven = drive_pipe(TcpPipe::connecting(socket), &reactor);
        run_until(&reactor, || !driven.events.borrow().is_empty());

        assert_eq!(*driven.events.borrow(), vec![PipeEvents::BROKEN]);
        let state = driven.pipe.borrow().state();
        assert!(state.is_broken());
        assert!(!state.is_ready());
        assert!(matches!(driven.pipe.borrow_mut().recv(&mut [0; 10]), Err(PipeError::Broken)));
    }

    #[test]
    fn test_recv_send_fin() {
        let reactor = Reactor::new();
        let (a, b) = socket_pair();
        let driven = drive_pipe(TcpPipe::connected(a), &reactor);
        let fd = driven.pipe.borrow().fd();
        assert_eq!(reactor.interest(fd), Some(SocketEvents::READABLE | SocketEvents::WRITABLE));

        (&b).write_all(b"hello").unwrap();
        run_until(&reactor, || driven.pipe.borrow().state().is_readable());
        assert_eq!(reactor.interest(fd), Some(SocketEvents::empty()));

        let mut buf = [0u8; 16];
        let mut pipe = driven.pipe.borrow_mut();
        assert_eq!(pipe.recv(&mut buf).unwrap(), Recv::Data(5));
        assert_eq!(&buf[..5], b"hello");
        assert!(pipe.state().is_readable());

        assert!(matches!(pipe.recv(&mut buf), Err(PipeError::WouldBlock)));
        assert!(!pipe.state().is_readable());
        assert!(reactor.interest(fd).unwrap().contains(SocketEvents::READABLE));

        assert_eq!(pipe.send(b"world").unwrap(), 5);
        assert!(pipe.state().is_writable());
        let mut received = [0u8; 5];
        (&b).read_exact(&mut received).unwrap();
        assert_eq!(&received, b"world");

        assert_eq!(pipe.send_fin().unwrap(), FinStatus::Sent);
        assert!(pipe.state().is_fin_sent());
        assert!(!pipe.state().is_writable());
        assert_eq!((&b).read(&mut received).unwrap(), 0);

        b.shutdown(Shutdown::Write).unwrap();
        drop(pipe);
        run_until(&reactor, || driven.pipe.borrow().state().is_readable());
        let mut pipe = driven.pipe.borrow_mut();
        assert_eq!(pipe.recv(&mut buf).unwrap(), Recv::Fin);
        assert!(pipe.state().is_fin_rcvd());
        assert!(!pipe.state().is_readable());
        assert_eq!(reactor.interest(fd), Some(SocketEvents::empty()));
    }

    #[test]
    fn test_partial_send_clears_writable() {
        let reactor = Reactor::new();
        let (a, _b) = socket_pair();
        a.set_send_buffer_size(4096).unwrap();
        let driven = drive_pipe(TcpPipe::connected(a), &reactor);
        let fd = driven.pipe.borrow().fd();

        let chunk = vec![7u8; 64 * 1024];
        let mut pipe = driven.pipe.borrow_mut();
        let mut total = 0;
        loop {
            match pipe.send(&chunk) {
                Ok(n) if n == chunk.len() => total += n,
                Ok(n) => {
                    total += n;
                    break;
                }
                Err(PipeError::WouldBlock) => break,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert!(total > 0);
        assert!(!pipe.state().is_writable());
        assert!(reactor.interest(fd).unwrap().contains(SocketEvents::WRITABLE));
    }

    #[test]
    fn test_send_to_closed_peer_is_fatal() {
        let reactor = Reactor::new();
        let (a, b) = socket_pair();
        drop(b);
        let driven = drive_pipe(TcpPipe::connected(a), &reactor);

        let mut pipe = driven.pipe.borrow_mut();
        assert!(matches!(pipe.send(b"x"), Err(PipeError::Io(_))));
        assert!(pipe.state().is_broken());
        assert!(matches!(pipe.send(b"x"), Err(PipeError::Broken)));
        assert_eq!(reactor.interest(pipe.fd()), Some(SocketEvents::empty()));
    }

    #[test]
    #[should_panic(expected = "after FIN")]
    fn test_send_after_fin() {
        let reactor = Reactor::new();
        let (a, _b) = socket_pair();
        let driven = drive_pipe(TcpPipe::connected(a), &reactor);
        let mut pipe = driven.pipe.borrow_mut();
        pipe.send_fin().unwrap();
        let _ = pipe.send(b"x");
    }

    #[test]
    fn test_reschedule_read() {
        let reactor = Reactor::new();
        let (a, b) = socket_pair();
        let driven = drive_pipe(TcpPipe::connected(a), &reactor);
        (&b).write_all(b"abc").unwrap();

        run_until(&reactor, || driven.pipe.borrow().state().is_readable());
        driven.events.borrow_mut().clear();

        // interest in readability is off now, so only a rescheduled read produces an event
        assert_eq!(reactor.monitor(Duration::from_millis(10)).unwrap(), 0);
        driven.pipe.borrow_mut().reschedule_read();
        assert_eq!(reactor.monitor(Duration::from_secs(10)).unwrap(), 1);
        assert_eq!(*driven.events.borrow(), vec![PipeEvents::READABLE]);
    }

    #[test]
    fn test_drop_unregisters() {
        let reactor = Reactor::new();
        let (a, _b) = socket_pair();
        let driven = drive_pipe(TcpPipe::connected(a), &reactor);
        let fd = driven.pipe.borrow().fd();
        assert!(reactor.is_registered(fd));

        drop(driven);
        assert!(!reactor.is_registered(fd));
    }
}
