use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::pipe::{FinStatus, Pipe, PipeError, PipeEvents, PipeResult, PipeState, Recv};
use crate::reactor::reactor::{Reactor, SocketCallback};
use crate::reactor::socket_events::SocketEvents;

/// A pipe bound to a reactor with a callback that records the [PipeEvents] it reports.
pub struct DrivenPipe<P: Pipe> {
    pub pipe: Rc<RefCell<P>>,
    pub events: Rc<RefCell<Vec<PipeEvents>>>,
}

pub fn drive_pipe<P: Pipe + 'static>(pipe: P, reactor: &Reactor) -> DrivenPipe<P> {
    let pipe = Rc::new(RefCell::new(pipe));
    let events = Rc::new(RefCell::new(Vec::new()));

    let weak_pipe = Rc::downgrade(&pipe);
    let log = events.clone();
    let on_event: SocketCallback = Box::new(move |socket_events| {
        if let Some(pipe) = weak_pipe.upgrade() {
            let pipe_events = pipe.borrow_mut().on_transport_event(socket_events);
            log.borrow_mut().push(pipe_events);
        }
    });
    pipe.borrow_mut().init(reactor, on_event).unwrap();

    DrivenPipe { pipe, events }
}

/// What a [MemoryPipe] does on the next call to `send()`
#[derive(Debug)]
pub enum SendStep {
    /// accept at most this many bytes; accepting fewer than offered clears `WRITABLE`
    Accept(usize),
    WouldBlock,
    Fail,
}

/// A scripted in-memory pipe for testing pipe decorators. Sends follow the queued [SendStep]s
///  (accepting everything when the queue is empty), and received data is served from queued
///  chunks, one chunk (or as much of it as fits) per call.
pub struct MemoryPipe {
    pub state: PipeState,
    pub sent: Rc<RefCell<Vec<u8>>>,
    pub send_steps: VecDeque<SendStep>,
    pub inbound: VecDeque<Vec<u8>>,
    /// report FIN once `inbound` is exhausted
    pub inbound_fin: bool,
    pub fin_calls: Rc<RefCell<usize>>,
    pub fail_fin: bool,
}

impl MemoryPipe {
    pub fn new() -> MemoryPipe {
        MemoryPipe {
            state: PipeState::READY | PipeState::WRITABLE,
            sent: Default::default(),
            send_steps: VecDeque::new(),
            inbound: VecDeque::new(),
            inbound_fin: false,
            fin_calls: Default::default(),
            fail_fin: false,
        }
    }

    pub fn with_inbound(chunks: Vec<Vec<u8>>) -> MemoryPipe {
        let mut result = MemoryPipe::new();
        result.inbound = chunks.into();
        result.state |= PipeState::READABLE;
        result
    }
}

impl Pipe for MemoryPipe {
    fn init(&mut self, _reactor: &Reactor, _on_event: SocketCallback) -> anyhow::Result<()> {
        Ok(())
    }

    fn state(&self) -> PipeState {
        self.state.normalized()
    }

    fn recv(&mut self, buf: &mut [u8]) -> PipeResult<Recv> {
        if self.state.is_broken() {
            return Err(PipeError::Broken);
        }
        match self.inbound.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.inbound.push_front(chunk.split_off(n));
                }
                Ok(Recv::Data(n))
            }
            None if self.inbound_fin => {
                self.state -= PipeState::READABLE;
                self.state |= PipeState::FIN_RCVD;
                Ok(Recv::Fin)
            }
            None => {
                self.state -= PipeState::READABLE;
                Err(PipeError::WouldBlock)
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> PipeResult<usize> {
        assert!(!self.state.is_fin_sent());
        if self.state.is_broken() {
            return Err(PipeError::Broken);
        }
        match self.send_steps.pop_front() {
            None => {
                self.sent.borrow_mut().extend_from_slice(buf);
                self.state |= PipeState::WRITABLE;
                Ok(buf.len())
            }
            Some(SendStep::Accept(limit)) => {
                let n = limit.min(buf.len());
                self.sent.borrow_mut().extend_from_slice(&buf[..n]);
                if n < buf.len() {
                    self.state -= PipeState::WRITABLE;
                }
                Ok(n)
            }
            Some(SendStep::WouldBlock) => {
                self.state -= PipeState::WRITABLE;
                Err(PipeError::WouldBlock)
            }
            Some(SendStep::Fail) => {
                self.state |= PipeState::BROKEN;
                Err(PipeError::Io(io::Error::from(io::ErrorKind::ConnectionReset)))
            }
        }
    }

    fn send_fin(&mut self) -> PipeResult<FinStatus> {
        assert!(!self.state.is_fin_sent());
        *self.fin_calls.borrow_mut() += 1;
        if self.fail_fin {
            self.state |= PipeState::BROKEN;
            return Err(PipeError::Io(io::Error::from(io::ErrorKind::NotConnected)));
        }
        self.state -= PipeState::WRITABLE;
        self.state |= PipeState::FIN_SENT;
        Ok(FinStatus::Sent)
    }

    fn on_transport_event(&mut self, events: SocketEvents) -> PipeEvents {
        let mut result = PipeEvents::empty();
        if events.contains(SocketEvents::WRITABLE) && !self.state.is_fin_sent() {
            self.state |= PipeState::WRITABLE;
            result |= PipeEvents::WRITABLE;
        }
        if events.contains(SocketEvents::READABLE) && !self.state.is_fin_rcvd() {
            self.state |= PipeState::READABLE;
            result |= PipeEvents::READABLE;
        }
        result
    }

    fn reschedule_read(&mut self) {
    }
}
