use tracing::{debug, trace};

use crate::pipe::{FinStatus, Pipe, PipeEvents, PipeError, PipeResult, PipeState, Recv};
use crate::reactor::reactor::{Reactor, SocketCallback};
use crate::reactor::socket_events::SocketEvents;
use crate::util::byte_buffer::ByteBuffer;

/// A pipe decorator that makes `send()` all-or-nothing.
///
/// If the inner pipe accepts only part of a buffer, the rest is copied and queued, and the
///  caller is told that everything was accepted. The queued remainder is flushed when the inner
///  pipe becomes writable again. Until then this pipe is not writable and refuses further sends
///  with [PipeError::WouldBlock], and a FIN requested in the meantime is deferred until the
///  remainder is flushed (reported as [PipeEvents::FIN_SENT]).
pub struct AtomicPipe<P: Pipe> {
    inner: P,
    pending: Option<ByteBuffer>,
    want_fin: bool,
}

impl<P: Pipe> AtomicPipe<P> {
    pub fn new(inner: P) -> AtomicPipe<P> {
        AtomicPipe {
            inner,
            pending: None,
            want_fin: false,
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// number of bytes accepted by `send()` and not yet passed to the inner pipe
    pub fn num_pending(&self) -> usize {
        self.pending.as_ref()
            .map(|p| p.len())
            .unwrap_or(0)
    }

    fn flush(&mut self, events: &mut PipeEvents) {
        if let Some(pending) = self.pending.as_mut() {
            match self.inner.send(pending.as_ref()) {
                Err(e) => {
                    if e.is_fatal() {
                        debug!("atomic pipe: flushing failed: {}", e);
                        *events |= PipeEvents::BROKEN;
                    }
                    *events -= PipeEvents::WRITABLE;
                }
                Ok(n) if n < pending.len() => {
                    trace!("atomic pipe: flushed {} of {} pending bytes", n, pending.len());
                    pending.consume(n);
                    *events -= PipeEvents::WRITABLE;
                }
                Ok(n) => {
                    trace!("atomic pipe: flushed all {} pending bytes", n);
                    self.pending = None;
                    if !self.inner.state().is_writable() {
                        *events -= PipeEvents::WRITABLE;
                    }
                }
            }
        }

        if self.pending.is_none() && self.want_fin {
            self.want_fin = false;
            match self.inner.send_fin() {
                Ok(FinStatus::Sent) => {
                    debug!("atomic pipe: sent deferred FIN");
                    *events |= PipeEvents::FIN_SENT;
                }
                Ok(FinStatus::Pending) => {}
                Err(e) => {
                    debug!("atomic pipe: deferred FIN failed: {}", e);
                    if e.is_fatal() {
                        *events |= PipeEvents::BROKEN;
                    }
                }
            }
            *events -= PipeEvents::WRITABLE;
        }
    }
}

impl<P: Pipe> Pipe for AtomicPipe<P> {
    fn init(&mut self, reactor: &Reactor, on_event: SocketCallback) -> anyhow::Result<()> {
        self.inner.init(reactor, on_event)
    }

    fn state(&self) -> PipeState {
        let mut state = self.inner.state();
        if self.pending.is_some() {
            state -= PipeState::WRITABLE;
        }
        state
    }

    fn recv(&mut self, buf: &mut [u8]) -> PipeResult<Recv> {
        self.inner.recv(buf)
    }

    fn send(&mut self, buf: &[u8]) -> PipeResult<usize> {
        assert!(!self.want_fin, "send() on atomic pipe after FIN");
        if self.pending.is_some() {
            return Err(PipeError::WouldBlock);
        }

        let n = self.inner.send(buf)?;
        if n < buf.len() {
            debug!("atomic pipe: partial send, queueing {} of {} bytes", buf.len() - n, buf.len());
            self.pending = Some(ByteBuffer::copy_of(&buf[n..]));
        }
        Ok(buf.len())
    }

    fn send_fin(&mut self) -> PipeResult<FinStatus> {
        assert!(!self.want_fin, "FIN on atomic pipe requested twice");

        if self.pending.is_some() {
            debug!("atomic pipe: deferring FIN until {} pending bytes are flushed", self.num_pending());
            self.want_fin = true;
            return Ok(FinStatus::Pending);
        }
        self.inner.send_fin()
    }

    fn on_transport_event(&mut self, events: SocketEvents) -> PipeEvents {
        let mut result = self.inner.on_transport_event(events);
        if result.contains(PipeEvents::WRITABLE) && (self.pending.is_some() || self.want_fin) {
            self.flush(&mut result);
        }
        result
    }

    fn reschedule_read(&mut self) {
        self.inner.reschedule_read()
    }
}
