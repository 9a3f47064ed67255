use bytes::BufMut;
use tracing::{trace, warn};

use crate::pipe::atomic_pipe::AtomicPipe;
use crate::pipe::{FinStatus, Pipe, PipeError, PipeEvents, PipeResult, PipeState, Recv};
use crate::reactor::reactor::{Reactor, SocketCallback};
use crate::reactor::socket_events::SocketEvents;
use crate::util::byte_buffer::ByteBuffer;
use crate::util::varint;
use crate::util::varint::{MAX_VARINT_LEN, MAX_VARINT_VALUE};

/// A pipe decorator that transfers datagrams over a byte stream, framing each one as
///  `<varint length><payload>`.
///
/// The inner pipe is wrapped in an [AtomicPipe] so that a frame is never split between sends.
///  Received bytes are collected in a reassembly buffer, and `recv()` returns one complete
///  datagram at a time. Malformed or oversized frames, a receive buffer too small for the next
///  datagram, and EOF in the middle of a frame break the pipe.
pub struct DatagramPipe<P: Pipe> {
    inner: AtomicPipe<P>,
    max_size: usize,
    rx: Option<ByteBuffer>,
    broken: bool,
}

impl<P: Pipe> DatagramPipe<P> {
    pub fn new(inner: P, max_size: usize) -> DatagramPipe<P> {
        assert!(max_size <= MAX_VARINT_VALUE, "maximum datagram size {} exceeds the framing limit", max_size);

        DatagramPipe {
            inner: AtomicPipe::new(inner),
            max_size,
            rx: None,
            broken: false,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// number of received bytes that are not yet returned as datagrams
    pub fn num_buffered(&self) -> usize {
        self.rx.as_ref()
            .map(|rx| rx.len())
            .unwrap_or(0)
    }

    fn has_complete_frame(&self) -> bool {
        match &self.rx {
            None => false,
            Some(rx) => match varint::parse(rx.as_ref()) {
                Ok(Some((header_len, size))) => header_len + size <= rx.len(),
                _ => false,
            },
        }
    }

    fn fail(&mut self, msg: String) -> PipeError {
        warn!("datagram pipe: {}", msg);
        self.broken = true;
        self.rx = None;
        PipeError::Protocol(msg)
    }

    /// moves the next complete datagram from the reassembly buffer to `buf`
    fn extract(&mut self, buf: &mut [u8]) -> PipeResult<Option<usize>> {
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => return Ok(None),
        };

        let (header_len, size) = match varint::parse(rx.as_ref()) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.fail(format!("bad datagram header: {}", e))),
        };

        if size > self.max_size {
            return Err(self.fail(format!("datagram of {} bytes exceeds the maximum of {} bytes", size, self.max_size)));
        }
        if size > buf.len() {
            return Err(self.fail(format!("datagram of {} bytes does not fit into a buffer of {} bytes", size, buf.len())));
        }
        if header_len + size > rx.len() {
            return Ok(None);
        }

        buf[..size].copy_from_slice(&rx.as_ref()[header_len..header_len + size]);
        rx.consume(header_len + size);
        trace!("datagram pipe: received datagram of {} bytes, {} bytes left buffered", size, rx.len());
        Ok(Some(size))
    }

    fn release_empty_rx(&mut self) {
        if self.rx.as_ref().map(|rx| rx.is_empty()).unwrap_or(false) {
            self.rx = None;
        }
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> PipeResult<Recv> {
        if let Some(size) = self.extract(buf)? {
            return Ok(Recv::Data(size));
        }

        let rx = prepare_rx(&mut self.rx, buf.len());
        match self.inner.recv(rx.spare_mut())? {
            Recv::Data(n) => {
                rx.commit(n);
                match self.extract(buf)? {
                    Some(size) => Ok(Recv::Data(size)),
                    None => Err(PipeError::WouldBlock),
                }
            }
            Recv::Fin if rx.is_empty() => Ok(Recv::Fin),
            Recv::Fin => {
                let buffered = rx.len();
                Err(self.fail(format!("connection closed with {} bytes of an incomplete datagram", buffered)))
            }
        }
    }
}

/// makes room for a read of up to `payload_len` bytes, moving buffered bytes to the front
fn prepare_rx(rx: &mut Option<ByteBuffer>, payload_len: usize) -> &mut ByteBuffer {
    let min_capacity = MAX_VARINT_LEN + payload_len;
    let prepared = match rx.take() {
        None => ByteBuffer::alloc(min_capacity),
        Some(buffered) if buffered.capacity() < min_capacity => buffered.regrow(min_capacity),
        Some(mut buffered) => {
            buffered.compact();
            buffered
        }
    };
    rx.insert(prepared)
}

impl<P: Pipe> Pipe for DatagramPipe<P> {
    fn init(&mut self, reactor: &Reactor, on_event: SocketCallback) -> anyhow::Result<()> {
        self.inner.init(reactor, on_event)
    }

    fn state(&self) -> PipeState {
        let mut state = self.inner.state();
        if self.broken {
            state |= PipeState::BROKEN;
        }
        if self.has_complete_frame() {
            state |= PipeState::READABLE;
        }
        state.normalized()
    }

    fn recv(&mut self, buf: &mut [u8]) -> PipeResult<Recv> {
        if self.broken || self.inner.state().is_broken() {
            return Err(PipeError::Broken);
        }

        let result = self.recv_frame(buf);
        self.release_empty_rx();
        result
    }

    fn send(&mut self, buf: &[u8]) -> PipeResult<usize> {
        if self.broken {
            return Err(PipeError::Broken);
        }
        if buf.len() > self.max_size {
            return Err(self.fail(format!("datagram of {} bytes exceeds the maximum of {} bytes", buf.len(), self.max_size)));
        }
        if !self.inner.state().is_writable() {
            return Err(PipeError::WouldBlock);
        }

        let mut frame = ByteBuffer::alloc(MAX_VARINT_LEN + buf.len());
        let header_len = match varint::store(frame.spare_mut(), buf.len()) {
            Ok(n) => n,
            Err(e) => return Err(self.fail(format!("can not frame datagram: {}", e))),
        };
        frame.commit(header_len);
        frame.put_slice(buf);

        self.inner.send(frame.as_ref())?;
        trace!("datagram pipe: sent datagram of {} bytes", buf.len());
        Ok(buf.len())
    }

    fn send_fin(&mut self) -> PipeResult<FinStatus> {
        if self.broken {
            return Err(PipeError::Broken);
        }
        self.inner.send_fin()
    }

    fn on_transport_event(&mut self, events: SocketEvents) -> PipeEvents {
        let result = self.inner.on_transport_event(events);
        if self.broken {
            return PipeEvents::empty();
        }
        result
    }

    fn reschedule_read(&mut self) {
        self.inner.reschedule_read()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::test_util::{MemoryPipe, SendStep};
    use super::*;

    const MAX: usize = 64 * 1024;

    fn encode_all(payloads: &[Vec<u8>]) -> Vec<u8> {
        let inner = MemoryPipe::new();
        let sent = inner.sent.clone();
        let mut pipe = DatagramPipe::new(inner, MAX);
        for p in payloads {
            assert_eq!(pipe.send(p).unwrap(), p.len());
        }
        let result = sent.borrow().clone();
        result
    }

    fn decode_all(chunks: Vec<Vec<u8>>, buf_len: usize) -> PipeResult<Vec<Vec<u8>>> {
        let mut inner = MemoryPipe::with_inbound(chunks);
        inner.inbound_fin = true;
        let mut pipe = DatagramPipe::new(inner, MAX);

        let mut result = Vec::new();
        let mut buf = vec![0u8; buf_len];
        loop {
            match pipe.recv(&mut buf) {
                Ok(Recv::Data(n)) => result.push(buf[..n].to_vec()),
                Ok(Recv::Fin) => return Ok(result),
                Err(PipeError::WouldBlock) => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn sample_payloads() -> Vec<Vec<u8>> {
        vec![
            b"hello".to_vec(),
            vec![],
            vec![1u8; 127],
            vec![2u8; 128],
            (0..5000).map(|i| i as u8).collect(),
            b"x".to_vec(),
        ]
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(encode_all(&[b"abc".to_vec()]), vec![3, b'a', b'b', b'c']);
        assert_eq!(encode_all(&[vec![]]), vec![0]);
        assert_eq!(encode_all(&[vec![9u8; 200]])[..2], [0xc8, 0x01]);
    }

    #[rstest]
    #[case::all_at_once(0)]
    #[case::one_byte_at_a_time(1)]
    #[case::odd_chunks(7)]
    #[case::big_chunks(1000)]
    fn test_round_trip(#[case] chunk_size: usize) {
        let payloads = sample_payloads();
        let wire = encode_all(&payloads);
        let chunks = if chunk_size == 0 {
            vec![wire]
        }
        else {
            wire.chunks(chunk_size).map(|c| c.to_vec()).collect()
        };

        assert_eq!(decode_all(chunks, 8192).unwrap(), payloads);
    }

    #[test]
    fn test_round_trip_with_four_byte_header() {
        let payload = (0..(1usize << 25) + 3).map(|i| (i % 239) as u8).collect::<Vec<_>>();
        let max_size = payload.len();

        let outbound = MemoryPipe::new();
        let sent = outbound.sent.clone();
        let mut pipe = DatagramPipe::new(outbound, max_size);
        assert_eq!(pipe.send(&payload).unwrap(), payload.len());

        drop(pipe);
        let wire = std::mem::take(&mut *sent.borrow_mut());
        assert_eq!(wire[..4], [0x83, 0x80, 0x80, 0x10]);
        assert_eq!(wire.len(), 4 + payload.len());

        let mut inbound = MemoryPipe::with_inbound(vec![wire]);
        inbound.inbound_fin = true;
        let mut pipe = DatagramPipe::new(inbound, max_size);
        let mut buf = vec![0u8; max_size];
        assert_eq!(pipe.recv(&mut buf).unwrap(), Recv::Data(payload.len()));
        assert!(buf[..payload.len()] == payload[..]);
        assert_eq!(pipe.recv(&mut buf).unwrap(), Recv::Fin);
    }

    #[test]
    fn test_buffered_datagrams_are_readable() {
        let wire = encode_all(&[b"one".to_vec(), b"two".to_vec()]);
        let mut inner = MemoryPipe::with_inbound(vec![wire]);
        // the inner pipe reports readability only until it runs dry
        inner.state -= PipeState::READABLE;
        let mut pipe = DatagramPipe::new(inner, MAX);

        let mut buf = [0u8; 100];
        assert_eq!(pipe.recv(&mut buf).unwrap(), Recv::Data(3));
        assert!(pipe.state().is_readable());
        assert_eq!(pipe.num_buffered(), 4);
        assert_eq!(pipe.recv(&mut buf).unwrap(), Recv::Data(3));
        assert_eq!(&buf[..3], b"two");
        assert_eq!(pipe.num_buffered(), 0);
    }

    #[rstest]
    #[case::oversized_header(vec![vec![0x80, 0x80, 0x08]], 8192)]
    #[case::malformed_header(vec![vec![0xff, 0xff, 0xff, 0xff, 0x01]], 8192)]
    #[case::buffer_too_small(vec![vec![10, 1, 2, 3]], 5)]
    #[case::eof_in_header(vec![vec![0x80]], 8192)]
    #[case::eof_in_payload(vec![vec![5, 1, 2]], 8192)]
    fn test_framing_errors(#[case] chunks: Vec<Vec<u8>>, #[case] buf_len: usize) {
        let mut inner = MemoryPipe::with_inbound(chunks);
        inner.inbound_fin = true;
        let mut pipe = DatagramPipe::new(inner, MAX);

        let mut buf = vec![0u8; buf_len];
        let error = loop {
            match pipe.recv(&mut buf) {
                Err(PipeError::WouldBlock) => continue,
                Err(e) => break e,
                Ok(r) => panic!("unexpected {:?}", r),
            }
        };
        assert!(matches!(error, PipeError::Protocol(_)));
        assert!(pipe.state().is_broken());
        assert!(matches!(pipe.recv(&mut buf), Err(PipeError::Broken)));
        assert!(matches!(pipe.send(b"x"), Err(PipeError::Broken)));
        assert_eq!(pipe.on_transport_event(SocketEvents::READABLE), PipeEvents::empty());
    }

    #[test]
    fn test_clean_eof() {
        assert_eq!(decode_all(vec![], 100).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_partial_inner_send_keeps_frames_whole() {
        let mut inner = MemoryPipe::new();
        inner.send_steps = vec![SendStep::Accept(2)].into();
        let sent = inner.sent.clone();
        let mut pipe = DatagramPipe::new(inner, MAX);

        assert_eq!(pipe.send(b"abcdef").unwrap(), 6);
        assert!(!pipe.state().is_writable());
        assert!(matches!(pipe.send(b"next"), Err(PipeError::WouldBlock)));

        assert_eq!(pipe.on_transport_event(SocketEvents::WRITABLE), PipeEvents::WRITABLE);
        assert!(pipe.send(b"next").is_ok());
        assert_eq!(*sent.borrow(), b"\x06abcdef\x04next");
    }

    #[test]
    fn test_send_too_large() {
        let mut pipe = DatagramPipe::new(MemoryPipe::new(), 10);
        assert!(matches!(pipe.send(&[0u8; 11]), Err(PipeError::Protocol(_))));
        assert!(pipe.state().is_broken());
    }

    #[test]
    fn test_inner_failure_is_passed_on() {
        let mut inner = MemoryPipe::new();
        inner.send_steps = vec![SendStep::Fail].into();
        let mut pipe = DatagramPipe::new(inner, MAX);

        assert!(matches!(pipe.send(b"abc"), Err(PipeError::Io(_))));
        assert!(pipe.state().is_broken());
    }
}
