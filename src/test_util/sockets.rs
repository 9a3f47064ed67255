use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::net::{accept, connect_nonblocking, listen, local_addr};
use crate::reactor::reactor::Reactor;

/// a connected pair of non-blocking Unix stream sockets
pub fn socket_pair() -> (Socket, Socket) {
    let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

/// A TCP connection on localhost: the client side with its (non-blocking) connect still possibly
///  in progress, and the accepted server side.
pub fn tcp_pair() -> (Socket, Socket) {
    let listener = listen("127.0.0.1:0".parse().unwrap(), 8).unwrap();
    let client = connect_nonblocking(local_addr(&listener).unwrap()).unwrap();
    let (server, _) = accept(&listener).unwrap();
    (client, server)
}

/// Calls `monitor()` until `condition` holds, panicking if it does not within a generous number
///  of rounds. Returns the number of `monitor()` calls.
pub fn run_until(reactor: &Reactor, mut condition: impl FnMut() -> bool) -> usize {
    for round in 0..2000 {
        if condition() {
            return round;
        }
        reactor.monitor(Duration::from_millis(10)).unwrap();
    }
    panic!("condition not reached");
}
