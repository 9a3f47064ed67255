use bitflags::bitflags;

bitflags! {
    /// Readiness conditions of a socket as seen by the [crate::reactor::reactor::Reactor].
    ///
    /// `READABLE` and `WRITABLE` are subject to a registration's interest mask, `ERROR` is
    ///  always monitored.
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
    pub struct SocketEvents: u8 {
        const READABLE = 0b0000_0001;
        const WRITABLE = 0b0000_0010;
        const ERROR    = 0b0000_0100;
    }
}
