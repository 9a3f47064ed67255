//! Helpers for tests: socket pairs, driving a reactor until a condition holds, and a scripted
//!  in-memory pipe.

pub mod sockets;
pub mod pipes;

pub use pipes::{drive_pipe, DrivenPipe, MemoryPipe, SendStep};
pub use sockets::{run_until, socket_pair, tcp_pair};
