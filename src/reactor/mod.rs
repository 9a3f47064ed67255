pub mod reactor;
pub mod socket_events;
mod fd_set;
