pub mod bridge;
pub mod config;
pub mod net;
pub mod pipe;
pub mod reactor;
pub mod relay;
pub mod util;

#[cfg(test)]
pub mod test_util;
