pub mod bridge;
pub mod bridge_config;
