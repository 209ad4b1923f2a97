pub mod config;
pub mod redis;
pub mod types;

pub use config::{EngineConfig, NetworkIsolation};
pub use types::*;
