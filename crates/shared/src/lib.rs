//! Configuration, error and logging plumbing shared by the mesh crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::TransportConfig;
pub use error::{ConfigError, Result};
