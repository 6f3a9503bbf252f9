//! Configuration, error and logging plumbing shared by the quictun client
//! and server binaries.

pub mod config;
mod error;
pub mod logging;

pub use config::{BackoffKind, ClientConfig, Config, Mode, NoDelay, ServerConfig};
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
