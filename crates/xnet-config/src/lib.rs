//! On-disk configuration for the XNet server.
//!
//! Settings live in `config.ron` under the platform config directory. Missing
//! fields take their defaults and unknown fields are ignored, so files written
//! by older or newer builds still load. Command-line flags override the file.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, LogSettings, PoolSettings, ServerSettings};
pub use error::ConfigError;
