//! XNet server binary.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p xnet-server -- --port 40777 --workers 8`.

mod addons;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use xnet_config::{CliArgs, Config};
use xnet_core::{Server, ServerConfig, XnetError, report};

/// Map the on-disk settings onto the core's validated configuration.
fn server_config(config: &Config) -> ServerConfig {
    let server = &config.server;
    ServerConfig::new(
        Some(server.ip.as_str()),
        server.port,
        server.backlog,
        server.timeout_seconds,
    )
    .with_max_connections(server.max_connections)
    .with_handle_signals(server.handle_signals)
    .with_worker_threads(config.pool.worker_threads)
    .with_max_tasks(config.pool.max_tasks)
    .with_io_timeout(Duration::from_millis(config.pool.io_timeout_ms))
}

fn run(config: ServerConfig) -> Result<(), XnetError> {
    let server = Server::create(config)?;
    addons::install(&server.handle())?;

    tracing::info!(addr = %server.local_addr(), "XNet server listening");
    let result = server.start();
    server.destroy();
    result
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = match args.config.clone().map(Ok).unwrap_or_else(Config::default_dir) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve config directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    xnet_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    match run(server_config(&config)) {
        Ok(()) => {
            tracing::info!("XNet server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&e, "server");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_follows_file_settings() {
        let mut config = Config::default();
        config.server.port = 50000;
        config.server.max_connections = 12;
        config.server.handle_signals = false;
        config.pool.worker_threads = 3;
        config.pool.io_timeout_ms = 250;

        let mapped = server_config(&config);
        assert_eq!(mapped.port(), 50000);
        assert_eq!(mapped.max_connections(), 12);
        assert!(!mapped.handle_signals());
        assert_eq!(mapped.worker_threads(), 3);
        assert_eq!(mapped.io_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_out_of_range_settings_fall_back_to_defaults() {
        let mut config = Config::default();
        config.server.port = 80;
        config.server.timeout_seconds = 999_999;

        let mapped = server_config(&config);
        assert_eq!(mapped.port(), xnet_core::DEFAULT_PORT);
        assert_eq!(
            mapped.timeout(),
            Duration::from_secs(xnet_core::DEFAULT_TIMEOUT_SECS)
        );
    }
}
