//! Command-line argument parsing for the XNet server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// XNet server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "xnet", about = "Event-driven TCP server core")]
pub struct CliArgs {
    /// IPv4 address to bind.
    #[arg(long)]
    pub ip: Option<String>,

    /// Port to bind.
    #[arg(long)]
    pub port: Option<u32>,

    /// Listen backlog.
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Session idle timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Worker thread count.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref ip) = args.ip {
            self.server.ip = ip.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(backlog) = args.backlog {
            self.server.backlog = backlog;
        }
        if let Some(timeout) = args.timeout {
            self.server.timeout_seconds = timeout;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(workers) = args.workers {
            self.pool.worker_threads = workers;
        }
        if let Some(ref level) = args.log_level {
            self.log.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            port: Some(45000),
            ip: Some("192.168.1.1".to_string()),
            workers: Some(8),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.port, 45000);
        assert_eq!(config.server.ip, "192.168.1.1");
        assert_eq!(config.pool.worker_threads, 8);
        // Non-overridden fields retain defaults
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.timeout_seconds, 3600);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "xnet",
            "--port",
            "47007",
            "--timeout",
            "5",
            "--max-connections",
            "2",
        ]);
        assert_eq!(args.port, Some(47007));
        assert_eq!(args.timeout, Some(5));
        assert_eq!(args.max_connections, Some(2));
        assert!(args.ip.is_none());
    }
}
