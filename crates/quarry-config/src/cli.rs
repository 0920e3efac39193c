//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;
use crate::config::OperatorRole;

/// Quarry command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "quarry", about = "Distributed probe scheduler")]
pub struct CliArgs {
    /// Game server host.
    #[arg(long)]
    pub game_host: Option<String>,

    /// Game server port.
    #[arg(long)]
    pub game_port: Option<u16>,

    /// Operator server host.
    #[arg(long)]
    pub operator_host: Option<String>,

    /// Operator server port.
    #[arg(long)]
    pub operator_port: Option<u16>,

    /// Role announced to the operator server (listening, reporting, archiving).
    #[arg(long)]
    pub role: Option<String>,

    /// Milliseconds between scheduler cycles.
    #[arg(long)]
    pub tick_interval_ms: Option<u64>,

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
        if let Some(ref host) = args.game_host {
            self.game.host = host.clone();
        }
        if let Some(port) = args.game_port {
            self.game.port = port;
        }
        if let Some(ref host) = args.operator_host {
            self.operator.host = host.clone();
            self.operator.enabled = true;
        }
        if let Some(port) = args.operator_port {
            self.operator.port = port;
        }
        if let Some(role) = args.role.as_deref() {
            match OperatorRole::from_name(role) {
                Some(role) => self.operator.role = role,
                None => tracing::warn!("ignoring unknown role '{role}'"),
            }
        }
        if let Some(ms) = args.tick_interval_ms {
            self.scheduler.tick_interval_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> CliArgs {
        CliArgs {
            game_host: None,
            game_port: None,
            operator_host: None,
            operator_port: None,
            role: None,
            tick_interval_ms: None,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            game_host: Some("10.0.0.5".to_string()),
            operator_host: Some("ops.local".to_string()),
            role: Some("Archiving".to_string()),
            ..empty_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.game.host, "10.0.0.5");
        assert_eq!(config.operator.host, "ops.local");
        assert!(config.operator.enabled);
        assert_eq!(config.operator.role, OperatorRole::Archiving);
        // Non-overridden fields retain defaults
        assert_eq!(config.game.port, 25565);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&empty_args());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from(["quarry", "--game-port", "25570", "--log-level", "debug"]);
        assert_eq!(args.game_port, Some(25570));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
