//! Runtime configuration.
//!
//! Settings persist to disk as RON, accept CLI overrides via clap, and a
//! subset is exposed to operators as named, typed rules.

mod cli;
mod config;
mod error;
mod rules;

pub use cli::CliArgs;
pub use config::{
    CompressionSettings, Config, DebugConfig, GameConfig, NetworkConfig, OperatorConfig,
    OperatorRole, SchedulerConfig,
};
pub use error::ConfigError;
pub use rules::{ConfigDataType, ConfigRule, RuleTable, RuleValue};
