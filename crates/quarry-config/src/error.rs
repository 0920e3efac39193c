//! Configuration error types.

/// Errors that can occur when loading, saving, or editing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config: {0}")]
    ReadError(#[source] std::io::Error),

    /// Failed to write the config file to disk.
    #[error("failed to write config: {0}")]
    WriteError(#[source] std::io::Error),

    /// Failed to parse RON content.
    #[error("failed to parse config: {0}")]
    ParseError(#[source] ron::error::SpannedError),

    /// Failed to serialize config to RON.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] ron::Error),

    /// No rule with this name exists.
    #[error("unknown config rule '{0}'")]
    UnknownRule(String),

    /// The rule cannot be read remotely.
    #[error("config rule '{0}' is not gettable")]
    NotGettable(String),

    /// The rule cannot be written remotely.
    #[error("config rule '{0}' is read-only")]
    ReadOnly(String),

    /// The value does not match the rule's declared type.
    #[error("config rule '{rule}' expects {expected}")]
    TypeMismatch {
        /// Rule name.
        rule: String,
        /// Declared type.
        expected: &'static str,
    },

    /// The value has the right type but is not allowed.
    #[error("value {value} is not valid for config rule '{rule}'")]
    InvalidValue {
        /// Rule name.
        rule: String,
        /// Rejected value.
        value: String,
    },
}
