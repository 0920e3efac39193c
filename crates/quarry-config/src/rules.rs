//! Named config rules that operators can read and write remotely.
//!
//! Each rule pairs a name with a typed getter and an optional typed setter
//! over [`Config`]. The table is built once and never changes.

use crate::config::{Config, OperatorRole};
use crate::error::ConfigError;

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Declared type of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDataType {
    String,
    Integer,
    Float,
    Boolean,
    /// One of a fixed set of names.
    Enum(&'static [&'static str]),
}

impl ConfigDataType {
    fn label(self) -> &'static str {
        match self {
            ConfigDataType::String => "a string",
            ConfigDataType::Integer => "an integer",
            ConfigDataType::Float => "a float",
            ConfigDataType::Boolean => "a boolean",
            ConfigDataType::Enum(_) => "an enum name",
        }
    }
}

/// A rule value in transit.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Enum(String),
}

impl std::fmt::Display for RuleValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleValue::String(s) | RuleValue::Enum(s) => f.write_str(s),
            RuleValue::Integer(i) => write!(f, "{i}"),
            RuleValue::Float(x) => write!(f, "{x}"),
            RuleValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

enum Accessor {
    Integer {
        get: fn(&Config) -> i64,
        set: Option<fn(&mut Config, i64)>,
        min: i64,
        max: i64,
    },
    Float {
        get: fn(&Config) -> f64,
        set: Option<fn(&mut Config, f64)>,
    },
    Boolean {
        get: fn(&Config) -> bool,
        set: Option<fn(&mut Config, bool)>,
    },
    Text {
        get: fn(&Config) -> String,
        set: Option<fn(&mut Config, String)>,
    },
    Enum {
        values: &'static [&'static str],
        get: fn(&Config) -> String,
        set: Option<fn(&mut Config, String)>,
    },
}

/// One named rule.
pub struct ConfigRule {
    name: &'static str,
    gettable: bool,
    accessor: Accessor,
}

impl ConfigRule {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn data_type(&self) -> ConfigDataType {
        match self.accessor {
            Accessor::Integer { .. } => ConfigDataType::Integer,
            Accessor::Float { .. } => ConfigDataType::Float,
            Accessor::Boolean { .. } => ConfigDataType::Boolean,
            Accessor::Text { .. } => ConfigDataType::String,
            Accessor::Enum { values, .. } => ConfigDataType::Enum(values),
        }
    }

    pub fn gettable(&self) -> bool {
        self.gettable
    }

    pub fn settable(&self) -> bool {
        match &self.accessor {
            Accessor::Integer { set, .. } => set.is_some(),
            Accessor::Float { set, .. } => set.is_some(),
            Accessor::Boolean { set, .. } => set.is_some(),
            Accessor::Text { set, .. } | Accessor::Enum { set, .. } => set.is_some(),
        }
    }

    /// Current value, regardless of the gettable flag.
    pub fn read(&self, config: &Config) -> RuleValue {
        match &self.accessor {
            Accessor::Integer { get, .. } => RuleValue::Integer(get(config)),
            Accessor::Float { get, .. } => RuleValue::Float(get(config)),
            Accessor::Boolean { get, .. } => RuleValue::Boolean(get(config)),
            Accessor::Text { get, .. } => RuleValue::String(get(config)),
            Accessor::Enum { get, .. } => RuleValue::Enum(get(config)),
        }
    }

    fn write(&self, config: &mut Config, value: RuleValue) -> Result<(), ConfigError> {
        let read_only = || ConfigError::ReadOnly(self.name.to_owned());
        let mismatch = || ConfigError::TypeMismatch {
            rule: self.name.to_owned(),
            expected: self.data_type().label(),
        };
        let invalid = |value: &dyn std::fmt::Display| ConfigError::InvalidValue {
            rule: self.name.to_owned(),
            value: value.to_string(),
        };

        match (&self.accessor, value) {
            (Accessor::Integer { set, min, max, .. }, RuleValue::Integer(v)) => {
                let set = set.ok_or_else(read_only)?;
                if v < *min || v > *max {
                    return Err(invalid(&v));
                }
                set(config, v);
            }
            (Accessor::Float { set, .. }, RuleValue::Float(v)) => {
                let set = set.ok_or_else(read_only)?;
                if !v.is_finite() || v < 0.0 {
                    return Err(invalid(&v));
                }
                set(config, v);
            }
            (Accessor::Float { set, .. }, RuleValue::Integer(v)) => {
                let set = set.ok_or_else(read_only)?;
                if v < 0 {
                    return Err(invalid(&v));
                }
                set(config, v as f64);
            }
            (Accessor::Boolean { set, .. }, RuleValue::Boolean(v)) => {
                set.ok_or_else(read_only)?(config, v);
            }
            (Accessor::Text { set, .. }, RuleValue::String(v)) => {
                set.ok_or_else(read_only)?(config, v);
            }
            (Accessor::Enum { values, set, .. }, RuleValue::Enum(v)) => {
                let set = set.ok_or_else(read_only)?;
                let Some(canonical) = values.iter().find(|n| n.eq_ignore_ascii_case(&v)) else {
                    return Err(invalid(&v));
                };
                set(config, (*canonical).to_owned());
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

/// Every remotely visible config rule.
pub struct RuleTable {
    rules: Vec<ConfigRule>,
}

fn integer(
    name: &'static str,
    get: fn(&Config) -> i64,
    set: fn(&mut Config, i64),
    min: i64,
    max: i64,
) -> ConfigRule {
    ConfigRule {
        name,
        gettable: true,
        accessor: Accessor::Integer {
            get,
            set: Some(set),
            min,
            max,
        },
    }
}

impl RuleTable {
    /// The built-in rule set.
    pub fn standard() -> Self {
        let rules = vec![
            integer(
                "idle_timeout_secs",
                |c| c.network.idle_timeout_secs as i64,
                |c, v| c.network.idle_timeout_secs = v as u64,
                1,
                3600,
            ),
            integer(
                "max_reads_per_tick",
                |c| c.network.max_reads_per_tick as i64,
                |c, v| c.network.max_reads_per_tick = v as usize,
                1,
                1000,
            ),
            integer(
                "max_writes_per_tick",
                |c| c.network.max_writes_per_tick as i64,
                |c, v| c.network.max_writes_per_tick = v as usize,
                1,
                1000,
            ),
            ConfigRule {
                name: "compression_enabled",
                gettable: true,
                accessor: Accessor::Boolean {
                    get: |c| c.compression.enabled,
                    set: Some(|c: &mut Config, v: bool| c.compression.enabled = v),
                },
            },
            integer(
                "compression_threshold",
                |c| c.compression.threshold as i64,
                |c, v| c.compression.threshold = v as usize,
                0,
                i64::from(u32::MAX),
            ),
            integer(
                "tick_interval_ms",
                |c| c.scheduler.tick_interval_ms as i64,
                |c, v| c.scheduler.tick_interval_ms = v as u64,
                1,
                10_000,
            ),
            integer(
                "account_capacity",
                |c| c.scheduler.account_capacity as i64,
                |c, v| c.scheduler.account_capacity = v as usize,
                1,
                1024,
            ),
            integer(
                "digging_timeout_ms",
                |c| c.scheduler.digging_timeout_ms as i64,
                |c, v| c.scheduler.digging_timeout_ms = v as u64,
                1,
                600_000,
            ),
            ConfigRule {
                name: "digging_max_throughput",
                gettable: true,
                accessor: Accessor::Float {
                    get: |c| f64::from(c.scheduler.digging_max_throughput),
                    set: Some(|c: &mut Config, v: f64| {
                        c.scheduler.digging_max_throughput = v as f32
                    }),
                },
            },
            ConfigRule {
                name: "handler_name",
                gettable: true,
                accessor: Accessor::Text {
                    get: |c| c.operator.handler_name.clone(),
                    set: Some(|c: &mut Config, v: String| c.operator.handler_name = v),
                },
            },
            ConfigRule {
                name: "operator_host",
                gettable: true,
                accessor: Accessor::Text {
                    get: |c| format!("{}:{}", c.operator.host, c.operator.port),
                    set: None,
                },
            },
            ConfigRule {
                name: "operator_role",
                gettable: true,
                accessor: Accessor::Enum {
                    values: OperatorRole::NAMES,
                    get: |c| c.operator.role.as_str().to_owned(),
                    set: None,
                },
            },
            ConfigRule {
                name: "log_level",
                gettable: true,
                accessor: Accessor::Enum {
                    values: LOG_LEVELS,
                    get: |c| c.debug.log_level.clone(),
                    set: Some(|c: &mut Config, v: String| c.debug.log_level = v),
                },
            },
        ];
        Self { rules }
    }

    /// Look up a rule by name.
    pub fn rule(&self, name: &str) -> Option<&ConfigRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Every rule, in table order.
    pub fn describe(&self) -> impl Iterator<Item = &ConfigRule> {
        self.rules.iter()
    }

    /// Read a gettable rule.
    pub fn get(&self, config: &Config, name: &str) -> Result<RuleValue, ConfigError> {
        let rule = self
            .rule(name)
            .ok_or_else(|| ConfigError::UnknownRule(name.to_owned()))?;
        if !rule.gettable {
            return Err(ConfigError::NotGettable(name.to_owned()));
        }
        Ok(rule.read(config))
    }

    /// Type-check and write a settable rule.
    pub fn set(&self, config: &mut Config, name: &str, value: RuleValue) -> Result<(), ConfigError> {
        let rule = self
            .rule(name)
            .ok_or_else(|| ConfigError::UnknownRule(name.to_owned()))?;
        rule.write(config, value)?;
        tracing::info!(rule = name, value = %rule.read(config), "config rule updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let table = RuleTable::standard();
        let mut names: Vec<_> = table.describe().map(|r| r.name()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_get_reads_config() {
        let table = RuleTable::standard();
        let config = Config::default();
        assert_eq!(
            table.get(&config, "idle_timeout_secs").unwrap(),
            RuleValue::Integer(30)
        );
        assert_eq!(
            table.get(&config, "operator_role").unwrap(),
            RuleValue::Enum("reporting".into())
        );
    }

    #[test]
    fn test_set_writes_config() {
        let table = RuleTable::standard();
        let mut config = Config::default();
        table
            .set(&mut config, "compression_threshold", RuleValue::Integer(512))
            .unwrap();
        table
            .set(&mut config, "log_level", RuleValue::Enum("DEBUG".into()))
            .unwrap();
        assert_eq!(config.compression.threshold, 512);
        assert_eq!(config.debug.log_level, "debug");
    }

    #[test]
    fn test_set_rejects_wrong_type() {
        let table = RuleTable::standard();
        let mut config = Config::default();
        let err = table
            .set(&mut config, "compression_enabled", RuleValue::Integer(1))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { .. }));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_set_rejects_read_only_and_out_of_range() {
        let table = RuleTable::standard();
        let mut config = Config::default();
        assert!(matches!(
            table.set(&mut config, "operator_role", RuleValue::Enum("listening".into())),
            Err(ConfigError::ReadOnly(_))
        ));
        assert!(matches!(
            table.set(&mut config, "tick_interval_ms", RuleValue::Integer(0)),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            table.set(&mut config, "log_level", RuleValue::Enum("loud".into())),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            table.get(&config, "nope"),
            Err(ConfigError::UnknownRule(_))
        ));
    }

    #[test]
    fn test_float_accepts_integer() {
        let table = RuleTable::standard();
        let mut config = Config::default();
        table
            .set(&mut config, "digging_max_throughput", RuleValue::Integer(40))
            .unwrap();
        assert_eq!(config.scheduler.digging_max_throughput, 40.0);
    }

    #[test]
    fn test_flags() {
        let table = RuleTable::standard();
        let role = table.rule("operator_role").unwrap();
        assert!(role.gettable());
        assert!(!role.settable());
        assert_eq!(role.data_type(), ConfigDataType::Enum(OperatorRole::NAMES));
        assert!(table.rule("log_level").unwrap().settable());
    }
}
