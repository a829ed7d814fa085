//! Rule and engine configuration
//!
//! The on-disk format is YAML. Rule definitions use a closed schema:
//! unknown fields and unknown operators are rejected at load time instead
//! of being silently ignored, so a typo in a rule never disarms it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Environment variable that overrides the config file path.
pub const CONFIG_PATH_ENV: &str = "VIGIL_CONFIG";

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URL of the Prometheus-compatible backend
    pub prometheus_url: String,

    /// Polling interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Per-cycle query deadline (must be shorter than the interval)
    pub deadline: Option<String>,

    /// Maximum number of concurrent backend queries per cycle
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Outbound notification target
    pub notify: Option<NotifyConfig>,

    /// Threshold rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    /// Webhook URL that receives fire/resolve events as JSON
    pub webhook: String,
}

/// A single threshold rule as written in the config file.
///
/// Durations are strings in the `30s` / `5m` / `1h` format. They are parsed
/// eagerly when a generation is published, never at evaluation time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Stable rule identity, unique within a generation
    pub name: String,

    /// Opaque query expression passed to the backend
    pub query: String,

    /// Comparison operator applied to the sampled value
    pub op: CmpOp,

    /// Threshold the sampled value is compared against
    pub threshold: f64,

    /// Minimum time a breach must persist before firing
    #[serde(rename = "for", default = "default_for")]
    pub for_: String,

    /// Whether an empty query result counts as a breach
    #[serde(default)]
    pub no_data_breaches: bool,

    /// Re-notification interval while continuously firing (off by default)
    pub renotify: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    /// Message template; `{rule}`, `{value}`, `{threshold}` and `{op}` are substituted
    pub message: Option<String>,
}

fn default_interval() -> u64 {
    30
}

fn default_max_in_flight() -> usize {
    8
}

fn default_for() -> String {
    String::from("5m")
}

/// Comparison operators for threshold rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CmpOp {
    /// Whether `value <op> threshold` holds, with standard float semantics.
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            CmpOp::Gt => value > threshold,
            CmpOp::Ge => value >= threshold,
            CmpOp::Lt => value < threshold,
            CmpOp::Le => value <= threshold,
            CmpOp::Eq => value == threshold,
            CmpOp::Ne => value != threshold,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        };
        write!(f, "{symbol}")
    }
}

/// Notification priority carried into fire events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A validated, immutable rule inside a published generation.
///
/// Built from [`RuleConfig`] by [`compile_rules`]; never mutated afterwards.
/// A config reload produces an entirely new set of these.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub query: String,
    pub op: CmpOp,
    pub threshold: f64,
    pub for_duration: TimeDelta,
    pub no_data_breaches: bool,
    pub renotify: Option<TimeDelta>,
    pub priority: Priority,
    pub message: Option<String>,
}

/// Errors produced when validating a rule set for publication.
#[derive(Debug)]
pub enum ConfigError {
    /// Two rules share the same name
    DuplicateRule(String),

    /// Rule name is empty
    EmptyName,

    /// Query expression is empty
    EmptyQuery(String),

    /// Threshold is NaN or infinite
    InvalidThreshold { rule: String, value: f64 },

    /// A duration field could not be parsed
    InvalidDuration {
        rule: String,
        field: &'static str,
        reason: String,
    },

    /// Engine timing settings are inconsistent
    InvalidSchedule(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::DuplicateRule(name) => write!(f, "duplicate rule name `{name}`"),
            ConfigError::EmptyName => write!(f, "rule with empty name"),
            ConfigError::EmptyQuery(rule) => write!(f, "rule `{rule}` has an empty query"),
            ConfigError::InvalidThreshold { rule, value } => {
                write!(f, "rule `{rule}` has a non-finite threshold ({value})")
            }
            ConfigError::InvalidDuration { rule, field, reason } => {
                write!(f, "rule `{rule}` has an invalid `{field}` duration: {reason}")
            }
            ConfigError::InvalidSchedule(msg) => write!(f, "invalid schedule: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse durations in the `90s` / `5m` / `2h` format. Bare numbers are seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let (digits, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => input.split_at(idx),
        None => (input, "s"),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("`{input}` has no numeric part"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        other => Err(format!("unknown duration unit `{other}`")),
    }
}

fn compile_delta(
    rule: &str,
    field: &'static str,
    input: &str,
) -> Result<TimeDelta, ConfigError> {
    let std = parse_duration(input).map_err(|reason| ConfigError::InvalidDuration {
        rule: rule.to_string(),
        field,
        reason,
    })?;
    TimeDelta::from_std(std).map_err(|e| ConfigError::InvalidDuration {
        rule: rule.to_string(),
        field,
        reason: e.to_string(),
    })
}

/// Validate and compile a raw rule list into immutable [`Rule`]s.
///
/// Performed once per reload so the evaluation path never parses anything.
pub fn compile_rules(rules: &[RuleConfig]) -> Result<Vec<Rule>, ConfigError> {
    let mut compiled = Vec::with_capacity(rules.len());
    let mut seen = std::collections::HashSet::new();

    for raw in rules {
        if raw.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if !seen.insert(raw.name.clone()) {
            return Err(ConfigError::DuplicateRule(raw.name.clone()));
        }
        if raw.query.trim().is_empty() {
            return Err(ConfigError::EmptyQuery(raw.name.clone()));
        }
        if !raw.threshold.is_finite() {
            return Err(ConfigError::InvalidThreshold {
                rule: raw.name.clone(),
                value: raw.threshold,
            });
        }

        let for_duration = compile_delta(&raw.name, "for", &raw.for_)?;
        let renotify = raw
            .renotify
            .as_deref()
            .map(|r| compile_delta(&raw.name, "renotify", r))
            .transpose()?;

        compiled.push(Rule {
            name: raw.name.clone(),
            query: raw.query.clone(),
            op: raw.op,
            threshold: raw.threshold,
            for_duration,
            no_data_breaches: raw.no_data_breaches,
            renotify,
            priority: raw.priority,
            message: raw.message.clone(),
        });
    }

    Ok(compiled)
}

/// Timing and concurrency settings derived from the config file.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Fixed polling interval
    pub tick: Duration,

    /// Per-cycle query deadline, strictly shorter than `tick`
    pub deadline: Duration,

    /// Worker-pool ceiling for concurrent backend queries
    pub max_in_flight: usize,

    /// Grace period for in-flight work on shutdown
    pub grace: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        if config.interval == 0 {
            return Err(ConfigError::InvalidSchedule(
                "interval must be at least 1 second".to_string(),
            ));
        }
        if config.max_in_flight == 0 {
            return Err(ConfigError::InvalidSchedule(
                "max_in_flight must be at least 1".to_string(),
            ));
        }

        let tick = Duration::from_secs(config.interval);

        let deadline = match config.deadline.as_deref() {
            Some(raw) => parse_duration(raw)
                .map_err(ConfigError::InvalidSchedule)?,
            // leave headroom before the next tick
            None => tick.mul_f64(0.75),
        };

        if deadline >= tick {
            return Err(ConfigError::InvalidSchedule(format!(
                "deadline ({deadline:?}) must be shorter than the interval ({tick:?})"
            )));
        }

        Ok(Self {
            tick,
            deadline,
            max_in_flight: config.max_in_flight,
            grace: Duration::from_secs(5),
        })
    }
}

/// Resolve the config path: `VIGIL_CONFIG` wins over the CLI argument.
pub fn resolve_config_path(cli_path: Option<&str>) -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(env_path));
    }
    match cli_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => anyhow::bail!("no config file given (use --config or {CONFIG_PATH_ENV})"),
    }
}

pub fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_yml::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("invalid configuration file: {e}"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}
