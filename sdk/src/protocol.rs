//! Provider subprocess protocol
//!
//! A provider is an executable invoked as `<binary> <verb>`:
//!
//! - `plan` and `apply` receive one JSON object on standard input; `probe`
//!   receives nothing.
//! - Standard output carries exactly one JSON object `{"status", "data"}`.
//! - Standard error carries newline-delimited JSON log records
//!   `{"ts", "level", "component", "msg"}`. Lines that are not JSON are kept
//!   verbatim as `INFO` records from component `"provider"`.
//! - Exit code 0 is expected on success.

use crate::errors::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Component name given to stderr lines that are not JSON log records
pub const RAW_LOG_COMPONENT: &str = "provider";

/// Key under which a probe reports existing virtual drives
pub const VIRTUAL_DRIVES_KEY: &str = "virtual_drives";

/// Provider verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Report current hardware state
    Probe,
    /// Describe the change needed to reach the desired state
    Plan,
    /// Perform the change
    Apply,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Probe => "probe",
            Verb::Plan => "plan",
            Verb::Apply => "apply",
        }
    }

    /// Whether the verb reads a configuration object from standard input
    pub fn takes_input(&self) -> bool {
        !matches!(self, Verb::Probe)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "probe" => Ok(Verb::Probe),
            "plan" => Ok(Verb::Plan),
            "apply" => Ok(Verb::Apply),
            other => Err(EngineError::UnknownVerb(other.to_string())),
        }
    }
}

/// Status reported by a provider on standard output
///
/// Anything other than `"success"` or `"failed"` is preserved as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderStatus {
    Success,
    Failed,
    /// No status was reported (empty standard output)
    #[default]
    Missing,
    Other(String),
}

impl ProviderStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ProviderStatus::Success)
    }
}

impl From<String> for ProviderStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "success" => ProviderStatus::Success,
            "failed" => ProviderStatus::Failed,
            "" => ProviderStatus::Missing,
            _ => ProviderStatus::Other(value),
        }
    }
}

impl From<ProviderStatus> for String {
    fn from(value: ProviderStatus) -> Self {
        match value {
            ProviderStatus::Success => "success".to_string(),
            ProviderStatus::Failed => "failed".to_string(),
            ProviderStatus::Missing => String::new(),
            ProviderStatus::Other(s) => s,
        }
    }
}

/// The single JSON object a provider writes to standard output
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderOutput {
    pub status: ProviderStatus,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: Map<String, Value>,
}

impl ProviderOutput {
    pub fn success(data: Map<String, Value>) -> Self {
        Self {
            status: ProviderStatus::Success,
            data,
        }
    }

    pub fn failed(data: Map<String, Value>) -> Self {
        Self {
            status: ProviderStatus::Failed,
            data,
        }
    }
}

/// Log levels used on the provider's standard error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[serde(alias = "debug")]
    Debug,
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "warn", alias = "WARNING")]
    Warn,
    #[serde(alias = "error")]
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One structured log record from a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub component: String,
    pub msg: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            component: component.into(),
            msg: msg.into(),
        }
    }

    /// Wrap a stderr line that is not a JSON log record
    pub fn raw(line: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, RAW_LOG_COMPONENT, line)
    }

    /// Parse a single stderr line, falling back to a raw `INFO` record
    pub fn parse_line(line: &str) -> Self {
        serde_json::from_str(line).unwrap_or_else(|_| Self::raw(line))
    }
}

/// Parse a provider's captured standard error into log records
///
/// Blank lines are dropped; every other line yields exactly one record.
pub fn parse_log_lines(stderr: &str) -> Vec<LogEntry> {
    stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(LogEntry::parse_line)
        .collect()
}

/// Configuration object handed to `plan` and `apply`
///
/// `desired_state` is the part the engine itself interprets for convergence.
/// Every other top-level key is passed through to the provider untouched and
/// is subject to the provider's schema, if it ships one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<DesiredState>,

    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl DesiredConfig {
    pub fn new(desired_state: DesiredState) -> Self {
        Self {
            desired_state: Some(desired_state),
            parameters: Map::new(),
        }
    }

    /// Add a pass-through parameter
    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Parse a configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    /// The configuration as a JSON object, as the provider will see it
    pub fn to_object(&self) -> Result<Map<String, Value>, EngineError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(EngineError::InvalidConfig(
                "configuration must be a JSON object".to_string(),
            )),
            Err(e) => Err(EngineError::InvalidConfig(e.to_string())),
        }
    }
}

/// Declared target state of a storage resource
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub level: Option<String>,

    /// Drive identifiers; strings and other scalars are both accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drives: Option<Vec<Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DesiredState {
    pub fn new<I, S>(level: impl Into<String>, drives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            level: Some(level.into()),
            drives: Some(
                drives
                    .into_iter()
                    .map(|d| Value::String(d.into()))
                    .collect(),
            ),
            extra: Map::new(),
        }
    }

    /// Drive identifiers in canonical string form
    ///
    /// Strings are taken as-is; any other JSON value uses its JSON text.
    pub fn drive_ids(&self) -> Vec<String> {
        self.drives
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(canonical_id)
            .collect()
    }
}

/// Canonical string form of a JSON scalar used as an identifier
pub fn canonical_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_verb_parsing() {
        assert_eq!("probe".parse::<Verb>().unwrap(), Verb::Probe);
        assert_eq!("apply".parse::<Verb>().unwrap(), Verb::Apply);
        assert!(matches!(
            "invalid".parse::<Verb>(),
            Err(EngineError::UnknownVerb(_))
        ));
        assert!(!Verb::Probe.takes_input());
        assert!(Verb::Plan.takes_input());
    }

    #[test]
    fn test_provider_output_statuses() {
        let out: ProviderOutput =
            serde_json::from_str(r#"{"status":"success","data":{"vd_id":"vd_1"}}"#).unwrap();
        assert!(out.status.is_success());
        assert_eq!(out.data["vd_id"], "vd_1");

        let out: ProviderOutput = serde_json::from_str(r#"{"status":"failed"}"#).unwrap();
        assert_eq!(out.status, ProviderStatus::Failed);
        assert!(out.data.is_empty());

        let out: ProviderOutput =
            serde_json::from_str(r#"{"status":"pending","data":null}"#).unwrap();
        assert_eq!(out.status, ProviderStatus::Other("pending".to_string()));
        assert!(!out.status.is_success());
    }

    #[test]
    fn test_parse_log_lines_keeps_raw_lines() {
        let stderr = concat!(
            r#"{"ts":"2024-01-01T00:00:00Z","level":"INFO","component":"raid","msg":"probing"}"#,
            "\n",
            "segfault in libstorelib\n",
            "\n",
            r#"{"ts":"2024-01-01T00:00:01Z","level":"ERROR","component":"raid","msg":"controller busy"}"#,
            "\n"
        );

        let logs = parse_log_lines(stderr);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].component, "raid");
        assert_eq!(logs[1].level, LogLevel::Info);
        assert_eq!(logs[1].component, RAW_LOG_COMPONENT);
        assert_eq!(logs[1].msg, "segfault in libstorelib");
        assert_eq!(logs[2].level, LogLevel::Error);
    }

    #[test]
    fn test_unknown_level_is_kept_verbatim() {
        let line = r#"{"level":"TRACE","component":"x","msg":"y"}"#;
        let entry = LogEntry::parse_line(line);
        assert_eq!(entry.component, RAW_LOG_COMPONENT);
        assert_eq!(entry.msg, line);
    }

    #[test]
    fn test_desired_config_mixed_drives() {
        let config = DesiredConfig::from_json(
            r#"{"desired_state":{"level":10,"drives":["d1",2,"d3"]},"controller":"c0"}"#,
        )
        .unwrap();

        let state = config.desired_state.as_ref().unwrap();
        assert_eq!(state.level.as_deref(), Some("10"));
        assert_eq!(state.drive_ids(), vec!["d1", "2", "d3"]);
        assert_eq!(config.parameters["controller"], json!("c0"));

        let object = config.to_object().unwrap();
        assert!(object.contains_key("desired_state"));
        assert!(object.contains_key("controller"));
    }
}
