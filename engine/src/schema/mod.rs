//! Provider configuration schemas
//!
//! A provider package may ship `meta/schema.json` describing the parameters
//! its `plan` and `apply` verbs accept. The orchestrator checks a
//! configuration against the schema once, before any provider process runs.

use regex::Regex;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Configuration schema published by a provider
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderSchema {
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

/// A single configuration parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ParameterType,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,

    /// Selectable values for UI rendering
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ParameterOption>,
}

/// JSON types a parameter may take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => as_integer(value).is_some(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
        }
    }
}

/// Validation rules for a parameter
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

/// A selectable option for enum-like parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterOption {
    pub value: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Schema errors
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to parse schema: {0}")]
    Parse(String),

    #[error("required parameter '{0}' is missing")]
    MissingRequired(String),

    #[error("parameter '{name}': expected {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("parameter '{name}': {reason}")]
    Constraint { name: String, reason: String },

    #[error("parameter '{name}': invalid pattern: {reason}")]
    InvalidPattern { name: String, reason: String },
}

impl From<SchemaError> for EngineError {
    fn from(err: SchemaError) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}

impl ProviderSchema {
    /// Parse a schema from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, SchemaError> {
        serde_json::from_slice(bytes).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    /// Validate a configuration object against the schema
    ///
    /// Returns the first violation found, in parameter declaration order.
    /// Keys the schema does not declare are allowed.
    pub fn validate_config(&self, config: &Map<String, Value>) -> Result<(), SchemaError> {
        for param in &self.parameters {
            let Some(value) = config.get(&param.name) else {
                if param.required {
                    return Err(SchemaError::MissingRequired(param.name.clone()));
                }
                continue;
            };

            if !param.kind.matches(value) {
                return Err(SchemaError::TypeMismatch {
                    name: param.name.clone(),
                    expected: param.kind.as_str(),
                    found: json_type_name(value),
                });
            }

            if let Some(constraints) = &param.constraints {
                check_constraints(&param.name, constraints, value)?;
            }
        }

        Ok(())
    }

    /// Build a configuration from parameter defaults
    pub fn default_config(&self) -> Map<String, Value> {
        self.parameters
            .iter()
            .filter_map(|p| p.default.clone().map(|d| (p.name.clone(), d)))
            .collect()
    }
}

fn check_constraints(name: &str, c: &Constraints, value: &Value) -> Result<(), SchemaError> {
    let violation = |reason: String| SchemaError::Constraint {
        name: name.to_string(),
        reason,
    };

    if let Some(s) = value.as_str() {
        let len = s.chars().count();
        if let Some(min) = c.min_length {
            if len < min {
                return Err(violation(format!(
                    "string length {} is less than minimum {}",
                    len, min
                )));
            }
        }
        if let Some(max) = c.max_length {
            if len > max {
                return Err(violation(format!(
                    "string length {} exceeds maximum {}",
                    len, max
                )));
            }
        }
        if let Some(pattern) = &c.pattern {
            let re = Regex::new(pattern).map_err(|e| SchemaError::InvalidPattern {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            if !re.is_match(s) {
                return Err(violation(format!(
                    "value '{}' does not match pattern '{}'",
                    s, pattern
                )));
            }
        }
        if !c.allowed.is_empty() && !c.allowed.iter().any(|a| a == s) {
            return Err(violation(format!(
                "value '{}' not in allowed values: {:?}",
                s, c.allowed
            )));
        }
    }

    if let Some(n) = as_integer(value) {
        if let Some(min) = c.min {
            if n < min {
                return Err(violation(format!("value {} is less than minimum {}", n, min)));
            }
        }
        if let Some(max) = c.max {
            if n > max {
                return Err(violation(format!("value {} exceeds maximum {}", n, max)));
            }
        }
    }

    Ok(())
}

/// Integer view of a JSON number; floats qualify only when integral
fn as_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Some(f as i64)
        }
        _ => None,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
