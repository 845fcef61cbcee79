//! Configuration management
//!
//! This module handles loading, validation, and management of the Provisio configuration.
//! Configuration is stored in TOML format at ~/.provisio/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory and log level
//! - **license**: License id of this installation
//! - **security**: Key files and watermark policy
//! - **executor**: Provider timeout and sandbox switch
//! - **sandbox**: Isolation backend and resource ceilings
//! - **orchestrator**: Convergence policy
//!
//! # Path Expansion
//!
//! `~` is expanded to the user's home directory in every path setting, and
//! the data directory is created if it does not exist.
//!
//! # Examples
//!
//! ```no_run
//! use provisio_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Providers stored in {:?}", config.store_dir());
//! # Ok(())
//! # }
//! ```

use crate::orchestrator::ConvergencePolicy;
use crate::plugins::WatermarkPolicy;
use crate::sandbox::SandboxConfig;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// License of this installation
    pub license: LicenseConfig,

    /// Keys and provenance policy
    #[serde(default)]
    pub security: SecurityConfig,

    /// Provider execution settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Sandbox settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Orchestration settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// License configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    /// Compared against the `license_id` in every package watermark
    pub license_id: String,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Hex-encoded 256-bit master key (overridden by PROVISIO_MASTER_KEY)
    #[serde(default = "default_master_key_file")]
    pub master_key_file: PathBuf,

    /// SPKI PEM public key of the provider publisher
    #[serde(default = "default_publisher_key_file")]
    pub publisher_key_file: PathBuf,

    /// What to do when a watermark does not match this license
    #[serde(default)]
    pub watermark_policy: WatermarkPolicy,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Wall-clock limit for one provider invocation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Run providers inside the sandbox
    #[serde(default = "default_true")]
    pub sandbox_enabled: bool,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub convergence: ConvergencePolicy,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.provisio")
}

fn default_master_key_file() -> PathBuf {
    PathBuf::from("~/.provisio/keys/master.key")
}

fn default_publisher_key_file() -> PathBuf {
    PathBuf::from("~/.provisio/keys/publisher.pem")
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_license_id() -> String {
    "unlicensed".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            master_key_file: default_master_key_file(),
            publisher_key_file: default_publisher_key_file(),
            watermark_policy: WatermarkPolicy::default(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            sandbox_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.provisio/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;
        Self::load_or_create_at(&config_path)
    }

    /// Load configuration from `path`, writing defaults there if absent
    pub fn load_or_create_at(path: &Path) -> Result<Self, EngineError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Self::create_default(path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default_config();

        // The file keeps the unexpanded `~` paths
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Created default configuration at {}", path.display());

        let mut config = config;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.provisio/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".provisio").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig::default(),
            license: LicenseConfig {
                license_id: default_license_id(),
            },
            security: SecurityConfig::default(),
            executor: ExecutorConfig::default(),
            sandbox: SandboxConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }

    /// Directory holding decrypted provider binaries and their metadata
    pub fn store_dir(&self) -> PathBuf {
        self.core.data_dir.join("providers")
    }

    /// Append-only watermark violation log
    pub fn audit_log_path(&self) -> PathBuf {
        self.core
            .data_dir
            .join("audit")
            .join("watermark_violations.log")
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs)
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates enumerated and numeric fields
    /// - Expands ~ in paths
    /// - Creates the data directory if it doesn't exist
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.license.license_id.trim().is_empty() {
            return Err(EngineError::Config(
                "license_id must not be empty".to_string(),
            ));
        }

        if self.executor.timeout_secs == 0 {
            return Err(EngineError::Config(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }

        if !(1..=100).contains(&self.sandbox.max_cpu_percent) {
            return Err(EngineError::Config(
                "max_cpu_percent must be between 1 and 100".to_string(),
            ));
        }
        if self.sandbox.max_memory_mb == 0 {
            return Err(EngineError::Config(
                "max_memory_mb must be greater than 0".to_string(),
            ));
        }
        if self.sandbox.max_processes == 0 {
            return Err(EngineError::Config(
                "max_processes must be greater than 0".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.security.master_key_file = expand_path(&self.security.master_key_file)?;
        self.security.publisher_key_file = expand_path(&self.security.publisher_key_file)?;
        self.sandbox.work_dir = expand_path(&self.sandbox.work_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
///
/// # Examples
///
/// ```ignore
/// let path = PathBuf::from("~/.provisio");
/// let expanded = expand_path(&path)?;
/// // expanded is now /home/user/.provisio (on Unix)
/// ```
pub fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxBackend;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.executor.timeout_secs, 300);
        assert!(config.executor.sandbox_enabled);
        assert_eq!(config.security.watermark_policy, WatermarkPolicy::Flag);
        assert_eq!(config.orchestrator.convergence, ConvergencePolicy::DriveSet);
        assert_eq!(config.sandbox.backend, SandboxBackend::Auto);
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(config.sandbox, deserialized.sandbox);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [license]
            license_id = "lic-1"

            [security]
            watermark_policy = "reject"

            [orchestrator]
            convergence = "drive_count"
            "#,
        )
        .unwrap();

        assert_eq!(config.license.license_id, "lic-1");
        assert_eq!(config.security.watermark_policy, WatermarkPolicy::Reject);
        assert_eq!(config.orchestrator.convergence, ConvergencePolicy::DriveCount);
        assert_eq!(config.sandbox.max_processes, 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases: Vec<fn(&mut Config)> = vec![
            |c| c.core.log_level = "verbose".to_string(),
            |c| c.license.license_id = "  ".to_string(),
            |c| c.executor.timeout_secs = 0,
            |c| c.sandbox.max_cpu_percent = 0,
            |c| c.sandbox.max_cpu_percent = 101,
            |c| c.sandbox.max_memory_mb = 0,
            |c| c.sandbox.max_processes = 0,
        ];

        for mutate in cases {
            let mut config = Config::default_config();
            mutate(&mut config);
            assert!(matches!(
                config.validate_and_process(),
                Err(EngineError::Config(_))
            ));
        }
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default_config();
        config.core.data_dir = PathBuf::from("/var/lib/provisio");
        assert_eq!(config.store_dir(), PathBuf::from("/var/lib/provisio/providers"));
        assert_eq!(
            config.audit_log_path(),
            PathBuf::from("/var/lib/provisio/audit/watermark_violations.log")
        );
        assert_eq!(config.executor_timeout(), Duration::from_secs(300));
    }
}
