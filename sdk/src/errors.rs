//! Error types and handling
//!
//! This module provides the error types used throughout the Provisio engine.
//! All errors implement the `ErrorExt` trait which provides user-friendly
//! hints, recoverability information, and the failure class used to decide
//! how a management layer should answer a caller.
//!
//! # Security
//!
//! Error messages never carry key material, plaintext provider bytes, or the
//! contents of a provider's standard input.

use crate::protocol::LogEntry;
use thiserror::Error;

/// Failure classes
///
/// Every `EngineError` belongs to exactly one class. Security classes
/// (`Authenticity`, `Confidentiality`, `Isolation`) are never downgraded to
/// warnings and never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Corrupt archive, missing fields, wrong key sizes, bad configuration
    MalformedInput,
    /// Signature verification failure
    Authenticity,
    /// Watermark mismatch that policy turned into a hard stop
    Provenance,
    /// Decryption failure
    Confidentiality,
    /// Sandbox setup failure
    Isolation,
    /// Spawn failure, timeout, malformed provider output
    Execution,
    /// Unknown provider id
    NotFound,
    /// Local environment trouble (unwritable store, unreadable config)
    System,
}

/// How a management layer should surface an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// The request was refused and no state changed (4xx-equivalent)
    Rejected,
    /// The provider ran and failed; the caller gets logs and an error field
    ExecutionFailed,
    /// The system could not serve the request (5xx-equivalent)
    Unavailable,
}

/// Trait for Provisio error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// secrets or internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors may be retried at the caller's discretion.
    /// Security failures are never recoverable.
    fn is_recoverable(&self) -> bool;

    /// Returns the failure class of the error
    fn category(&self) -> ErrorCategory;

    /// Returns how the error should be surfaced to an API caller
    fn disposition(&self) -> Disposition {
        match self.category() {
            ErrorCategory::MalformedInput
            | ErrorCategory::Authenticity
            | ErrorCategory::Provenance
            | ErrorCategory::Confidentiality
            | ErrorCategory::NotFound => Disposition::Rejected,
            ErrorCategory::Execution => Disposition::ExecutionFailed,
            ErrorCategory::Isolation | ErrorCategory::System => Disposition::Unavailable,
        }
    }
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Malformed input**: corrupt archives, missing fields, bad key sizes
/// - **Authenticity**: publisher signature did not verify
/// - **Confidentiality**: provider binary could not be decrypted
/// - **Isolation**: the sandbox could not be established
/// - **Execution**: the provider could not be run to completion
///
/// Execution errors carry the log lines captured before the failure so a
/// caller can show partial progress.
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorCategory, ErrorExt};
///
/// let error = EngineError::ProviderNotFound("raid-lsi".to_string());
/// assert_eq!(error.category(), ErrorCategory::NotFound);
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::SignatureInvalid;
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Package errors
    #[error("Corrupt package: {0}")]
    CorruptPackage(String),

    #[error("Missing package field: {0}")]
    MissingField(&'static str),

    // Key and signature errors
    #[error("Invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    #[error("Key material error: {0}")]
    KeyMaterial(String),

    #[error("Package signature invalid")]
    SignatureInvalid,

    #[error("Decryption failed")]
    DecryptionFailed,

    // Provenance errors
    #[error("Watermark rejected for provider {provider_id}: license {license_id} does not match")]
    WatermarkRejected {
        provider_id: String,
        license_id: String,
    },

    #[error("Audit log error: {0}")]
    AuditLog(String),

    // Registry errors
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    // Isolation errors
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    // Provider input errors
    #[error("Invalid provider configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown verb: {0}")]
    UnknownVerb(String),

    // Execution errors
    #[error("Failed to start provider for {verb}: {reason}")]
    ProviderSpawn { verb: String, reason: String },

    #[error("Provider {verb} timed out after {timeout_ms}ms")]
    ProviderTimeout {
        verb: String,
        timeout_ms: u64,
        logs: Vec<LogEntry>,
    },

    #[error("Provider {verb} produced malformed output: {reason}")]
    MalformedOutput {
        verb: String,
        reason: String,
        logs: Vec<LogEntry>,
    },

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Log lines captured from the provider before an execution failure
    ///
    /// Empty for every variant that is not an execution failure.
    pub fn partial_logs(&self) -> &[LogEntry] {
        match self {
            Self::ProviderTimeout { logs, .. } | Self::MalformedOutput { logs, .. } => logs,
            _ => &[],
        }
    }
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::CorruptPackage(_) => "The package file is damaged or not a provider package",
            Self::MissingField(_) => "The package is incomplete. Ask the publisher to rebuild it",

            Self::InvalidKeySize { .. } => "Keys must be exactly 32 bytes",
            Self::InvalidSignatureEncoding(_) => "The package signature is not in a known format",
            Self::KeyMaterial(_) => "Check the configured master key and publisher key files",
            Self::SignatureInvalid => "Security verification failed. Package may be tampered",
            Self::DecryptionFailed => "Provider could not be decrypted. Check the master key",

            Self::WatermarkRejected { .. } => "This package was licensed to another installation",
            Self::AuditLog(_) => "Audit log could not be written. Check the data directory",

            Self::ProviderNotFound(_) => "No provider with this id is installed",

            Self::Sandbox(_) => "Provider isolation could not be established",

            Self::InvalidConfig(_) => "The configuration does not match the provider schema",
            Self::UnknownVerb(_) => "Verb must be one of: probe, plan, apply",

            Self::ProviderSpawn { .. } => "Provider binary could not be started",
            Self::ProviderTimeout { .. } => "Provider took too long to respond. Try again",
            Self::MalformedOutput { .. } => "Provider returned output that could not be read",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::SignatureInvalid
            | Self::DecryptionFailed
            | Self::Sandbox(_)
            | Self::WatermarkRejected { .. }
            | Self::KeyMaterial(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::CorruptPackage(_)
            | Self::MissingField(_)
            | Self::InvalidKeySize { .. }
            | Self::InvalidSignatureEncoding(_)
            | Self::InvalidConfig(_)
            | Self::UnknownVerb(_) => ErrorCategory::MalformedInput,
            Self::SignatureInvalid => ErrorCategory::Authenticity,
            Self::WatermarkRejected { .. } => ErrorCategory::Provenance,
            Self::DecryptionFailed => ErrorCategory::Confidentiality,
            Self::Sandbox(_) => ErrorCategory::Isolation,
            Self::ProviderSpawn { .. }
            | Self::ProviderTimeout { .. }
            | Self::MalformedOutput { .. } => ErrorCategory::Execution,
            Self::ProviderNotFound(_) => ErrorCategory::NotFound,
            Self::Config(_) | Self::KeyMaterial(_) | Self::AuditLog(_) | Self::Io(_) => {
                ErrorCategory::System
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LogLevel;

    #[test]
    fn test_security_errors_are_not_recoverable() {
        assert!(!EngineError::SignatureInvalid.is_recoverable());
        assert!(!EngineError::DecryptionFailed.is_recoverable());
        assert!(!EngineError::Sandbox("unshare failed".to_string()).is_recoverable());
    }

    #[test]
    fn test_dispositions() {
        assert_eq!(
            EngineError::SignatureInvalid.disposition(),
            Disposition::Rejected
        );
        assert_eq!(
            EngineError::MissingField("manifest.id").disposition(),
            Disposition::Rejected
        );
        let timeout = EngineError::ProviderTimeout {
            verb: "apply".to_string(),
            timeout_ms: 100,
            logs: Vec::new(),
        };
        assert_eq!(timeout.disposition(), Disposition::ExecutionFailed);
        assert!(timeout.is_recoverable());

        let io = EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "store",
        ));
        assert_eq!(io.disposition(), Disposition::Unavailable);
    }

    #[test]
    fn test_partial_logs_only_on_execution_failures() {
        let logs = vec![LogEntry::new(LogLevel::Info, "raid", "initializing")];
        let err = EngineError::MalformedOutput {
            verb: "probe".to_string(),
            reason: "expected value".to_string(),
            logs,
        };
        assert_eq!(err.partial_logs().len(), 1);
        assert!(EngineError::DecryptionFailed.partial_logs().is_empty());
    }
}
