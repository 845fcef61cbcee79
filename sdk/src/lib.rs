//! Provisio SDK
//!
//! Shared library providing the provider wire protocol, package metadata
//! types, and error handling. This crate is used by both the engine and
//! provider binaries.

/// Error types and handling
pub mod errors;

/// Manifest and watermark types
pub mod manifest;

/// Provider subprocess protocol
pub mod protocol;

/// Helpers for provider binaries
pub mod provider;

// Re-export commonly used types
pub use errors::{Disposition, EngineError, ErrorCategory, ErrorExt};
pub use manifest::{Manifest, Watermark};
pub use protocol::{
    DesiredConfig, DesiredState, LogEntry, LogLevel, ProviderOutput, ProviderStatus, Verb,
};
