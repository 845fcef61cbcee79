//! Provisio Engine Library
//!
//! This library provides the core functionality of the Provisio engine:
//! importing signed provider packages and running providers safely.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Package signing and binary encryption module
pub mod crypto;

/// Provider package (CBP) codec
pub mod package;

/// Provider configuration schemas
pub mod schema;

/// Watermark validation and audit log
pub mod audit;

/// Process isolation for provider binaries
pub mod sandbox;

/// Provider process execution
pub mod executor;

/// Job log fan-out
pub mod log_bus;

/// Plan/probe/apply/verify state machine
pub mod orchestrator;

/// Provider import and registry
pub mod plugins;

/// Logging setup
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

/// Platform-specific utilities module
pub mod platform;
