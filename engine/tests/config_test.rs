//! Integration tests for configuration management
//!
//! These tests verify that the Config struct can be properly loaded,
//! created with defaults, validated, and processed with path expansion.

use provisio_engine::config::Config;
use provisio_engine::orchestrator::ConvergencePolicy;
use provisio_engine::plugins::WatermarkPolicy;
use provisio_engine::sandbox::SandboxBackend;
use sdk::errors::EngineError;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_load_or_create_writes_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let config = Config::load_or_create_at(&path).unwrap();
    assert!(path.is_file());
    assert_eq!(config.license.license_id, "unlicensed");

    // The written file keeps the unexpanded home-relative paths
    let written = fs::read_to_string(&path).unwrap();
    assert!(written.contains("~/.provisio"));

    let reloaded = Config::load_or_create_at(&path).unwrap();
    assert_eq!(reloaded.core.data_dir, config.core.data_dir);
}

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        format!(
            r#"
[core]
data_dir = "{}"
log_level = "debug"

[license]
license_id = "lic-acme-001"

[security]
master_key_file = "/etc/provisio/master.key"
publisher_key_file = "/etc/provisio/publisher.pem"
watermark_policy = "reject"

[executor]
timeout_secs = 60
sandbox_enabled = false

[sandbox]
backend = "relaxed"
work_dir = "/srv/provisio/runtime"
max_memory_mb = 256
max_cpu_percent = 25
max_processes = 4
network_isolation = false

[orchestrator]
convergence = "drive_count"
"#,
            data_dir.display()
        ),
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert!(data_dir.is_dir());
    assert_eq!(config.store_dir(), data_dir.join("providers"));
    assert_eq!(
        config.audit_log_path(),
        data_dir.join("audit").join("watermark_violations.log")
    );
    assert_eq!(config.security.watermark_policy, WatermarkPolicy::Reject);
    assert_eq!(config.executor.timeout_secs, 60);
    assert!(!config.executor.sandbox_enabled);
    assert_eq!(config.sandbox.backend, SandboxBackend::Relaxed);
    assert_eq!(config.sandbox.max_memory_bytes(), 256 * 1024 * 1024);
    assert!(!config.sandbox.network_isolation);
    assert_eq!(config.orchestrator.convergence, ConvergencePolicy::DriveCount);
}

#[test]
fn test_missing_license_section_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[core]\nlog_level = \"info\"\n").unwrap();

    assert!(matches!(
        Config::load_from_path(&path),
        Err(EngineError::Config(msg)) if msg.contains("parse")
    ));
}

#[test]
fn test_invalid_values_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    for body in [
        "[license]\nlicense_id = \"\"\n",
        "[license]\nlicense_id = \"x\"\n[executor]\ntimeout_secs = 0\n",
        "[license]\nlicense_id = \"x\"\n[sandbox]\nmax_cpu_percent = 150\n",
        "[license]\nlicense_id = \"x\"\n[sandbox]\nbackend = \"chroot\"\n",
        "[license]\nlicense_id = \"x\"\n[core]\nlog_level = \"loud\"\n",
    ] {
        fs::write(&path, body).unwrap();
        assert!(
            Config::load_from_path(&path).is_err(),
            "accepted:\n{}",
            body
        );
    }
}
