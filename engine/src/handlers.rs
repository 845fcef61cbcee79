//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - import / list / show / remove: Manage installed providers
//! - exec: Run one provider verb
//! - run: Converge a provider to a desired state
//! - pack / extract / schema-defaults: Package tooling
//! - keygen: Create key material
//! - violations: Show the watermark audit log

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::audit::{AuditLog, WatermarkValidator, WatermarkViolation};
use crate::config::Config;
use crate::crypto::{
    generate_master_key_hex, generate_signing_key, sign_package_data, signing_key_from_pem,
    signing_key_to_pem, verifying_key_to_pem, DrmEngine, VerifyingKey,
};
use crate::log_bus::{JobLogBus, LogSink};
use crate::package;
use crate::plugins::{PluginManager, ProviderInfo};
use crate::schema::ProviderSchema;
use sdk::manifest::{Manifest, Watermark};
use sdk::protocol::{DesiredConfig, Verb};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_provider_line(info: &ProviderInfo) {
    let flag = if info.is_flagged() { "  [watermark]" } else { "" };
    println!("  {:<24} {:<12} {}{}", info.id, info.version, info.name, flag);
}

/// Import a provider package
pub fn handle_import(package_path: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    let manager = PluginManager::from_config(config).context("Failed to open provider store")?;
    let info = manager
        .import(package_path)
        .with_context(|| format!("Failed to import {}", package_path.display()))?;

    match format {
        OutputFormat::Text => {
            println!("Imported {} {} ({})", info.id, info.version, info.name);
            println!("  Path:     {}", info.path.display());
            println!("  Checksum: {}", info.checksum);
            if let Some(violation) = &info.violation {
                println!(
                    "  Warning:  watermark license {} does not match {} ({:?})",
                    violation.actual_license_id, violation.expected_license_id, violation.severity
                );
            }
        }
        OutputFormat::Json => print_json(&info)?,
    }

    Ok(())
}

/// List installed providers
pub fn handle_list(config: &Config, format: OutputFormat) -> Result<()> {
    let manager = PluginManager::from_config(config).context("Failed to open provider store")?;
    let providers = manager.list();

    match format {
        OutputFormat::Text => {
            if providers.is_empty() {
                println!("No providers installed");
                return Ok(());
            }

            println!("Installed Providers:");
            println!();
            for info in &providers {
                print_provider_line(info);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "providers": providers,
                "count": providers.len(),
            });
            print_json(&output)?;
        }
    }

    Ok(())
}

/// Show one provider with its recorded violations
pub fn handle_show(id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let manager = PluginManager::from_config(config).context("Failed to open provider store")?;
    let info = manager.get(id)?;
    let violations = manager.violations_for(id)?;

    match format {
        OutputFormat::Text => {
            println!("Provider: {}", info.id);
            println!("  Name:      {}", info.name);
            println!("  Version:   {}", info.version);
            if !info.vendor.is_empty() {
                println!("  Vendor:    {}", info.vendor);
            }
            if !info.model.is_empty() {
                println!("  Model:     {}", info.model);
            }
            if let Some(manifest) = &info.manifest {
                if !manifest.supported_hardware.is_empty() {
                    println!("  Hardware:  {}", manifest.supported_hardware.join(", "));
                }
            }
            println!("  Path:      {}", info.path.display());
            println!("  Checksum:  {}", info.checksum);
            println!(
                "  Installed: {}",
                info.installed_at.format("%Y-%m-%d %H:%M:%S")
            );
            if let Some(schema) = &info.schema {
                println!("  Schema:    {} parameters", schema.parameters.len());
            }
            if !violations.is_empty() {
                println!("  Violations: {}", violations.len());
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "provider": info,
                "violations": violations,
            });
            print_json(&output)?;
        }
    }

    Ok(())
}

/// Remove an installed provider
pub fn handle_remove(id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let manager = PluginManager::from_config(config).context("Failed to open provider store")?;
    let info = manager.delete(id)?;

    match format {
        OutputFormat::Text => println!("Removed {} {}", info.id, info.version),
        OutputFormat::Json => print_json(&json!({ "removed": info.id }))?,
    }

    Ok(())
}

fn read_desired_config(path: &Path) -> Result<DesiredConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(DesiredConfig::from_json(&text)?)
}

/// Run a single provider verb
pub async fn handle_exec(
    id: &str,
    verb: Verb,
    input: Option<&Path>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let manager = PluginManager::from_config(config).context("Failed to open provider store")?;
    let executor = manager.create_executor(id)?;

    let desired = input.map(read_desired_config).transpose()?;
    let result = executor.execute(verb, desired.as_ref()).await?;

    match format {
        OutputFormat::Text => {
            println!(
                "{} {}: {} (exit {}, {}ms)",
                id,
                verb,
                String::from(result.status.clone()),
                result.exit_code,
                result.duration.as_millis()
            );
            for entry in &result.logs {
                println!("  [{}] {}: {}", entry.level, entry.component, entry.msg);
            }
            println!("{}", serde_json::to_string_pretty(&result.data)?);
        }
        OutputFormat::Json => print_json(&result)?,
    }

    if !result.is_success() {
        bail!("{} {} failed: {}", id, verb, result.failure_reason());
    }
    Ok(())
}

/// Converge a provider to the desired state in `input`
pub async fn handle_run(
    id: &str,
    input: &Path,
    job_id: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let manager = PluginManager::from_config(config).context("Failed to open provider store")?;
    let desired = read_desired_config(input)?;
    let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let bus = Arc::new(JobLogBus::new());
    let mut lines = bus.subscribe(&job_id);
    let printer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if matches!(format, OutputFormat::Text) {
                eprintln!("[{}] {}", line.level, line.message);
            }
        }
    });

    let sink: Arc<dyn LogSink> = Arc::clone(&bus) as Arc<dyn LogSink>;
    let orchestrator = manager
        .create_orchestrator(id)?
        .with_log_sink(sink, job_id.clone());
    let outcome = orchestrator.apply_with_plan(&desired).await;

    // Dropping the job's senders ends the printer
    drop(orchestrator);
    bus.clear(&job_id);
    let _ = printer.await;

    let result = outcome?;

    match format {
        OutputFormat::Text => {
            println!("Job {}: {}", job_id, result.message);
            for step in &result.steps {
                let status = if step.success { "ok" } else { "failed" };
                println!(
                    "  {:<8} {:<7} {}ms",
                    step.name.as_str(),
                    status,
                    step.duration.as_millis()
                );
                if let Some(error) = &step.error {
                    println!("           {}", error);
                }
            }
        }
        OutputFormat::Json => print_json(&result)?,
    }

    if !result.success {
        bail!("{}", result.message);
    }
    Ok(())
}

/// Build a signed, encrypted provider package
pub struct PackRequest<'a> {
    pub manifest: &'a Path,
    pub watermark: &'a Path,
    pub binary: &'a Path,
    pub signing_key: &'a Path,
    pub schema: Option<&'a Path>,
    pub output: &'a Path,
}

pub fn handle_pack(request: PackRequest<'_>, config: &Config, format: OutputFormat) -> Result<()> {
    let manifest: Manifest = serde_json::from_slice(
        &fs::read(request.manifest).context("Failed to read manifest")?,
    )
    .context("Invalid manifest")?;
    let watermark: Watermark = serde_json::from_slice(
        &fs::read(request.watermark).context("Failed to read watermark")?,
    )
    .context("Invalid watermark")?;
    let schema = match request.schema {
        Some(path) => Some(
            ProviderSchema::from_json_bytes(&fs::read(path).context("Failed to read schema")?)
                .context("Invalid schema")?,
        ),
        None => None,
    };

    let signing_key = signing_key_from_pem(
        &fs::read_to_string(request.signing_key).context("Failed to read signing key")?,
    )?;
    let drm = DrmEngine::from_key_files(
        &config.security.master_key_file,
        &config.security.publisher_key_file,
    )?;
    if VerifyingKey::from(&signing_key) != *drm.publisher_key() {
        tracing::warn!("Signing key does not match the configured publisher key");
    }

    let binary = fs::read(request.binary).context("Failed to read provider binary")?;
    let encrypted = drm.encrypt_with_master_key(&binary)?;

    let manifest_bytes = manifest.to_json_bytes()?;
    let signature = sign_package_data(
        &package::signed_payload(&manifest_bytes, &encrypted),
        &signing_key,
    )?;

    package::create_with_schema(
        &manifest,
        &watermark,
        schema.as_ref(),
        &encrypted,
        signature.as_bytes(),
        request.output,
    )?;

    match format {
        OutputFormat::Text => println!("Wrote {}", request.output.display()),
        OutputFormat::Json => print_json(&json!({
            "package": request.output,
            "id": manifest.id,
            "version": manifest.version,
        }))?,
    }

    Ok(())
}

/// Unpack a package into `dest`
pub fn handle_extract(package_path: &Path, dest: &Path, format: OutputFormat) -> Result<()> {
    let written = package::extract(package_path, dest)?;

    match format {
        OutputFormat::Text => {
            for path in &written {
                println!("{}", path.display());
            }
        }
        OutputFormat::Json => print_json(&json!({ "files": written }))?,
    }

    Ok(())
}

fn write_key_file(path: &Path, contents: &str, mode: u32, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Generate a master key and a publisher key pair in `dir`
pub fn handle_keygen(dir: &Path, force: bool, format: OutputFormat) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let master_path = dir.join("master.key");
    let signing_path = dir.join("publisher-signing.pem");
    let public_path = dir.join("publisher.pem");

    let master = generate_master_key_hex();
    let signing_key = generate_signing_key();
    let signing_pem = signing_key_to_pem(&signing_key)?;
    let public_pem = verifying_key_to_pem(&VerifyingKey::from(&signing_key))?;

    write_key_file(&master_path, &format!("{}\n", master.as_str()), 0o600, force)?;
    write_key_file(&signing_path, &signing_pem, 0o600, force)?;
    write_key_file(&public_path, &public_pem, 0o644, force)?;

    match format {
        OutputFormat::Text => {
            println!("Master key:      {}", master_path.display());
            println!("Signing key:     {}", signing_path.display());
            println!("Publisher key:   {}", public_path.display());
        }
        OutputFormat::Json => print_json(&json!({
            "master_key_file": master_path,
            "signing_key_file": signing_path,
            "publisher_key_file": public_path,
        }))?,
    }

    Ok(())
}

/// Show recorded watermark violations
pub fn handle_violations(active_only: bool, config: &Config, format: OutputFormat) -> Result<()> {
    let validator = WatermarkValidator::new(
        config.license.license_id.clone(),
        AuditLog::new(config.audit_log_path()),
    );
    let violations: Vec<WatermarkViolation> = if active_only {
        validator.get_active_violations()?
    } else {
        validator.get_violations()?
    };

    match format {
        OutputFormat::Text => {
            if violations.is_empty() {
                println!("No watermark violations recorded");
                return Ok(());
            }

            for v in &violations {
                println!(
                    "{} {:?} {} ({}): license {} downloaded by {}",
                    v.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    v.severity,
                    v.provider_id,
                    v.provider_name,
                    v.actual_license_id,
                    v.actual_downloader_id
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "violations": violations,
                "count": violations.len(),
            });
            print_json(&output)?;
        }
    }

    Ok(())
}

/// Print the defaults a package's schema declares
pub fn handle_schema_defaults(package_path: &Path) -> Result<()> {
    let package = package::parse(package_path)?;
    let Some(schema) = package.schema else {
        bail!("{} carries no configuration schema", package_path.display());
    };

    print_json(&schema.default_config())
}
