//! Provider plugin management
//!
//! The `PluginManager` owns the import pipeline and the registry of
//! installed providers:
//!
//! 1. Parse the package archive
//! 2. Verify the publisher signature (fail closed)
//! 3. Check the watermark against this installation's license
//! 4. Decrypt the provider with the master key
//! 5. Write the executable into the store directory
//! 6. Register it
//!
//! Nothing is written to the store unless every gate before step 5 passes.
//! The decrypted executable stays on disk in plaintext with mode 0700 for
//! as long as the provider is installed.

pub mod registry;

pub use registry::{ProviderInfo, Registry};

use crate::audit::{AuditLog, WatermarkValidator, WatermarkViolation};
use crate::config::Config;
use crate::crypto::{compute_file_hash, sha256_hex, DrmEngine};
use crate::executor::{Executor, DEFAULT_TIMEOUT};
use crate::orchestrator::{ConvergencePolicy, Orchestrator};
use crate::package;
use crate::sandbox::SandboxConfig;
use chrono::Utc;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extension of the metadata file written next to each executable
const SIDECAR_EXTENSION: &str = "json";

/// What happens to an import whose watermark does not match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkPolicy {
    /// Record the violation and install anyway
    #[default]
    Flag,
    /// Record the violation and refuse the package
    Reject,
}

/// Imports, stores and hands out providers
pub struct PluginManager {
    store_dir: PathBuf,
    drm: DrmEngine,
    validator: WatermarkValidator,
    registry: Registry,
    policy: WatermarkPolicy,
    timeout: Duration,
    sandbox: Option<SandboxConfig>,
    convergence: ConvergencePolicy,
}

impl PluginManager {
    /// Create a manager over `store_dir`, registering what is already there
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Io` if the store directory cannot be created or
    /// listed.
    pub fn new(
        store_dir: impl Into<PathBuf>,
        drm: DrmEngine,
        validator: WatermarkValidator,
    ) -> Result<Self, EngineError> {
        let store_dir = store_dir.into();
        fs::create_dir_all(&store_dir)?;

        let manager = Self {
            store_dir,
            drm,
            validator,
            registry: Registry::new(),
            policy: WatermarkPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            sandbox: None,
            convergence: ConvergencePolicy::default(),
        };
        manager.scan()?;
        Ok(manager)
    }

    /// Build a manager from the loaded configuration
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let drm = DrmEngine::from_key_files(
            &config.security.master_key_file,
            &config.security.publisher_key_file,
        )?;
        let validator = WatermarkValidator::new(
            config.license.license_id.clone(),
            AuditLog::new(config.audit_log_path()),
        );

        let mut manager = Self::new(config.store_dir(), drm, validator)?
            .with_watermark_policy(config.security.watermark_policy)
            .with_timeout(config.executor_timeout())
            .with_convergence(config.orchestrator.convergence);
        if config.executor.sandbox_enabled {
            manager = manager.with_sandbox(config.sandbox.clone());
        }
        Ok(manager)
    }

    pub fn with_watermark_policy(mut self, policy: WatermarkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Timeout given to every executor this manager creates
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sandbox every executor this manager creates
    pub fn with_sandbox(mut self, config: SandboxConfig) -> Self {
        self.sandbox = Some(config);
        self
    }

    pub fn with_convergence(mut self, policy: ConvergencePolicy) -> Self {
        self.convergence = policy;
        self
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn validator(&self) -> &WatermarkValidator {
        &self.validator
    }

    /// Import a package and register its provider
    ///
    /// Re-importing a manifest id replaces the previous executable and
    /// registry entry.
    ///
    /// # Errors
    ///
    /// - `CorruptPackage` / `MissingField` for an unreadable package or an
    ///   id that is not a plain file name
    /// - `SignatureInvalid` unless the signature verifies
    /// - `WatermarkRejected` for a mismatched watermark under the reject policy
    /// - `AuditLog` if a violation cannot be recorded
    /// - `DecryptionFailed` if the binary does not decrypt
    /// - `Io` if the store cannot be written
    pub fn import(&self, package_path: &Path) -> Result<ProviderInfo, EngineError> {
        info!("Importing provider package {}", package_path.display());

        let package = package::parse(package_path)?;
        let manifest = package.manifest.clone();
        check_provider_id(&manifest.id)?;

        match self
            .drm
            .verify_package_signature(&package.signed_payload(), &package.signature)
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("Rejected {}: signature does not verify", manifest.id);
                return Err(EngineError::SignatureInvalid);
            }
            Err(e) => {
                warn!("Rejected {}: {}", manifest.id, e);
                return Err(EngineError::SignatureInvalid);
            }
        }

        let violation =
            self.validator
                .validate(&manifest.id, &manifest.name, &package.watermark)?;
        if violation.is_some() && self.policy == WatermarkPolicy::Reject {
            return Err(EngineError::WatermarkRejected {
                provider_id: manifest.id.clone(),
                license_id: package.watermark.license_id.clone(),
            });
        }

        let plaintext = self.drm.decrypt_with_master_key(&package.encrypted_binary)?;

        let path = self.store_dir.join(&manifest.id);
        write_atomic(&self.store_dir, &path, &plaintext, 0o700)?;
        let checksum = sha256_hex(&plaintext);

        let info = ProviderInfo {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            vendor: manifest.vendor.clone(),
            model: manifest.model.clone(),
            path,
            checksum,
            manifest: Some(manifest),
            watermark: Some(package.watermark),
            violation,
            schema: package.schema,
            installed_at: Utc::now(),
        };
        self.write_sidecar(&info)?;

        if self.registry.insert(info.clone()).is_some() {
            info!("Replaced provider {} with version {}", info.id, info.version);
        } else {
            info!("Registered provider {} version {}", info.id, info.version);
        }

        Ok(info)
    }

    /// All registered providers, sorted by id
    pub fn list(&self) -> Vec<ProviderInfo> {
        self.registry.list()
    }

    pub fn get(&self, id: &str) -> Result<ProviderInfo, EngineError> {
        self.registry.get(id)
    }

    /// Unregister a provider and remove its files
    pub fn delete(&self, id: &str) -> Result<ProviderInfo, EngineError> {
        let info = self.registry.remove(id)?;
        remove_if_exists(&info.path)?;
        remove_if_exists(&self.sidecar_path(id))?;
        info!("Deleted provider {}", id);
        Ok(info)
    }

    /// Violations recorded for one provider
    pub fn violations_for(&self, id: &str) -> Result<Vec<WatermarkViolation>, EngineError> {
        Ok(self
            .validator
            .get_violations()?
            .into_iter()
            .filter(|v| v.provider_id == id)
            .collect())
    }

    /// An executor for a registered provider
    pub fn create_executor(&self, id: &str) -> Result<Executor, EngineError> {
        let info = self.registry.get(id)?;
        let mut executor = Executor::new(info.path).with_timeout(self.timeout);
        if let Some(sandbox) = &self.sandbox {
            executor = executor.with_sandbox(sandbox.clone());
        }
        Ok(executor)
    }

    /// An orchestrator for a registered provider, carrying its schema
    pub fn create_orchestrator(&self, id: &str) -> Result<Orchestrator, EngineError> {
        let info = self.registry.get(id)?;
        let executor = self.create_executor(id)?;
        let mut orchestrator =
            Orchestrator::new(Arc::new(executor)).with_convergence(self.convergence);
        if let Some(schema) = info.schema {
            orchestrator = orchestrator.with_schema(schema);
        }
        Ok(orchestrator)
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.store_dir.join(format!("{}.{}", id, SIDECAR_EXTENSION))
    }

    fn write_sidecar(&self, info: &ProviderInfo) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec_pretty(info)
            .map_err(|e| EngineError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        write_atomic(&self.store_dir, &self.sidecar_path(&info.id), &bytes, 0o600)
    }

    /// Register executables already in the store
    fn scan(&self) -> Result<(), EngineError> {
        for entry in fs::read_dir(&self.store_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.')
                || path.extension().and_then(|e| e.to_str()) == Some(SIDECAR_EXTENSION)
                || !entry.file_type()?.is_file()
            {
                continue;
            }

            let checksum = match compute_file_hash(&path) {
                Ok(checksum) => checksum,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let info = match self.read_sidecar(name) {
                Some(mut info) if info.checksum == checksum => {
                    info.path = path.clone();
                    info
                }
                Some(info) => {
                    // Imported metadata no longer describes this binary
                    warn!(
                        "Checksum of {} changed since import ({} != {}); registering as unknown",
                        name, checksum, info.checksum
                    );
                    ProviderInfo::unknown(name, path.clone(), checksum)
                }
                None => ProviderInfo::unknown(name, path.clone(), checksum),
            };

            debug!("Recovered provider {} from {}", info.id, path.display());
            self.registry.insert(info);
        }

        info!(
            "Loaded {} providers from {}",
            self.registry.len(),
            self.store_dir.display()
        );
        Ok(())
    }

    fn read_sidecar(&self, id: &str) -> Option<ProviderInfo> {
        let bytes = fs::read(self.sidecar_path(id)).ok()?;
        match serde_json::from_slice::<ProviderInfo>(&bytes) {
            Ok(info) if info.id == id => Some(info),
            Ok(info) => {
                warn!("Sidecar for {} names provider {}; ignoring", id, info.id);
                None
            }
            Err(e) => {
                warn!("Unreadable sidecar for {}: {}", id, e);
                None
            }
        }
    }
}

/// A provider id becomes a file name in the store
fn check_provider_id(id: &str) -> Result<(), EngineError> {
    let unsafe_id = id.is_empty()
        || id.starts_with('.')
        || id.ends_with(&format!(".{}", SIDECAR_EXTENSION))
        || id.contains(['/', '\\', '\0']);
    if unsafe_id {
        return Err(EngineError::CorruptPackage(format!(
            "provider id '{}' is not a valid file name",
            id
        )));
    }
    Ok(())
}

/// Write through a hidden temp file and rename into place
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8], mode: u32) -> Result<(), EngineError> {
    let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));

    let result = (|| -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, target)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(EngineError::from)
}

fn remove_if_exists(path: &Path) -> Result<(), EngineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
