//! Shared fixtures for integration tests
//!
//! Builds signed, encrypted packages around arbitrary binaries (normally the
//! `provider-mock` executable) and managers over temporary stores.

#![allow(dead_code)]

use provisio_engine::audit::{AuditLog, WatermarkValidator};
use provisio_engine::crypto::{generate_signing_key, sign_package_data, DrmEngine, SigningKey, VerifyingKey};
use provisio_engine::package;
use provisio_engine::plugins::PluginManager;
use provisio_engine::schema::ProviderSchema;
use sdk::manifest::{Manifest, Watermark};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const LICENSE_ID: &str = "lic-acme-001";
pub const MASTER_KEY: [u8; 32] = [0x42; 32];

/// Path of the mock provider built alongside these tests
pub fn mock_provider_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_provider-mock"))
}

pub fn mock_provider_bytes() -> Vec<u8> {
    std::fs::read(mock_provider_path()).unwrap()
}

pub fn manifest(id: &str, version: &str) -> Manifest {
    Manifest {
        id: id.to_string(),
        name: format!("{} provider", id),
        version: version.to_string(),
        vendor: "Acme".to_string(),
        model: "RAID-9000".to_string(),
        supported_hardware: vec!["raid-9000".to_string()],
        description: "Mock RAID controller".to_string(),
        author: "Acme Storage".to_string(),
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

pub fn watermark(license_id: &str, organization_id: &str) -> Watermark {
    Watermark {
        downloader_id: "user-7".to_string(),
        download_time: "2026-02-01T12:00:00Z".to_string(),
        transaction_id: "tx-1001".to_string(),
        license_id: license_id.to_string(),
        organization_id: organization_id.to_string(),
    }
}

/// Keys plus a scratch directory
pub struct Fixture {
    pub dir: TempDir,
    pub signing_key: SigningKey,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            signing_key: generate_signing_key(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn drm(&self) -> DrmEngine {
        DrmEngine::new(&MASTER_KEY, Some(VerifyingKey::from(&self.signing_key))).unwrap()
    }

    pub fn store_dir(&self) -> PathBuf {
        self.path().join("store")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.path().join("audit").join("watermark_violations.log")
    }

    pub fn validator(&self) -> WatermarkValidator {
        WatermarkValidator::new(LICENSE_ID, AuditLog::new(self.audit_path()))
    }

    /// A manager over this fixture's store, scanning what is already there
    pub fn manager(&self) -> PluginManager {
        PluginManager::new(self.store_dir(), self.drm(), self.validator()).unwrap()
    }

    /// Write a correctly signed package and return its path
    pub fn package(
        &self,
        manifest: &Manifest,
        watermark: &Watermark,
        binary: &[u8],
        schema: Option<&ProviderSchema>,
    ) -> PathBuf {
        let encrypted = self.drm().encrypt_with_master_key(binary).unwrap();
        let manifest_bytes = manifest.to_json_bytes().unwrap();
        let signature = sign_package_data(
            &package::signed_payload(&manifest_bytes, &encrypted),
            &self.signing_key,
        )
        .unwrap();

        let out = self
            .path()
            .join("packages")
            .join(format!("{}-{}.cbp", manifest.id, manifest.version));
        package::create_with_schema(
            manifest,
            watermark,
            schema,
            &encrypted,
            signature.as_bytes(),
            &out,
        )
        .unwrap();
        out
    }

    /// A package of the mock provider licensed to this installation
    pub fn mock_package(&self, id: &str) -> PathBuf {
        self.package(
            &manifest(id, "1.0.0"),
            &watermark(LICENSE_ID, "org-acme"),
            &mock_provider_bytes(),
            None,
        )
    }
}
