//! In-memory provider registry

use crate::audit::WatermarkViolation;
use crate::schema::ProviderSchema;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, Watermark};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

/// A registered provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    /// Decrypted executable in the store directory
    pub path: PathBuf,
    /// SHA-256 of the executable, hex
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<Watermark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<WatermarkViolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ProviderSchema>,
    pub installed_at: DateTime<Utc>,
}

impl ProviderInfo {
    /// Metadata for a binary found on disk without a sidecar
    pub fn unknown(id: impl Into<String>, path: PathBuf, checksum: String) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: "unknown".to_string(),
            vendor: String::new(),
            model: String::new(),
            path,
            checksum,
            manifest: None,
            watermark: None,
            violation: None,
            schema: None,
            installed_at: Utc::now(),
        }
    }

    /// Whether the watermark did not match this installation's license
    pub fn is_flagged(&self) -> bool {
        self.violation.is_some()
    }
}

/// Providers keyed by manifest id
///
/// Many readers or one writer. A poisoned lock is recovered rather than
/// propagated since every write replaces a whole entry.
#[derive(Debug, Default)]
pub struct Registry {
    providers: RwLock<HashMap<String, ProviderInfo>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the previous entry
    pub fn insert(&self, info: ProviderInfo) -> Option<ProviderInfo> {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        providers.insert(info.id.clone(), info)
    }

    pub fn get(&self, id: &str) -> Result<ProviderInfo, EngineError> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::ProviderNotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Result<ProviderInfo, EngineError> {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        providers
            .remove(id)
            .ok_or_else(|| EngineError::ProviderNotFound(id.to_string()))
    }

    /// All providers, sorted by id
    pub fn list(&self) -> Vec<ProviderInfo> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<ProviderInfo> = providers.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn len(&self) -> usize {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
