//! Manifest and watermark types for provider packages

use serde::{Deserialize, Serialize};

/// Publisher-declared provider metadata
///
/// Stored as `meta/manifest.json` inside a provider package. The `id` is the
/// registry key; importing a package with an existing id replaces the entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub supported_hardware: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub created_at: String,
}

impl Manifest {
    /// Parse manifest from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serialize manifest to JSON bytes
    ///
    /// This is the exact byte form written into a package, and therefore the
    /// form covered by the publisher signature.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Check whether this provider declares support for a hardware tag
    pub fn supports(&self, hardware: &str) -> bool {
        self.supported_hardware.iter().any(|h| h == hardware)
    }
}

/// Per-download fingerprint embedded by the distribution system
///
/// Stored as `meta/watermark.json`. It is stamped at download time and is
/// not covered by the publisher signature.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Watermark {
    #[serde(default)]
    pub downloader_id: String,
    #[serde(default)]
    pub download_time: String,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub license_id: String,
    #[serde(default)]
    pub organization_id: String,
}

impl Watermark {
    /// Whether the watermark names an organization
    pub fn has_organization(&self) -> bool {
        !self.organization_id.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_missing_fields_default_to_empty() {
        let manifest = Manifest::from_json_bytes(br#"{"name":"LSI MegaRAID"}"#).unwrap();
        assert!(manifest.id.is_empty());
        assert_eq!(manifest.name, "LSI MegaRAID");
        assert!(manifest.supported_hardware.is_empty());
    }

    #[test]
    fn test_manifest_supports() {
        let manifest = Manifest {
            id: "raid-lsi".to_string(),
            supported_hardware: vec!["lsi_megaraid_3108".to_string()],
            ..Default::default()
        };
        assert!(manifest.supports("lsi_megaraid_3108"));
        assert!(!manifest.supports("generic_raid"));
    }

    #[test]
    fn test_watermark_organization() {
        let mut watermark = Watermark::default();
        assert!(!watermark.has_organization());
        watermark.organization_id = "org-7".to_string();
        assert!(watermark.has_organization());
    }
}
