//! Watermark validation and the append-only audit log
//!
//! Every package carries a per-download watermark. When its license id does
//! not match this installation's license, a `WatermarkViolation` is appended
//! to the audit log before anything else happens. The log is newline-delimited
//! JSON and is never rewritten or truncated by the engine.

use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::manifest::Watermark;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Violation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Same organization, different license
    Warning,
    /// No organization on record
    Critical,
}

impl Severity {
    /// Severity for a mismatched watermark
    pub fn for_watermark(watermark: &Watermark) -> Self {
        if watermark.has_organization() {
            Severity::Warning
        } else {
            Severity::Critical
        }
    }
}

/// A recorded watermark mismatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkViolation {
    pub timestamp: DateTime<Utc>,
    pub provider_id: String,
    pub provider_name: String,
    pub expected_license_id: String,
    pub actual_license_id: String,
    pub actual_downloader_id: String,
    pub organization_id: String,
    pub severity: Severity,
    pub auto_resolved: bool,
}

/// Append-only NDJSON audit log
///
/// The file is opened in append mode for every write and never held open.
/// Writers are serialized by a mutex so records are never interleaved.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Create an audit log at `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one violation record
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AuditLog` if the record cannot be durably written.
    pub fn append(&self, violation: &WatermarkViolation) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(violation)
            .map_err(|e| EngineError::AuditLog(format!("Failed to encode violation: {}", e)))?;
        line.push(b'\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| EngineError::AuditLog("audit log lock poisoned".to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::AuditLog(format!("Failed to create audit directory: {}", e))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::AuditLog(format!("Failed to open audit log: {}", e)))?;

        // A torn trailing record must stay on its own line
        if !ends_with_newline(&mut file)
            .map_err(|e| EngineError::AuditLog(format!("Failed to read audit log: {}", e)))?
        {
            line.insert(0, b'\n');
        }

        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|e| EngineError::AuditLog(format!("Failed to write audit log: {}", e)))?;

        Ok(())
    }

    /// Read every violation in write order
    ///
    /// Lines that are not valid records are skipped. A missing file means
    /// no violations.
    pub fn read_all(&self) -> Result<Vec<WatermarkViolation>, EngineError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::AuditLog(format!(
                    "Failed to open audit log: {}",
                    e
                )))
            }
        };

        let mut violations = Vec::new();
        for (number, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    return Err(EngineError::AuditLog(format!(
                        "Failed to read audit log at line {}: {}",
                        number + 1,
                        e
                    )))
                }
            };
            let Ok(text) = std::str::from_utf8(&line) else {
                tracing::warn!("Skipping non-UTF-8 audit record at line {}", number + 1);
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WatermarkViolation>(text) {
                Ok(v) => violations.push(v),
                Err(e) => tracing::warn!("Skipping corrupt audit record at line {}: {}", number + 1, e),
            }
        }

        Ok(violations)
    }
}

/// Whether an empty file or its last byte is a newline
fn ends_with_newline(file: &mut fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Compares package watermarks against this installation's license
#[derive(Debug)]
pub struct WatermarkValidator {
    license_id: String,
    log: AuditLog,
}

impl WatermarkValidator {
    pub fn new(license_id: impl Into<String>, log: AuditLog) -> Self {
        Self {
            license_id: license_id.into(),
            log,
        }
    }

    pub fn license_id(&self) -> &str {
        &self.license_id
    }

    /// Check a watermark
    ///
    /// On mismatch the violation is appended to the audit log before it is
    /// returned, so ignoring the return value still leaves a record.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AuditLog` if a mismatch could not be recorded.
    pub fn validate(
        &self,
        provider_id: &str,
        provider_name: &str,
        watermark: &Watermark,
    ) -> Result<Option<WatermarkViolation>, EngineError> {
        if watermark.license_id == self.license_id {
            tracing::debug!("Watermark for {} matches license", provider_id);
            return Ok(None);
        }

        let violation = WatermarkViolation {
            timestamp: Utc::now(),
            provider_id: provider_id.to_string(),
            provider_name: provider_name.to_string(),
            expected_license_id: self.license_id.clone(),
            actual_license_id: watermark.license_id.clone(),
            actual_downloader_id: watermark.downloader_id.clone(),
            organization_id: watermark.organization_id.clone(),
            severity: Severity::for_watermark(watermark),
            auto_resolved: false,
        };

        self.log.append(&violation)?;

        match violation.severity {
            Severity::Warning => tracing::warn!(
                "Watermark mismatch for {} (organization {}): license {}",
                provider_id,
                violation.organization_id,
                violation.actual_license_id
            ),
            Severity::Critical => tracing::error!(
                "Unattributed watermark mismatch for {}: license {}, downloader {}",
                provider_id,
                violation.actual_license_id,
                violation.actual_downloader_id
            ),
        }

        Ok(Some(violation))
    }

    /// All recorded violations, in write order
    pub fn get_violations(&self) -> Result<Vec<WatermarkViolation>, EngineError> {
        self.log.read_all()
    }

    /// Violations that have not been auto-resolved
    pub fn get_active_violations(&self) -> Result<Vec<WatermarkViolation>, EngineError> {
        Ok(self
            .log
            .read_all()?
            .into_iter()
            .filter(|v| !v.auto_resolved)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn watermark(license: &str, org: &str) -> Watermark {
        Watermark {
            downloader_id: "dl-1".to_string(),
            license_id: license.to_string(),
            organization_id: org.to_string(),
            ..Default::default()
        }
    }

    fn validator(dir: &TempDir) -> WatermarkValidator {
        WatermarkValidator::new("lic-home", AuditLog::new(dir.path().join("audit/v.log")))
    }

    #[test]
    fn test_match_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir);

        let result = v.validate("p", "P", &watermark("lic-home", "")).unwrap();
        assert!(result.is_none());
        assert!(!dir.path().join("audit/v.log").exists());
        assert!(v.get_violations().unwrap().is_empty());
    }

    #[test]
    fn test_severity_policy() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir);

        let warn = v.validate("p", "P", &watermark("lic-x", "org-1")).unwrap().unwrap();
        assert_eq!(warn.severity, Severity::Warning);

        let crit = v.validate("p", "P", &watermark("lic-x", "  ")).unwrap().unwrap();
        assert_eq!(crit.severity, Severity::Critical);
        assert_eq!(crit.expected_license_id, "lic-home");
        assert_eq!(crit.actual_downloader_id, "dl-1");
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir);

        v.validate("a", "A", &watermark("lic-x", "")).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("audit/v.log"))
            .unwrap();
        file.write_all(b"{\"timestamp\": \"truncated\n").unwrap();
        v.validate("b", "B", &watermark("lic-y", "")).unwrap();

        let all = v.get_violations().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].provider_id, "a");
        assert_eq!(all[1].provider_id, "b");
    }

    #[test]
    fn test_invalid_utf8_line_skipped() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir);

        v.validate("a", "A", &watermark("lic-x", "")).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("audit/v.log"))
            .unwrap();
        file.write_all(b"\xff\xfe garbage\n").unwrap();
        v.validate("b", "B", &watermark("lic-y", "")).unwrap();

        let ids: Vec<String> = v
            .get_violations()
            .unwrap()
            .into_iter()
            .map(|r| r.provider_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_torn_tail_does_not_swallow_next_record() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir);

        v.validate("a", "A", &watermark("lic-x", "")).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("audit/v.log"))
            .unwrap();
        file.write_all(b"{\"timestamp\":\"2026-").unwrap();
        v.validate("b", "B", &watermark("lic-y", "")).unwrap();

        let all = v.get_violations().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].provider_id, "b");
    }

    #[test]
    fn test_active_filters_auto_resolved() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("v.log"));
        let mut resolved = WatermarkViolation {
            timestamp: Utc::now(),
            provider_id: "old".to_string(),
            provider_name: "Old".to_string(),
            expected_license_id: "lic-home".to_string(),
            actual_license_id: "lic-x".to_string(),
            actual_downloader_id: String::new(),
            organization_id: String::new(),
            severity: Severity::Critical,
            auto_resolved: true,
        };
        log.append(&resolved).unwrap();
        resolved.auto_resolved = false;
        resolved.provider_id = "new".to_string();
        log.append(&resolved).unwrap();

        let v = WatermarkValidator::new("lic-home", AuditLog::new(dir.path().join("v.log")));
        let active = v.get_active_violations().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].provider_id, "new");
        assert_eq!(v.get_violations().unwrap().len(), 2);
    }
}
