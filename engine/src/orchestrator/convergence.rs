//! Convergence check
//!
//! Decides from a probe result whether the desired storage resource already
//! exists, in which case apply is skipped.

use sdk::protocol::{canonical_id, DesiredState, VIRTUAL_DRIVES_KEY};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How strictly existing drives must match the desired drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergencePolicy {
    /// Same level and the same drive identifiers, in any order
    #[default]
    DriveSet,
    /// Same level and the same number of drives
    DriveCount,
}

/// A resource reported by a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingResource {
    pub id: Option<String>,
    pub level: Option<String>,
    pub drives: Vec<String>,
}

impl ExistingResource {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            id: obj.get("id").map(canonical_id),
            level: obj
                .get("level")
                .filter(|v| !v.is_null())
                .map(canonical_id),
            drives: obj
                .get("drives")
                .and_then(Value::as_array)
                .map(|drives| drives.iter().map(canonical_id).collect())
                .unwrap_or_default(),
        })
    }

    fn matches(&self, level: &str, drives: &[String], policy: ConvergencePolicy) -> bool {
        if self.level.as_deref() != Some(level) {
            return false;
        }
        match policy {
            ConvergencePolicy::DriveCount => self.drives.len() == drives.len(),
            ConvergencePolicy::DriveSet => {
                let mut mine = self.drives.clone();
                let mut theirs = drives.to_vec();
                mine.sort();
                theirs.sort();
                mine == theirs
            }
        }
    }
}

/// Resources listed under `virtual_drives` in probe data
pub fn existing_resources(probe_data: &Map<String, Value>) -> Vec<ExistingResource> {
    probe_data
        .get(VIRTUAL_DRIVES_KEY)
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(ExistingResource::from_value).collect())
        .unwrap_or_default()
}

/// First existing resource that satisfies the desired state
///
/// No match is possible without a desired level and drive list, or when
/// the probe reports no resources.
pub fn find_match(
    desired: &DesiredState,
    probe_data: &Map<String, Value>,
    policy: ConvergencePolicy,
) -> Option<ExistingResource> {
    let level = desired.level.as_deref()?;
    desired.drives.as_ref()?;
    let drives = desired.drive_ids();

    existing_resources(probe_data)
        .into_iter()
        .find(|resource| resource.matches(level, &drives, policy))
}
