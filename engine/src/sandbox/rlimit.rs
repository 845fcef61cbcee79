//! Resource-limit planning shared by the unix backends
//!
//! Limits are resolved in the parent against the current hard ceiling so the
//! `setrlimit` call inside `pre_exec` cannot fail for lack of privilege.

use super::LimitOutcome;
use nix::sys::resource::{getrlimit, setrlimit, Resource};

/// A limit ready to be installed in the child
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlannedLimit {
    pub resource: Resource,
    pub value: u64,
}

/// Resolve `requested` against the host ceiling for `resource`
///
/// Returns `None` with an `Unsupported` outcome when the host does not
/// report the resource.
pub(crate) fn plan(resource: Resource, requested: u64) -> (Option<PlannedLimit>, LimitOutcome) {
    let hard = match getrlimit(resource) {
        Ok((_, hard)) => hard as u64,
        Err(e) => {
            tracing::warn!("Resource {:?} unavailable on this host: {}", resource, e);
            return (None, LimitOutcome::Unsupported);
        }
    };

    if requested > hard {
        (
            Some(PlannedLimit {
                resource,
                value: hard,
            }),
            LimitOutcome::Clamped {
                requested,
                applied: hard,
            },
        )
    } else {
        (
            Some(PlannedLimit {
                resource,
                value: requested,
            }),
            LimitOutcome::Applied,
        )
    }
}

/// Install planned limits; runs in the forked child
pub(crate) fn install(limits: &[PlannedLimit]) -> std::io::Result<()> {
    for limit in limits {
        setrlimit(limit.resource, limit.value as _, limit.value as _)?;
    }
    Ok(())
}
