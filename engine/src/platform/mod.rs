//! Platform-specific utilities
//!
//! This module answers the questions the sandbox factory needs at startup:
//! which operating system the engine runs on, and whether the process has
//! the privileges required for namespace isolation.
//!
//! # Backend selection
//!
//! - Linux: namespaces, chroot and privilege drop (requires root)
//! - macOS: resource limits and process groups only
//! - anything else: working directory and a scrubbed environment

/// Host operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Other,
}

impl Platform {
    /// The platform this binary was compiled for
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Other => "unknown",
        }
    }
}

/// Get the platform name as a string
///
/// Returns one of: "linux", "macos", "unknown"
///
/// # Examples
///
/// ```
/// use provisio_engine::platform::platform_name;
///
/// let name = platform_name();
/// assert!(["linux", "macos", "unknown"].contains(&name));
/// ```
pub fn platform_name() -> &'static str {
    Platform::current().name()
}

/// Check if the current platform is Unix-like (Linux, macOS, BSD, etc.)
pub fn is_unix() -> bool {
    cfg!(unix)
}

/// Whether the process runs with an effective uid of 0
///
/// Namespace creation, chroot and dropping to another uid all need this.
pub fn is_privileged() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(not(unix))]
    {
        false
    }
}
