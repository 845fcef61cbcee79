//! Strict sandbox for Linux
//!
//! Inside the forked child, before exec:
//!
//! 1. unshare mount, PID, UTS and IPC namespaces (and network when requested)
//! 2. make every mount private so nothing propagates back to the host
//! 3. bind-mount read-only system paths and writable allowed paths into the
//!    working directory
//! 4. install memory, process and file-descriptor rlimits
//! 5. chroot into the working directory
//! 6. drop supplementary groups, then gid, then uid
//!
//! Every step is mandatory. If one fails the child exits before exec and the
//! spawn fails, so a provider never runs half-confined.
//!
//! The provider binary is copied into the working directory by
//! `stage_program`, since the host path is unreachable after chroot.
//! Processes forked by the provider land in the new PID namespace.

use super::rlimit::{self, PlannedLimit};
use super::{
    ensure_work_dir, LimitKind, LimitOutcome, Sandbox, SandboxConfig, SandboxError, SandboxKind,
    SandboxReport, MAX_OPEN_FILES, SANDBOX_PATH,
};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::Resource;
use nix::unistd::{chdir, chroot, setgid, setgroups, setuid, Gid, Uid};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone)]
struct BindMount {
    source: PathBuf,
    target: PathBuf,
    read_only: bool,
}

/// Namespace, chroot and privilege-drop sandbox
#[derive(Debug, Default)]
pub struct StrictSandbox {
    staged: Option<PathBuf>,
    /// Mount points and parents created for this invocation, in creation order
    created: Vec<PathBuf>,
}

impl StrictSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `target` (and missing parents) as a mount point for `source`
    fn prepare_mount_point(&mut self, source: &Path, target: &Path) -> Result<(), SandboxError> {
        let mut missing = Vec::new();
        let mut cursor = target.parent();
        while let Some(dir) = cursor {
            if dir.exists() {
                break;
            }
            missing.push(dir.to_path_buf());
            cursor = dir.parent();
        }
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir).map_err(|e| SandboxError::prepare(&dir, e))?;
            self.created.push(dir);
        }

        if target.exists() {
            return Ok(());
        }

        if source.is_dir() {
            fs::create_dir(target).map_err(|e| SandboxError::prepare(target, e))?;
        } else {
            fs::File::create(target).map_err(|e| SandboxError::prepare(target, e))?;
        }
        self.created.push(target.to_path_buf());
        Ok(())
    }
}

/// Path of `host` re-rooted under `root`
fn rebase(root: &Path, host: &Path) -> PathBuf {
    host.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .fold(root.to_path_buf(), |acc, c| acc.join(c))
}

fn namespace_flags(config: &SandboxConfig) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;
    if config.network_isolation {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    flags
}

/// Runs in the forked child
fn enter_sandbox(
    flags: CloneFlags,
    root: &Path,
    binds: &[BindMount],
    limits: &[PlannedLimit],
    uid: Uid,
    gid: Gid,
) -> io::Result<()> {
    unshare(flags)?;

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;

    for bind in binds {
        mount(
            Some(&bind.source),
            &bind.target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;
        if bind.read_only {
            mount(
                None::<&str>,
                &bind.target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None::<&str>,
            )?;
        }
    }

    rlimit::install(limits)?;

    chroot(root)?;
    chdir("/")?;

    setgroups(&[])?;
    setgid(gid)?;
    setuid(uid)?;

    Ok(())
}

impl Sandbox for StrictSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Strict
    }

    fn stage_program(
        &mut self,
        program: &Path,
        config: &SandboxConfig,
    ) -> Result<PathBuf, SandboxError> {
        ensure_work_dir(config)?;

        let name = format!("provider-{}", uuid::Uuid::new_v4().simple());
        let staged = config.work_dir.join(&name);
        fs::copy(program, &staged).map_err(|e| SandboxError::prepare(&staged, e))?;
        self.staged = Some(staged.clone());
        fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))
            .map_err(|e| SandboxError::prepare(&staged, e))?;

        Ok(Path::new("/").join(name))
    }

    fn apply(
        &mut self,
        cmd: &mut Command,
        config: &SandboxConfig,
    ) -> Result<SandboxReport, SandboxError> {
        if !crate::platform::is_privileged() {
            return Err(SandboxError::Privileges(
                "strict sandbox requires root to create namespaces and drop privileges"
                    .to_string(),
            ));
        }

        ensure_work_dir(config)?;
        let root = config.work_dir.clone();
        let tmp = root.join("tmp");
        fs::create_dir_all(&tmp).map_err(|e| SandboxError::prepare(&tmp, e))?;

        let mut binds = Vec::new();
        let sources = config
            .read_only_paths
            .iter()
            .map(|p| (p, true))
            .chain(config.allowed_paths.iter().map(|p| (p, false)));
        for (source, read_only) in sources {
            if !source.exists() {
                tracing::debug!("Skipping bind of missing path {}", source.display());
                continue;
            }
            let target = rebase(&root, source);
            self.prepare_mount_point(source, &target)?;
            binds.push(BindMount {
                source: source.clone(),
                target,
                read_only,
            });
        }

        let mut report = SandboxReport::new(SandboxKind::Strict);
        let mut limits: Vec<PlannedLimit> = Vec::with_capacity(3);
        for (kind, resource, requested) in [
            (LimitKind::Memory, Resource::RLIMIT_AS, config.max_memory_bytes()),
            (LimitKind::Processes, Resource::RLIMIT_NPROC, config.max_processes),
            (LimitKind::FileDescriptors, Resource::RLIMIT_NOFILE, MAX_OPEN_FILES),
        ] {
            let (planned, outcome) = rlimit::plan(resource, requested);
            if planned.is_none() {
                return Err(SandboxError::ResourceLimit(format!(
                    "{:?} cannot be enforced on this host",
                    kind
                )));
            }
            limits.extend(planned);
            report.set(kind, outcome);
        }

        // CPU share needs cgroups; rlimits only bound total CPU time
        report.set(LimitKind::CpuTime, LimitOutcome::Unsupported);
        report.set(
            LimitKind::Network,
            if config.network_isolation {
                LimitOutcome::Applied
            } else {
                LimitOutcome::NotRequested
            },
        );
        report.set(LimitKind::Filesystem, LimitOutcome::Applied);
        report.set(LimitKind::Privileges, LimitOutcome::Applied);

        cmd.env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", "/")
            .env("TMPDIR", "/tmp");

        let flags = namespace_flags(config);
        let uid = Uid::from_raw(config.run_as_uid);
        let gid = Gid::from_raw(config.run_as_gid);

        // SAFETY: the closure performs only raw syscalls on data prepared
        // before fork. An error aborts the spawn before exec.
        unsafe {
            cmd.pre_exec(move || enter_sandbox(flags, &root, &binds, &limits, uid, gid));
        }

        report.log_outcomes();
        Ok(report)
    }

    fn cleanup(&mut self) -> Result<(), SandboxError> {
        let mut failures = Vec::new();

        if let Some(staged) = self.staged.take() {
            if let Err(e) = fs::remove_file(&staged) {
                if e.kind() != io::ErrorKind::NotFound {
                    failures.push(format!("{}: {}", staged.display(), e));
                }
            }
        }

        for path in self.created.drain(..).rev() {
            let result = if path.is_dir() {
                fs::remove_dir(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = result {
                if e.kind() != io::ErrorKind::NotFound {
                    failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Cleanup(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rebase() {
        assert_eq!(
            rebase(Path::new("/opt/run"), Path::new("/etc/ld.so.cache")),
            PathBuf::from("/opt/run/etc/ld.so.cache")
        );
        assert_eq!(
            rebase(Path::new("/opt/run"), Path::new("/../usr")),
            PathBuf::from("/opt/run/usr")
        );
    }

    #[test]
    fn test_namespace_flags() {
        let mut config = SandboxConfig::default();
        assert!(namespace_flags(&config).contains(CloneFlags::CLONE_NEWNET));
        config.network_isolation = false;
        let flags = namespace_flags(&config);
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
    }

    #[test]
    fn test_stage_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let program = dir.path().join("bin");
        fs::write(&program, b"#!/bin/sh\n").unwrap();
        let config = SandboxConfig {
            work_dir: dir.path().join("root"),
            ..Default::default()
        };

        let mut sandbox = StrictSandbox::new();
        let inside = sandbox.stage_program(&program, &config).unwrap();
        assert!(inside.starts_with("/"));
        let host = config.work_dir.join(inside.strip_prefix("/").unwrap());
        assert!(host.exists());
        let mode = fs::metadata(&host).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        sandbox.cleanup().unwrap();
        assert!(!host.exists());
        sandbox.cleanup().unwrap();
    }

    #[test]
    fn test_mount_points_removed_on_cleanup() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();

        let mut sandbox = StrictSandbox::new();
        let file_target = rebase(&root, Path::new("/etc/ld.so.cache"));
        sandbox
            .prepare_mount_point(Path::new("/etc/hostname-does-not-matter"), &file_target)
            .unwrap();
        assert!(file_target.is_file());

        sandbox.cleanup().unwrap();
        assert!(!file_target.exists());
        assert!(!root.join("etc").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_apply_requires_root() {
        if crate::platform::is_privileged() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let config = SandboxConfig {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut cmd = Command::new("true");
        let result = StrictSandbox::new().apply(&mut cmd, &config);
        assert!(matches!(result, Err(SandboxError::Privileges(_))));
    }
}
