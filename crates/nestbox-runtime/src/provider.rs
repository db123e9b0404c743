//! Collaborators the launch sequence consumes but does not own.
//!
//! Security labelling, cgroup re-isolation and the final program execution
//! are hidden behind traits so a supervisor can plug in its own policy.
//! Each trait ships with a minimal default.

use std::convert::Infallible;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use nestbox_common::constants::CGROUP_V2_PATH;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::ContainerLaunchSpec;
use nestbox_core::filesystem::{Mounter, prefixed};
use nix::mount::MsFlags;

use crate::init::InitCommand;

/// Security-label policy engine.
pub trait SecurityProvider {
    /// Extra mount data (e.g. a `context=` option) applied to every
    /// filesystem the container mounts. Empty means none.
    ///
    /// # Errors
    ///
    /// Returns an error if the label cannot be computed.
    fn compute_mount_options(&self, spec: &ContainerLaunchSpec) -> Result<String>;

    /// Labels the calling process right before it execs the init program.
    ///
    /// # Errors
    ///
    /// Returns an error if the label cannot be applied.
    fn apply_process_label(&self, spec: &ContainerLaunchSpec) -> Result<()>;
}

/// Re-creates the control-group view inside the new root.
pub trait CgroupProvider {
    /// Mounts the container's controller hierarchies, looking the host's
    /// mounts up below `old_root`.
    ///
    /// # Errors
    ///
    /// Returns an error if a hierarchy cannot be mounted.
    fn reisolate_and_remount(
        &self,
        mounter: &dyn Mounter,
        old_root: &Path,
        mount_options: &str,
    ) -> Result<()>;
}

/// Replaces the current process image.
pub trait Executor {
    /// Execs `command`. Only returns on failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be replaced.
    fn exec(&self, command: &InitCommand) -> Result<Infallible>;
}

/// No labelling at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecurityLabel;

impl SecurityProvider for NoSecurityLabel {
    fn compute_mount_options(&self, _spec: &ContainerLaunchSpec) -> Result<String> {
        Ok(String::new())
    }

    fn apply_process_label(&self, _spec: &ContainerLaunchSpec) -> Result<()> {
        Ok(())
    }
}

/// Binds the process's own cgroup v2 directory over `/sys/fs/cgroup`.
///
/// The container then sees its own subtree as the hierarchy root, the same
/// way it would with a cgroup namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedCgroupIsolation {
    proc_cgroup: PathBuf,
}

impl Default for UnifiedCgroupIsolation {
    fn default() -> Self {
        Self {
            proc_cgroup: PathBuf::from("/proc/self/cgroup"),
        }
    }
}

impl UnifiedCgroupIsolation {
    /// Reads the process's cgroup membership from `proc_cgroup` instead of
    /// `/proc/self/cgroup`.
    pub fn with_proc_cgroup(proc_cgroup: impl Into<PathBuf>) -> Self {
        Self {
            proc_cgroup: proc_cgroup.into(),
        }
    }

    fn own_cgroup(&self) -> Result<PathBuf> {
        let raw = std::fs::read_to_string(&self.proc_cgroup).map_err(|e| NestboxError::Io {
            path: self.proc_cgroup.clone(),
            source: e,
        })?;
        parse_unified_cgroup(&raw).ok_or_else(|| NestboxError::NotFound {
            kind: "unified cgroup",
            id: self.proc_cgroup.display().to_string(),
        })
    }
}

/// Extracts the path of the `0::<path>` line.
fn parse_unified_cgroup(raw: &str) -> Option<PathBuf> {
    raw.lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| PathBuf::from(path.trim()))
}

impl CgroupProvider for UnifiedCgroupIsolation {
    fn reisolate_and_remount(
        &self,
        mounter: &dyn Mounter,
        old_root: &Path,
        mount_options: &str,
    ) -> Result<()> {
        let cgroup_root = Path::new(CGROUP_V2_PATH);
        let host_root = prefixed(old_root, cgroup_root);
        let unified = mounter
            .mount_table()?
            .entries()
            .iter()
            .any(|e| e.target == host_root && e.fs_type == "cgroup2");
        if !unified {
            tracing::warn!(path = %host_root.display(), "no unified cgroup hierarchy on host, skipping");
            return Ok(());
        }

        let own = self.own_cgroup()?;
        let source = prefixed(&host_root, &own);

        tracing::debug!(src = %source.display(), "mount cgroup");
        let data = (!mount_options.is_empty()).then_some(mount_options);
        mounter
            .mount(
                Some(&source),
                cgroup_root,
                None,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                data,
            )
            .map_err(|e| {
                NestboxError::syscall(
                    format!("failed to bind {} on {CGROUP_V2_PATH}", source.display()),
                    e,
                )
            })
    }
}

/// `execve(2)` with exactly the command's environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecveExecutor;

impl Executor for ExecveExecutor {
    fn exec(&self, command: &InitCommand) -> Result<Infallible> {
        let path = c_string(command.program.as_os_str().as_encoded_bytes())?;
        let argv = command
            .argv()
            .iter()
            .map(|a| c_string(a.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let env = command
            .env_strings()
            .iter()
            .map(|e| c_string(e.as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(program = %command.program.display(), "exec init");
        nix::unistd::execve(&path, &argv, &env).map_err(|e| {
            NestboxError::syscall(
                format!("cannot execute '{}'", command.program.display()),
                e,
            )
        })
    }
}

fn c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        NestboxError::config(format!(
            "'{}' contains a NUL byte",
            String::from_utf8_lossy(bytes)
        ))
    })
}
