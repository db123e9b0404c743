//! The fixed set of pseudo-filesystems every container gets.

use std::path::Path;

use nestbox_common::constants::SELINUX_MOUNT;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::layout::under_old_root;
use nix::mount::MsFlags;

use super::{Mounter, make_path};

/// Rows of the basic mount table, in the order they must be applied.
///
/// `/proc` has to exist before `/proc/sys` can be bound onto itself, and
/// `/sys` before anything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicMount {
    /// Namespace-aware procfs.
    Proc,
    /// `/proc/sys` made read-only.
    ProcSys,
    /// sysfs, read-only.
    Sys,
    /// securityfs, read-only.
    SecurityFs,
    /// selinuxfs, read-only.
    SelinuxFs,
}

impl BasicMount {
    /// Every row, in application order.
    pub const ALL: [Self; 5] = [
        Self::Proc,
        Self::ProcSys,
        Self::Sys,
        Self::SecurityFs,
        Self::SelinuxFs,
    ];

    /// Mount source.
    #[must_use]
    pub const fn source(self) -> &'static str {
        match self {
            Self::Proc => "proc",
            Self::ProcSys => "/proc/sys",
            Self::Sys => "sysfs",
            Self::SecurityFs => "securityfs",
            Self::SelinuxFs => SELINUX_MOUNT,
        }
    }

    /// Mount point.
    #[must_use]
    pub const fn destination(self) -> &'static str {
        match self {
            Self::Proc => "/proc",
            Self::ProcSys => "/proc/sys",
            Self::Sys => "/sys",
            Self::SecurityFs => "/sys/kernel/security",
            Self::SelinuxFs => SELINUX_MOUNT,
        }
    }

    /// Filesystem type, `None` for bind mounts.
    #[must_use]
    pub const fn fs_type(self) -> Option<&'static str> {
        match self {
            Self::Proc => Some("proc"),
            Self::ProcSys => None,
            Self::Sys => Some("sysfs"),
            Self::SecurityFs => Some("securityfs"),
            Self::SelinuxFs => Some("selinuxfs"),
        }
    }

    /// Requested mount flags, including `MS_RDONLY` where applicable.
    #[must_use]
    pub fn flags(self) -> MsFlags {
        let hardened = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV;
        match self {
            Self::Proc => hardened,
            Self::ProcSys => MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            Self::Sys | Self::SecurityFs | Self::SelinuxFs => hardened | MsFlags::MS_RDONLY,
        }
    }

    /// Skipped when the container runs in a user namespace.
    #[must_use]
    pub const fn skip_if_user_namespace(self) -> bool {
        matches!(self, Self::SecurityFs | Self::SelinuxFs)
    }

    /// Skipped unless the host has the same filesystem mounted.
    #[must_use]
    pub const fn skip_if_not_mounted_on_host(self) -> bool {
        matches!(self, Self::SecurityFs | Self::SelinuxFs)
    }

    /// Decides whether this row is skipped for the current container.
    ///
    /// The host check looks at the row's destination under the preserved
    /// old root.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be read.
    pub fn should_skip(self, mounter: &dyn Mounter, user_namespace: bool) -> Result<bool> {
        if self.skip_if_not_mounted_on_host() {
            let host_dir = under_old_root(Path::new(self.destination()));
            if !mounter.is_mount_point(&host_dir)? {
                tracing::debug!(dst = self.destination(), "skipping, not mounted in host");
                return Ok(true);
            }
        }
        if self.skip_if_user_namespace() && user_namespace {
            tracing::debug!(dst = self.destination(), "skipping due to user namespace");
            return Ok(true);
        }
        Ok(false)
    }
}

/// Whether `path` is the destination of a basic mount.
#[must_use]
pub fn is_basic_mount_location(path: &Path) -> bool {
    BasicMount::ALL
        .iter()
        .any(|m| Path::new(m.destination()) == path)
}

/// Mounts `/proc`, `/sys` and friends inside the new root.
///
/// Read-only rows are mounted read-write first and then bind-remounted
/// read-only: requesting `MS_RDONLY` on the first mount can flip the host's
/// identical superblock read-only as well.
///
/// # Errors
///
/// Returns an error if a destination cannot be created or a mount fails.
/// Applying the table over an already populated tree surfaces the kernel's
/// `EBUSY` through [`NestboxError::errno`].
pub fn apply_basic_mounts(mounter: &dyn Mounter, user_namespace: bool) -> Result<()> {
    tracing::debug!("mounting basic filesystems");

    for mnt in BasicMount::ALL {
        tracing::debug!(src = mnt.source(), dst = mnt.destination(), "processing");
        if mnt.should_skip(mounter, user_namespace)? {
            continue;
        }

        let source = Path::new(mnt.source());
        let destination = Path::new(mnt.destination());
        make_path(destination)?;

        let flags = mnt.flags();
        let bind_over_readonly = flags.contains(MsFlags::MS_RDONLY);
        let first_flags = flags - MsFlags::MS_RDONLY;

        mounter
            .mount(Some(source), destination, mnt.fs_type(), first_flags, None)
            .map_err(|e| {
                NestboxError::syscall(
                    format!(
                        "failed to mount {} on {} type {} flags={:#x}",
                        mnt.source(),
                        mnt.destination(),
                        mnt.fs_type().unwrap_or("(null)"),
                        first_flags.bits()
                    ),
                    e,
                )
            })?;

        if bind_over_readonly {
            let remount = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
            mounter
                .mount(Some(source), destination, None, remount, None)
                .map_err(|e| {
                    NestboxError::syscall(
                        format!(
                            "failed to re-mount {} on {} flags={:#x}",
                            mnt.source(),
                            mnt.destination(),
                            remount.bits()
                        ),
                        e,
                    )
                })?;
        }
    }

    Ok(())
}
