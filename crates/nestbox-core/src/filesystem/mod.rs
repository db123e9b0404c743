//! Filesystem management for container isolation.
//!
//! Provides the mount-tree primitives used around `pivot_root`: reading the
//! live mount table, unmounting subtrees, the basic pseudo-filesystem table,
//! block/bind/tmpfs mounts, and the pivot itself.
//!
//! Every mount goes through the [`Mounter`] trait so the ordering rules can be
//! exercised against a synthetic mount table.

pub mod basic;
pub mod block;
pub mod mount;
pub mod pivot_root;
pub mod table;
pub mod unmount;

use std::path::{Component, Path, PathBuf};

use nestbox_common::constants::PROC_MOUNTS;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::{FilesystemKind, FilesystemSpec};
use nix::mount::{MntFlags, MsFlags};

use self::block::FormatProbe;
use self::table::MountTable;

/// Access to the kernel mount API.
pub trait Mounter {
    /// Performs `mount(2)`.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by the kernel.
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fs_type: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()>;

    /// Performs a plain `umount(2)`.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by the kernel.
    fn unmount(&self, target: &Path) -> nix::Result<()>;

    /// Lazily detaches the mount at `target` with `MNT_DETACH`.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by the kernel.
    fn detach(&self, target: &Path) -> nix::Result<()>;

    /// Reads the current mount table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    fn mount_table(&self) -> Result<MountTable>;

    /// Whether `path` is itself a mount point.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be read.
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.mount_table()?.contains(path))
    }
}

/// [`Mounter`] backed by the real syscalls and `/proc/mounts`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fs_type: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        nix::mount::mount(source, target, fs_type, flags, data)
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        nix::mount::umount(target)
    }

    fn detach(&self, target: &Path) -> nix::Result<()> {
        nix::mount::umount2(target, MntFlags::MNT_DETACH)
    }

    fn mount_table(&self) -> Result<MountTable> {
        MountTable::read(Path::new(PROC_MOUNTS))
    }
}

/// Mounts one non-root filesystem entry after the pivot.
///
/// Host-provided sources ([`FilesystemKind::Mount`], [`FilesystemKind::Block`])
/// are looked up below `old_root`.
///
/// # Errors
///
/// Returns a configuration error for [`FilesystemKind::File`] entries, which
/// must have been turned into block devices before launch, or the error of the
/// underlying mount.
pub fn mount_filesystem(
    mounter: &dyn Mounter,
    probe: &dyn FormatProbe,
    fs: &FilesystemSpec,
    old_root: &Path,
    mount_options: &str,
) -> Result<()> {
    match fs.kind {
        FilesystemKind::Mount => mount::mount_bind(mounter, fs, old_root),
        FilesystemKind::Block => block::mount_block(mounter, probe, fs, old_root, mount_options),
        FilesystemKind::Ram => mount::mount_tmpfs(mounter, fs, mount_options),
        FilesystemKind::Bind => mount::mount_bind(mounter, fs, Path::new("")),
        FilesystemKind::File => Err(NestboxError::config(format!(
            "unexpected filesystem type {} for {}",
            fs.kind,
            fs.destination.display()
        ))),
    }
}

/// Concatenates a source prefix and an absolute path, like `"{prefix}{path}"`.
#[must_use]
pub fn prefixed(prefix: &Path, path: &Path) -> PathBuf {
    if prefix.as_os_str().is_empty() {
        return path.to_path_buf();
    }
    let relative: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    prefix.join(relative)
}

/// Creates `path` and its parents.
pub(crate) fn make_path(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| NestboxError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Turns optional security mount options into `mount(2)` data.
pub(crate) fn mount_data(options: &str) -> Option<&str> {
    if options.is_empty() { None } else { Some(options) }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording [`Mounter`] used by the unit tests of this crate.

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    use nestbox_common::error::Result;
    use nix::errno::Errno;
    use nix::mount::MsFlags;

    use super::Mounter;
    use super::table::MountTable;

    /// One recorded kernel call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Mount {
            source: Option<PathBuf>,
            target: PathBuf,
            fs_type: Option<String>,
            flags: MsFlags,
            data: Option<String>,
        },
        Unmount(PathBuf),
        Detach(PathBuf),
    }

    #[derive(Debug, Default)]
    pub struct FakeMounter {
        pub table: String,
        pub calls: RefCell<Vec<Call>>,
        pub mount_errors: HashMap<(PathBuf, Option<String>), Errno>,
        pub remount_errors: HashMap<PathBuf, Errno>,
        pub unmount_errors: HashMap<PathBuf, Errno>,
        pub detach_errors: HashMap<PathBuf, Errno>,
        pub reject_remount: bool,
    }

    impl FakeMounter {
        pub fn with_table(table: &str) -> Self {
            Self {
                table: table.to_string(),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        pub fn mounts(&self) -> Vec<(PathBuf, MsFlags)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Mount { target, flags, .. } => Some((target, flags)),
                    _ => None,
                })
                .collect()
        }

        /// Targets that were mounted twice without being unmounted in between
        /// fail with `EBUSY`, like a second non-remount mount of a
        /// pseudo-filesystem onto a busy target would.
        fn already_mounted(&self, target: &Path) -> bool {
            self.calls.borrow().iter().any(|c| {
                matches!(c, Call::Mount { target: t, flags, .. }
                    if t == target && !flags.contains(MsFlags::MS_REMOUNT))
            })
        }
    }

    impl Mounter for FakeMounter {
        fn mount(
            &self,
            source: Option<&Path>,
            target: &Path,
            fs_type: Option<&str>,
            flags: MsFlags,
            data: Option<&str>,
        ) -> nix::Result<()> {
            let key = (target.to_path_buf(), fs_type.map(str::to_string));
            let busy = self.reject_remount
                && !flags.contains(MsFlags::MS_REMOUNT)
                && self.already_mounted(target);
            self.calls.borrow_mut().push(Call::Mount {
                source: source.map(Path::to_path_buf),
                target: target.to_path_buf(),
                fs_type: fs_type.map(str::to_string),
                flags,
                data: data.map(str::to_string),
            });
            if busy {
                return Err(Errno::EBUSY);
            }
            if flags.contains(MsFlags::MS_REMOUNT) {
                if let Some(e) = self.remount_errors.get(target) {
                    return Err(*e);
                }
            }
            self.mount_errors.get(&key).map_or(Ok(()), |e| Err(*e))
        }

        fn unmount(&self, target: &Path) -> nix::Result<()> {
            self.calls
                .borrow_mut()
                .push(Call::Unmount(target.to_path_buf()));
            self.unmount_errors.get(target).map_or(Ok(()), |e| Err(*e))
        }

        fn detach(&self, target: &Path) -> nix::Result<()> {
            self.calls
                .borrow_mut()
                .push(Call::Detach(target.to_path_buf()));
            self.detach_errors.get(target).map_or(Ok(()), |e| Err(*e))
        }

        fn mount_table(&self) -> Result<MountTable> {
            Ok(MountTable::parse(&self.table))
        }
    }
}
