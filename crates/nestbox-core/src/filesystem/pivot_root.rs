//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! The new root is bind-mounted onto a directory inside a throwaway tmpfs,
//! because `pivot_root` needs the new and old roots on different mounts.
//! After the switch the complete host tree sits at `/.oldroot` until the
//! caller tears it down.

use std::path::{Path, PathBuf};

use nestbox_common::constants::OLD_ROOT_DIR;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::layout::StateLayout;
use nestbox_common::types::{FilesystemKind, FilesystemSpec};
use nix::mount::MsFlags;

use super::block::{FormatProbe, mount_block};
use super::mount::remount_readonly;
use super::{Mounter, make_path};

/// Returns the directory that will become the container root.
///
/// A block device root is mounted at the layout's `<name>.root` first.
///
/// # Errors
///
/// Returns a configuration error for root kinds that cannot provide a
/// directory (plain image files must be attached to a loop device before
/// launch), or the error of mounting a block device root.
pub fn prepare_root(
    mounter: &dyn Mounter,
    probe: &dyn FormatProbe,
    layout: &StateLayout,
    root: &FilesystemSpec,
    mount_options: &str,
) -> Result<PathBuf> {
    match root.kind {
        FilesystemKind::Mount | FilesystemKind::Bind => Ok(root.source_path().to_path_buf()),
        FilesystemKind::Block => {
            let staged = FilesystemSpec {
                destination: layout.root(),
                ..root.clone()
            };
            mount_block(mounter, probe, &staged, Path::new(""), mount_options)?;
            Ok(staged.destination)
        }
        FilesystemKind::File | FilesystemKind::Ram => Err(NestboxError::config(format!(
            "unsupported root filesystem type {}",
            root.kind
        ))),
    }
}

/// Makes `root_src` the process root, leaving the old one at `/.oldroot`.
///
/// # Errors
///
/// Returns an error if any mount, `chdir` or `pivot_root` step fails. None of
/// them are retried.
pub fn pivot_into(mounter: &dyn Mounter, root_src: &Path, readonly: bool) -> Result<()> {
    tracing::debug!(root = %root_src.display(), "pivot via");
    let new_root = stage_new_root(mounter, root_src, readonly)?;
    switch_root(&new_root)
}

/// Steps before the actual pivot. Returns `<root_src>/.oldroot/new`.
pub(crate) fn stage_new_root(
    mounter: &dyn Mounter,
    root_src: &Path,
    readonly: bool,
) -> Result<PathBuf> {
    mounter
        .mount(
            Some(Path::new("")),
            Path::new("/"),
            None,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| NestboxError::syscall("failed to make root private", e))?;

    let old_root = root_src.join(OLD_ROOT_DIR);
    make_path(&old_root)?;

    mounter
        .mount(
            Some(Path::new("tmprootfs")),
            &old_root,
            Some("tmpfs"),
            MsFlags::empty(),
            None,
        )
        .map_err(|e| {
            NestboxError::syscall(
                format!("failed to mount empty tmpfs at {}", old_root.display()),
                e,
            )
        })?;

    let new_root = old_root.join("new");
    make_path(&new_root)?;

    mounter
        .mount(
            Some(root_src),
            &new_root,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| {
            NestboxError::syscall(
                format!(
                    "failed to bind {} to new root {}",
                    root_src.display(),
                    new_root.display()
                ),
                e,
            )
        })?;

    if readonly {
        remount_readonly(mounter, root_src, &new_root, MsFlags::MS_REC)?;
    }

    Ok(new_root)
}

fn switch_root(new_root: &Path) -> Result<()> {
    nix::unistd::chdir(new_root).map_err(|e| {
        NestboxError::syscall(format!("failed to chdir into {}", new_root.display()), e)
    })?;

    nix::unistd::pivot_root(".", OLD_ROOT_DIR)
        .map_err(|e| NestboxError::syscall("failed to pivot root", e))?;

    // cwd is unspecified after pivot_root
    nix::unistd::chdir("/").map_err(|e| NestboxError::syscall("failed to chdir to /", e))?;

    tracing::info!("pivoted into new root");
    Ok(())
}
