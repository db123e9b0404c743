//! Population of the container's `/dev`.
//!
//! The supervisor stages a tmpfs `/dev` and a private devpts instance under
//! the state directory. After the pivot they are mounted into place and the
//! usual links and tty aliases are created on top.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::{OpenOptionsExt, symlink};
use std::path::{Path, PathBuf};

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::layout::{StateLayout, under_old_root};
use nix::errno::Errno;
use nix::mount::MsFlags;

use crate::filesystem::{Mounter, make_path};

/// Fixed links into `/proc/self/fd`, as `(target, link name)`.
const FD_LINKS: [(&str, &str); 4] = [
    ("/proc/self/fd/0", "stdin"),
    ("/proc/self/fd/1", "stdout"),
    ("/proc/self/fd/2", "stderr"),
    ("/proc/self/fd", "fd"),
];

/// Mounts the staged `/dev` and `/dev/pts` from the preserved old root.
///
/// With a user namespace the staged mounts belong to the parent namespace
/// and can only be bound, otherwise they are moved.
///
/// # Errors
///
/// Returns an error if a mount point cannot be created or a mount fails.
pub fn mount_staged_devices(
    mounter: &dyn Mounter,
    layout: &StateLayout,
    user_namespace: bool,
) -> Result<()> {
    let (flags, how) = if user_namespace {
        (MsFlags::MS_BIND, "bind")
    } else {
        (MsFlags::MS_MOVE, "move")
    };

    for (staged, target) in [(layout.dev(), "/dev"), (layout.devpts(), "/dev/pts")] {
        let source = under_old_root(&staged);
        let target = Path::new(target);
        make_path(target)?;

        tracing::debug!(src = %source.display(), dst = %target.display(), how, "mounting staged devices");
        mounter
            .mount(Some(&source), target, None, flags, None)
            .map_err(|e| {
                NestboxError::syscall(
                    format!("failed to mount {} on {}", source.display(), target.display()),
                    e,
                )
            })?;
    }
    Ok(())
}

/// Creates the standard links, the `ptmx` node and tty aliases in `dev_dir`.
///
/// `tty_paths[i]` becomes `tty{i+1}`; the first one is also the console.
///
/// # Errors
///
/// Returns a syscall error if a link or node cannot be created or the
/// private `ptmx` cannot be bound.
pub fn populate_device_nodes(
    mounter: &dyn Mounter,
    dev_dir: &Path,
    tty_paths: &[PathBuf],
) -> Result<()> {
    for (target, name) in FD_LINKS {
        link(Path::new(target), &dev_dir.join(name))?;
    }

    let ptmx = dev_dir.join("ptmx");
    touch(&ptmx)?;
    let private_ptmx = dev_dir.join("pts/ptmx");
    mounter
        .mount(Some(&private_ptmx), &ptmx, Some("ptmx"), MsFlags::MS_BIND, None)
        .map_err(|e| {
            NestboxError::syscall(
                format!(
                    "failed to bind {} on to {}",
                    private_ptmx.display(),
                    ptmx.display()
                ),
                e,
            )
        })?;

    for (i, tty) in tty_paths.iter().enumerate() {
        link(tty, &dev_dir.join(format!("tty{}", i + 1)))?;
        if i == 0 {
            link(tty, &dev_dir.join("console"))?;
        }
    }

    tracing::debug!(ttys = tty_paths.len(), "populated device nodes");
    Ok(())
}

fn link(target: &Path, name: &Path) -> Result<()> {
    symlink(target, name).map_err(|e| {
        NestboxError::syscall(
            format!(
                "failed to symlink {} to {}",
                name.display(),
                target.display()
            ),
            errno_of(&e),
        )
    })
}

fn touch(path: &Path) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)
        .map(drop)
        .map_err(|e| NestboxError::syscall(format!("failed to create {}", path.display()), errno_of(&e)))
}

pub(crate) fn errno_of(err: &io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}
