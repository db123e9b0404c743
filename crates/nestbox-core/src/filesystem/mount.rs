//! Bind and tmpfs mounts, plus read-only enforcement of the new root.

use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nestbox_common::constants::OLD_ROOT_PATH;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::layout::{StateLayout, under_old_root};
use nestbox_common::types::FilesystemSpec;
use nix::mount::MsFlags;

use super::basic::is_basic_mount_location;
use super::{Mounter, make_path, mount_data, prefixed};

/// Bind-mounts `source_prefix + fs.source` onto `fs.destination`.
///
/// A missing destination is created as a directory or an empty file,
/// whichever matches the source.
///
/// # Errors
///
/// Returns an error if the source cannot be inspected, the destination cannot
/// be created, or either the bind or the read-only remount fails.
pub fn mount_bind(mounter: &dyn Mounter, fs: &FilesystemSpec, source_prefix: &Path) -> Result<()> {
    let src = prefixed(source_prefix, fs.source_path());
    let dst = &fs.destination;
    tracing::debug!(src = %src.display(), dst = %dst.display(), "bind mount");

    create_bind_target(&src, dst)?;

    mounter
        .mount(Some(&src), dst, None, MsFlags::MS_BIND, None)
        .map_err(|e| {
            NestboxError::syscall(
                format!(
                    "failed to bind mount directory {} to {}",
                    src.display(),
                    dst.display()
                ),
                e,
            )
        })?;

    if fs.readonly {
        tracing::debug!(dst = %dst.display(), "binding readonly");
        remount_readonly(mounter, &src, dst, MsFlags::empty())?;
    }
    Ok(())
}

fn create_bind_target(src: &Path, dst: &Path) -> Result<()> {
    match std::fs::metadata(dst) {
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(NestboxError::Io {
                path: dst.to_path_buf(),
                source: e,
            });
        }
    }

    let meta = std::fs::metadata(src).map_err(|e| NestboxError::Io {
        path: src.to_path_buf(),
        source: e,
    })?;
    if meta.is_dir() {
        return make_path(dst);
    }

    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(dst)
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(NestboxError::Io {
            path: dst.to_path_buf(),
            source: e,
        }),
    }
}

/// Mounts a tmpfs limited to `fs.size_limit` bytes at `fs.destination`.
///
/// # Errors
///
/// Returns an error if the destination cannot be created or a mount fails.
pub fn mount_tmpfs(mounter: &dyn Mounter, fs: &FilesystemSpec, mount_options: &str) -> Result<()> {
    let dst = &fs.destination;
    let data = tmpfs_data(fs.size_limit, mount_options);
    tracing::debug!(dst = %dst.display(), data = %data, "mounting tmpfs");

    make_path(dst)?;
    mounter
        .mount(
            Some(Path::new("tmpfs")),
            dst,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(&data),
        )
        .map_err(|e| {
            NestboxError::syscall(
                format!("failed to mount directory {} as tmpfs", dst.display()),
                e,
            )
        })?;

    if fs.readonly {
        tracing::debug!(dst = %dst.display(), "binding readonly");
        remount_readonly(mounter, dst, dst, MsFlags::empty())?;
    }
    Ok(())
}

fn tmpfs_data(size_limit: u64, mount_options: &str) -> String {
    match mount_data(mount_options) {
        Some(opts) => format!("size={size_limit},{opts}"),
        None => format!("size={size_limit}"),
    }
}

/// Bind-remounts `dst` read-only. `extra` is OR'ed into the flags.
pub(crate) fn remount_readonly(
    mounter: &dyn Mounter,
    src: &Path,
    dst: &Path,
    extra: MsFlags,
) -> Result<()> {
    let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | extra;
    mounter.mount(Some(src), dst, None, flags, None).map_err(|e| {
        NestboxError::syscall(format!("failed to make {} readonly", dst.display()), e)
    })
}

/// Remounts every mount of the new root read-only.
///
/// `/` itself, the preserved old root and the basic mounts are left alone.
/// Paths are processed in reverse lexicographic order so that, for the usual
/// nested layouts, children are handled before their ancestors.
///
/// # Errors
///
/// Returns an error if the mount table cannot be read or a remount fails.
pub fn enforce_readonly_root(mounter: &dyn Mounter) -> Result<()> {
    let table = mounter.mount_table()?;
    let mut mounts: Vec<PathBuf> = table
        .entries()
        .iter()
        .map(|e| e.target.clone())
        .filter(|p| !skip_readonly(p))
        .collect();
    mounts.sort_by(|a, b| bytes(b).cmp(bytes(a)));
    mounts.dedup();

    for mount in &mounts {
        tracing::debug!(path = %mount.display(), "bind readonly");
        remount_readonly(mounter, mount, mount, MsFlags::MS_REC)?;
    }
    Ok(())
}

fn skip_readonly(path: &Path) -> bool {
    path == Path::new("/")
        || path.starts_with(OLD_ROOT_PATH)
        || is_basic_mount_location(path)
}

fn bytes(path: &Path) -> &[u8] {
    OsStr::as_bytes(path.as_os_str())
}

/// Binds the staged meminfo snapshot over `/proc/meminfo`.
///
/// # Errors
///
/// Returns an error if the bind mount fails.
pub fn bind_meminfo(mounter: &dyn Mounter, layout: &StateLayout) -> Result<()> {
    let snapshot = under_old_root(&layout.meminfo());
    let target = Path::new("/proc/meminfo");
    tracing::debug!(src = %snapshot.display(), "mount /proc/meminfo");
    mounter
        .mount(Some(&snapshot), target, None, MsFlags::MS_BIND, None)
        .map_err(|e| {
            NestboxError::syscall(
                format!("failed to mount {} on /proc/meminfo", snapshot.display()),
                e,
            )
        })
}
