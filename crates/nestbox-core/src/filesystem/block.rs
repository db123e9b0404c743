//! Block device mounts with filesystem type detection.
//!
//! The type is sniffed from the superblock first. When that yields nothing,
//! every candidate listed in `/etc/filesystems` (then `/proc/filesystems`) is
//! tried in turn, like util-linux `mount -t auto` does.

use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::FilesystemSpec;
use nix::errno::Errno;
use nix::mount::MsFlags;

use super::{Mounter, make_path, mount_data, prefixed};

const ETC_FILESYSTEMS: &str = "/etc/filesystems";
const PROC_FILESYSTEMS: &str = "/proc/filesystems";

/// Detects the filesystem type stored on a device.
pub trait FormatProbe {
    /// Returns the filesystem type name, or `None` when the content is not
    /// recognised.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be read.
    fn probe(&self, device: &Path) -> Result<Option<String>>;
}

/// [`FormatProbe`] that looks for well-known superblock magic numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuperblockProbe;

/// `(offset, magic, type)` triples, checked in order.
const SIGNATURES: &[(u64, &[u8], &str)] = &[
    (0, b"hsqs", "squashfs"),
    (0, b"XFSB", "xfs"),
    (1080, &[0x53, 0xEF], "ext4"),
    (0x1_0040, b"_BHRfS_M", "btrfs"),
];

impl FormatProbe for SuperblockProbe {
    fn probe(&self, device: &Path) -> Result<Option<String>> {
        let file = File::open(device).map_err(|e| NestboxError::Io {
            path: device.to_path_buf(),
            source: e,
        })?;

        for (offset, magic, fs_type) in SIGNATURES {
            let mut buf = vec![0u8; magic.len()];
            match file.read_exact_at(&mut buf, *offset) {
                Ok(()) if buf == *magic => {
                    tracing::debug!(device = %device.display(), fs_type, "detected filesystem");
                    return Ok(Some((*fs_type).to_string()));
                }
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {}
                Err(e) => {
                    return Err(NestboxError::Io {
                        path: device.to_path_buf(),
                        source: e,
                    });
                }
            }
        }
        Ok(None)
    }
}

/// Candidate filesystem types read from a `filesystems` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemList {
    /// Types to try, in file order.
    pub types: Vec<String>,
    /// The list ended in `*`: continue with `/proc/filesystems`.
    pub wildcard: bool,
}

impl FilesystemList {
    /// Parses a `filesystems` file. `nodev` entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `*` appears anywhere but on the last
    /// line while `allow_wildcard` is set.
    pub fn parse(source: &Path, content: &str, allow_wildcard: bool) -> Result<Self> {
        let mut list = Self::default();
        for line in content.lines() {
            if line.contains("nodev") {
                continue;
            }
            let fs_type = line.trim();
            if fs_type.is_empty() {
                continue;
            }
            if list.wildcard {
                return Err(NestboxError::config(format!(
                    "{} has unexpected '*' before last line",
                    source.display()
                )));
            }
            if allow_wildcard && fs_type == "*" {
                list.wildcard = true;
                continue;
            }
            list.types.push(fs_type.to_string());
        }
        Ok(list)
    }
}

/// Mounts a block device from `source_prefix` at the entry's destination.
///
/// # Errors
///
/// Returns an I/O error if the destination cannot be created or the device
/// cannot be probed, a syscall error if mounting with a detected type fails,
/// or [`NestboxError::FilesystemDetection`] if no candidate type mounts.
pub fn mount_block(
    mounter: &dyn Mounter,
    probe: &dyn FormatProbe,
    fs: &FilesystemSpec,
    source_prefix: &Path,
    mount_options: &str,
) -> Result<()> {
    let device = prefixed(source_prefix, fs.source_path());
    tracing::debug!(src = %device.display(), dst = %fs.destination.display(), "mounting block device");

    let flags = if fs.readonly {
        MsFlags::MS_RDONLY
    } else {
        MsFlags::empty()
    };
    make_path(&fs.destination)?;

    if let Some(format) = probe.probe(&device)? {
        tracing::debug!(format = %format, opts = mount_options, "mounting with detected format");
        return mounter
            .mount(
                Some(&device),
                &fs.destination,
                Some(&format),
                flags,
                mount_data(mount_options),
            )
            .map_err(|e| {
                NestboxError::syscall(
                    format!(
                        "failed to mount device {} to {} as {format}",
                        device.display(),
                        fs.destination.display()
                    ),
                    e,
                )
            });
    }

    mount_block_auto(mounter, fs, &device, flags, source_prefix, mount_options)
}

fn mount_block_auto(
    mounter: &dyn Mounter,
    fs: &FilesystemSpec,
    device: &Path,
    flags: MsFlags,
    source_prefix: &Path,
    mount_options: &str,
) -> Result<()> {
    let etc = prefixed(source_prefix, Path::new(ETC_FILESYSTEMS));
    let proc = prefixed(source_prefix, Path::new(PROC_FILESYSTEMS));

    let consult_proc = match read_list(&etc, true)? {
        Some(list) => {
            if try_types(mounter, fs, device, flags, mount_options, &list.types)? {
                return Ok(());
            }
            list.wildcard
        }
        None => true,
    };

    if consult_proc {
        let list = read_list(&proc, false)?.ok_or_else(|| NestboxError::NotFound {
            kind: "filesystem list",
            id: proc.display().to_string(),
        })?;
        if try_types(mounter, fs, device, flags, mount_options, &list.types)? {
            return Ok(());
        }
    }

    Err(NestboxError::FilesystemDetection {
        device: device.to_path_buf(),
        target: fs.destination.clone(),
    })
}

/// Reads a list file; `Ok(None)` when it does not exist.
fn read_list(path: &Path, allow_wildcard: bool) -> Result<Option<FilesystemList>> {
    tracing::debug!(path = %path.display(), "reading filesystem list");
    match std::fs::read_to_string(path) {
        Ok(content) => FilesystemList::parse(path, &content, allow_wildcard).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(NestboxError::Io {
            path: PathBuf::from(path),
            source: e,
        }),
    }
}

/// Tries each type in order. `EINVAL` and `ENODEV` mean "wrong type, keep
/// going"; anything else aborts.
fn try_types(
    mounter: &dyn Mounter,
    fs: &FilesystemSpec,
    device: &Path,
    flags: MsFlags,
    mount_options: &str,
    types: &[String],
) -> Result<bool> {
    for fs_type in types {
        tracing::debug!(
            src = %device.display(),
            dst = %fs.destination.display(),
            fs_type = %fs_type,
            "trying mount"
        );
        match mounter.mount(
            Some(device),
            &fs.destination,
            Some(fs_type),
            flags,
            mount_data(mount_options),
        ) {
            Ok(()) => return Ok(true),
            Err(Errno::EINVAL | Errno::ENODEV) => {}
            Err(e) => {
                return Err(NestboxError::syscall(
                    format!(
                        "failed to mount device {} to {}",
                        device.display(),
                        fs.destination.display()
                    ),
                    e,
                ));
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use nestbox_common::types::FilesystemKind;

    use super::*;
    use crate::filesystem::testing::{Call, FakeMounter};

    struct Unknown;

    impl FormatProbe for Unknown {
        fn probe(&self, _device: &Path) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn block(dst: PathBuf) -> FilesystemSpec {
        FilesystemSpec {
            kind: FilesystemKind::Block,
            source: Some("/dev/sdb1".into()),
            destination: dst,
            readonly: false,
            size_limit: 0,
        }
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn tried_types(mounter: &FakeMounter) -> Vec<String> {
        mounter
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Mount { fs_type, .. } => fs_type,
                _ => None,
            })
            .collect()
    }

    #[test]
    fn parse_skips_nodev_and_blank_lines() {
        let list = FilesystemList::parse(
            Path::new(PROC_FILESYSTEMS),
            "nodev\tsysfs\n\text4\n\n\tvfat\nnodev\ttmpfs\n",
            false,
        )
        .unwrap();
        assert_eq!(list.types, vec!["ext4", "vfat"]);
        assert!(!list.wildcard);
    }

    #[test]
    fn parse_accepts_trailing_wildcard() {
        let list = FilesystemList::parse(Path::new(ETC_FILESYSTEMS), "ext4\nxfs\n*\n", true).unwrap();
        assert_eq!(list.types, vec!["ext4", "xfs"]);
        assert!(list.wildcard);
    }

    #[test]
    fn parse_rejects_wildcard_before_last_line() {
        let err = FilesystemList::parse(Path::new(ETC_FILESYSTEMS), "*\next4\n", true).unwrap_err();
        assert!(matches!(err, NestboxError::Config { .. }));
    }

    #[test]
    fn auto_detection_falls_back_on_invalid_argument() {
        let prefix = tempfile::tempdir().unwrap();
        write(prefix.path(), "proc/filesystems", "nodev\tproc\n\text4\n\tvfat\n");
        let dst = prefix.path().join("data");

        let mut mounter = FakeMounter::default();
        let _ = mounter
            .mount_errors
            .insert((dst.clone(), Some("ext4".into())), Errno::EINVAL);

        mount_block(&mounter, &Unknown, &block(dst), prefix.path(), "").unwrap();
        assert_eq!(tried_types(&mounter), vec!["ext4", "vfat"]);
    }

    #[test]
    fn auto_detection_stops_at_first_success() {
        let prefix = tempfile::tempdir().unwrap();
        write(prefix.path(), "proc/filesystems", "\text4\n\tvfat\n");
        let dst = prefix.path().join("data");

        let mounter = FakeMounter::default();
        mount_block(&mounter, &Unknown, &block(dst), prefix.path(), "").unwrap();
        assert_eq!(tried_types(&mounter), vec!["ext4"]);
    }

    #[test]
    fn other_errors_abort_detection() {
        let prefix = tempfile::tempdir().unwrap();
        write(prefix.path(), "proc/filesystems", "\text4\n\tvfat\n");
        let dst = prefix.path().join("data");

        let mut mounter = FakeMounter::default();
        let _ = mounter
            .mount_errors
            .insert((dst.clone(), Some("ext4".into())), Errno::EACCES);

        let err = mount_block(&mounter, &Unknown, &block(dst), prefix.path(), "").unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EACCES));
        assert_eq!(tried_types(&mounter), vec!["ext4"]);
    }

    #[test]
    fn etc_list_with_wildcard_continues_with_proc() {
        let prefix = tempfile::tempdir().unwrap();
        write(prefix.path(), "etc/filesystems", "xfs\n*\n");
        write(prefix.path(), "proc/filesystems", "\text4\n");
        let dst = prefix.path().join("data");

        let mut mounter = FakeMounter::default();
        let _ = mounter
            .mount_errors
            .insert((dst.clone(), Some("xfs".into())), Errno::ENODEV);

        mount_block(&mounter, &Unknown, &block(dst), prefix.path(), "").unwrap();
        assert_eq!(tried_types(&mounter), vec!["xfs", "ext4"]);
    }

    #[test]
    fn etc_list_without_wildcard_is_final() {
        let prefix = tempfile::tempdir().unwrap();
        write(prefix.path(), "etc/filesystems", "xfs\n");
        write(prefix.path(), "proc/filesystems", "\text4\n");
        let dst = prefix.path().join("data");

        let mut mounter = FakeMounter::default();
        let _ = mounter
            .mount_errors
            .insert((dst.clone(), Some("xfs".into())), Errno::EINVAL);

        let err = mount_block(&mounter, &Unknown, &block(dst), prefix.path(), "").unwrap_err();
        assert!(matches!(err, NestboxError::FilesystemDetection { .. }));
    }

    #[test]
    fn detected_format_is_mounted_directly_and_readonly() {
        struct Xfs;
        impl FormatProbe for Xfs {
            fn probe(&self, _device: &Path) -> Result<Option<String>> {
                Ok(Some("xfs".into()))
            }
        }

        let prefix = tempfile::tempdir().unwrap();
        let mut fs = block(prefix.path().join("data"));
        fs.readonly = true;

        let mounter = FakeMounter::default();
        mount_block(&mounter, &Xfs, &fs, prefix.path(), "context=\"x\"").unwrap();
        assert_eq!(
            mounter.calls(),
            vec![Call::Mount {
                source: Some(prefix.path().join("dev/sdb1")),
                target: prefix.path().join("data"),
                fs_type: Some("xfs".into()),
                flags: MsFlags::MS_RDONLY,
                data: Some("context=\"x\"".into()),
            }]
        );
    }

    #[test]
    fn superblock_probe_recognises_magic() {
        let dir = tempfile::tempdir().unwrap();

        let squash = dir.path().join("squash.img");
        std::fs::write(&squash, b"hsqs\0\0\0\0").unwrap();
        assert_eq!(SuperblockProbe.probe(&squash).unwrap().as_deref(), Some("squashfs"));

        let ext = dir.path().join("ext.img");
        let mut image = vec![0u8; 2048];
        image[1080] = 0x53;
        image[1081] = 0xEF;
        std::fs::write(&ext, image).unwrap();
        assert_eq!(SuperblockProbe.probe(&ext).unwrap().as_deref(), Some("ext4"));

        let blank = dir.path().join("blank.img");
        std::fs::write(&blank, [0u8; 16]).unwrap();
        assert_eq!(SuperblockProbe.probe(&blank).unwrap(), None);
    }

    #[test]
    fn superblock_probe_reports_missing_device() {
        let err = SuperblockProbe
            .probe(Path::new("/nonexistent/device"))
            .unwrap_err();
        assert!(matches!(err, NestboxError::Io { .. }));
    }
}
