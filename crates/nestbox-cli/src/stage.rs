//! Host-side staging of the container's `/dev` and devpts instance.
//!
//! The child picks both up from the preserved old root after pivoting, so
//! they must exist before the first handshake round.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::layout::StateLayout;
use nestbox_common::types::ContainerLaunchSpec;
use nestbox_core::filesystem::Mounter;
use nestbox_runtime::change_ownership;
use nix::mount::MsFlags;
use nix::sys::stat::{Mode, SFlag};

/// Character devices copied from the host `/dev`.
const DEVICE_NODES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];

const DEV_MOUNT_DATA: &str = "mode=755,size=65536";
const DEVPTS_MOUNT_DATA: &str = "newinstance,ptmxmode=0666,mode=0620";

/// Staging mounts of one container. Call [`StagedDevices::release`] once
/// the container is gone.
pub struct StagedDevices<'a> {
    mounter: &'a dyn Mounter,
    dev: PathBuf,
    devpts: PathBuf,
}

impl<'a> StagedDevices<'a> {
    /// Mounts and populates `<name>.dev` and `<name>.devpts`.
    ///
    /// Device numbers are taken from the nodes in `host_dev`. Anything
    /// already mounted is torn down again if a later step fails.
    ///
    /// # Errors
    ///
    /// Returns the first mount, node creation or ownership error.
    pub fn stage(
        mounter: &'a dyn Mounter,
        spec: &ContainerLaunchSpec,
        layout: &StateLayout,
        host_dev: &Path,
    ) -> Result<Self> {
        create_dir(layout.state_dir())?;
        let staged = Self {
            mounter,
            dev: layout.dev(),
            devpts: layout.devpts(),
        };
        if let Err(e) = staged.populate(spec, host_dev) {
            staged.release();
            return Err(e);
        }
        tracing::info!(dev = %staged.dev.display(), devpts = %staged.devpts.display(), "staged devices");
        Ok(staged)
    }

    fn populate(&self, spec: &ContainerLaunchSpec, host_dev: &Path) -> Result<()> {
        create_dir(&self.dev)?;
        self.mount(&self.dev, "tmpfs", MsFlags::MS_NOSUID, DEV_MOUNT_DATA)?;

        for name in DEVICE_NODES {
            let host = host_dev.join(name);
            let rdev = std::fs::metadata(&host)
                .map_err(|e| NestboxError::Io {
                    path: host.clone(),
                    source: e,
                })?
                .rdev();
            let node = self.dev.join(name);
            nix::sys::stat::mknod(&node, SFlag::S_IFCHR, Mode::from_bits_truncate(0o666), rdev)
                .map_err(|e| NestboxError::syscall(format!("failed to make device {}", node.display()), e))?;
            // mknod honours the umask
            std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o666)).map_err(|e| {
                NestboxError::Io {
                    path: node.clone(),
                    source: e,
                }
            })?;
        }
        create_dir(&self.dev.join("pts"))?;

        create_dir(&self.devpts)?;
        self.mount(
            &self.devpts,
            "devpts",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            DEVPTS_MOUNT_DATA,
        )?;

        change_ownership(spec, &self.dev)?;
        change_ownership(spec, &self.devpts)
    }

    fn mount(&self, target: &Path, fs_type: &str, flags: MsFlags, data: &str) -> Result<()> {
        tracing::debug!(target = %target.display(), fs_type, data, "staging mount");
        self.mounter
            .mount(Some(Path::new(fs_type)), target, Some(fs_type), flags, Some(data))
            .map_err(|e| {
                NestboxError::syscall(
                    format!("failed to mount {fs_type} on {}", target.display()),
                    e,
                )
            })
    }

    /// Detaches both staging mounts and removes their directories.
    /// Failures are logged and otherwise ignored.
    pub fn release(&self) {
        for path in [&self.devpts, &self.dev] {
            if self.mounter.is_mount_point(path).unwrap_or(true) {
                if let Err(e) = self.mounter.detach(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to detach staging mount");
                }
            }
            if let Err(e) = std::fs::remove_dir(path) {
                tracing::debug!(path = %path.display(), error = %e, "staging directory left behind");
            }
        }
    }
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| NestboxError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use nestbox_core::filesystem::table::MountTable;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ops: RefCell<Vec<String>>,
        mounted: RefCell<Vec<PathBuf>>,
    }

    impl Mounter for Recorder {
        fn mount(
            &self,
            _source: Option<&Path>,
            target: &Path,
            fs_type: Option<&str>,
            _flags: MsFlags,
            _data: Option<&str>,
        ) -> nix::Result<()> {
            self.ops
                .borrow_mut()
                .push(format!("mount {} {}", fs_type.unwrap_or("-"), target.display()));
            self.mounted.borrow_mut().push(target.to_path_buf());
            Ok(())
        }

        fn unmount(&self, target: &Path) -> nix::Result<()> {
            self.ops.borrow_mut().push(format!("umount {}", target.display()));
            Ok(())
        }

        fn detach(&self, target: &Path) -> nix::Result<()> {
            self.ops.borrow_mut().push(format!("detach {}", target.display()));
            Ok(())
        }

        fn mount_table(&self) -> Result<MountTable> {
            let table: String = self
                .mounted
                .borrow()
                .iter()
                .map(|p| format!("tmpfs {} tmpfs rw 0 0\n", p.display()))
                .collect();
            Ok(MountTable::parse(&table))
        }
    }

    fn spec() -> ContainerLaunchSpec {
        serde_json::from_str(
            r#"{
                "name": "web",
                "uuid": "3f2c1f4e-8d7b-4f0a-9b43-6f1d2a7c9e10",
                "init": { "path": "/sbin/init" }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn missing_host_node_rolls_back_dev_mount() {
        let state = tempfile::tempdir().unwrap();
        let host_dev = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(state.path(), "web");
        let mounter = Recorder::default();

        let err = StagedDevices::stage(&mounter, &spec(), &layout, host_dev.path())
            .err()
            .unwrap();
        assert!(matches!(err, NestboxError::Io { .. }));

        let dev = layout.dev();
        assert_eq!(
            *mounter.ops.borrow(),
            vec![
                format!("mount tmpfs {}", dev.display()),
                format!("detach {}", dev.display()),
            ]
        );
        assert!(!dev.exists());
    }
}
