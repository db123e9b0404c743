//! Making the container root the process root.
//!
//! Every step is fatal and none is retried: once the mount tree has been
//! partly rearranged there is no safe way back.

use std::path::{Path, PathBuf};

use nestbox_common::constants::{OLD_ROOT_PATH, SELINUX_MOUNT};
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::layout::StateLayout;
use nestbox_common::types::{ContainerLaunchSpec, FilesystemSpec};
use nestbox_core::device::{mount_staged_devices, populate_device_nodes};
use nestbox_core::filesystem::basic::apply_basic_mounts;
use nestbox_core::filesystem::block::FormatProbe;
use nestbox_core::filesystem::mount::{bind_meminfo, enforce_readonly_root};
use nestbox_core::filesystem::pivot_root::{pivot_into, prepare_root};
use nestbox_core::filesystem::unmount::unmount_subtree;
use nestbox_core::filesystem::{Mounter, mount_filesystem};

use crate::provider::CgroupProvider;

/// Drives the pivot and everything mounted around it.
pub struct RootPivotController<'a> {
    mounter: &'a dyn Mounter,
    probe: &'a dyn FormatProbe,
    cgroups: &'a dyn CgroupProvider,
    layout: &'a StateLayout,
    meminfo: bool,
    dev_dir: PathBuf,
}

impl<'a> RootPivotController<'a> {
    /// Creates a controller for one container.
    pub fn new(
        mounter: &'a dyn Mounter,
        probe: &'a dyn FormatProbe,
        cgroups: &'a dyn CgroupProvider,
        layout: &'a StateLayout,
    ) -> Self {
        Self {
            mounter,
            probe,
            cgroups,
            layout,
            meminfo: false,
            dev_dir: PathBuf::from("/dev"),
        }
    }

    /// Binds the staged meminfo snapshot over `/proc/meminfo`.
    #[must_use]
    pub const fn with_meminfo(mut self, enabled: bool) -> Self {
        self.meminfo = enabled;
        self
    }

    /// Creates the device links and tty aliases in `dev_dir` instead of
    /// `/dev`.
    #[must_use]
    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    /// Runs the whole sequence for `spec`.
    ///
    /// On success the process root is the container root, `/dev` is
    /// populated, every configured filesystem is mounted and nothing of the
    /// host tree remains visible.
    ///
    /// # Errors
    ///
    /// Returns the error of the first step that fails.
    pub fn run(
        &self,
        spec: &ContainerLaunchSpec,
        mount_options: &str,
        tty_paths: &[PathBuf],
    ) -> Result<()> {
        let root = spec
            .root_filesystem()
            .ok_or_else(|| NestboxError::NotFound {
                kind: "root filesystem",
                id: spec.name.clone(),
            })?;
        let root_src = prepare_root(self.mounter, self.probe, self.layout, root, mount_options)?;
        pivot_into(self.mounter, &root_src, root.readonly)?;

        self.populate_new_root(spec, root, mount_options, tty_paths)?;
        tracing::info!(name = %spec.name, "root filesystem ready");
        Ok(())
    }

    /// Everything after the pivot: host cleanup, basic and read-only mounts,
    /// meminfo, cgroups, devices, the remaining filesystems and finally the
    /// removal of `/.oldroot`.
    ///
    /// Containers with a user namespace keep the host's pseudo-filesystems
    /// under `/.oldroot` until the final unmount even when they share the
    /// host root.
    ///
    /// # Errors
    ///
    /// Returns the error of the first step that fails.
    pub fn populate_new_root(
        &self,
        spec: &ContainerLaunchSpec,
        root: &FilesystemSpec,
        mount_options: &str,
        tty_paths: &[PathBuf],
    ) -> Result<()> {
        let user_namespace = spec.idmap.is_active();

        if root.source_path() == Path::new("/") && !user_namespace {
            self.unmount_for_shared_root()?;
        }

        apply_basic_mounts(self.mounter, user_namespace)?;

        if root.readonly {
            enforce_readonly_root(self.mounter)?;
        }

        if self.meminfo {
            bind_meminfo(self.mounter, self.layout)?;
        }

        self.cgroups
            .reisolate_and_remount(self.mounter, Path::new(OLD_ROOT_PATH), mount_options)?;

        mount_staged_devices(self.mounter, self.layout, user_namespace)?;
        populate_device_nodes(self.mounter, &self.dev_dir, tty_paths)?;

        self.mount_remaining(&spec.filesystems, mount_options)?;

        unmount_subtree(self.mounter, Path::new(OLD_ROOT_PATH), true)
    }

    /// Removes host mounts that a container sharing the host root must not
    /// see. `/proc` goes last because the unmounts before it read
    /// `/proc/mounts`.
    ///
    /// # Errors
    ///
    /// Returns the first subtree that cannot be removed.
    pub fn unmount_for_shared_root(&self) -> Result<()> {
        let staged = [
            PathBuf::from(SELINUX_MOUNT),
            self.layout.dev(),
            self.layout.devpts(),
            self.layout.fuse(),
        ];
        let pseudo = ["/sys", "/dev", "/proc"].map(PathBuf::from);

        for prefix in staged.iter().chain(&pseudo) {
            unmount_subtree(self.mounter, prefix, false)?;
        }
        Ok(())
    }

    /// Mounts every non-root entry, clearing whatever already sits at its
    /// destination first.
    ///
    /// # Errors
    ///
    /// Returns the first unmount or mount error.
    pub fn mount_remaining(&self, filesystems: &[FilesystemSpec], mount_options: &str) -> Result<()> {
        tracing::debug!("mounting all non-root filesystems");
        for fs in filesystems.iter().filter(|fs| !fs.is_root()) {
            unmount_subtree(self.mounter, &fs.destination, false)?;
            mount_filesystem(
                self.mounter,
                self.probe,
                fs,
                Path::new(OLD_ROOT_PATH),
                mount_options,
            )?;
        }
        Ok(())
    }
}
