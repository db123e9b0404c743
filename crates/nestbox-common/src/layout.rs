//! Naming convention of the per-container staging directory.
//!
//! The supervisor prepares `/dev` and `/dev/pts` (and optionally a meminfo
//! snapshot) under the state directory before launch; the child picks them
//! up from the preserved old root after pivoting.

use std::path::{Component, Path, PathBuf};

use crate::constants::OLD_ROOT_PATH;

/// Staging paths for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    state_dir: PathBuf,
    name: String,
}

impl StateLayout {
    /// Creates the layout for container `name` under `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            name: name.into(),
        }
    }

    /// The state directory itself.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Staged `/dev` tmpfs.
    #[must_use]
    pub fn dev(&self) -> PathBuf {
        self.entry("dev")
    }

    /// Staged private devpts instance.
    #[must_use]
    pub fn devpts(&self) -> PathBuf {
        self.entry("devpts")
    }

    /// Mount point used for a block-device root before pivoting.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.entry("root")
    }

    /// Directory of virtualized `/proc` files.
    #[must_use]
    pub fn fuse(&self) -> PathBuf {
        self.entry("fuse")
    }

    /// Snapshot bound over `/proc/meminfo`.
    #[must_use]
    pub fn meminfo(&self) -> PathBuf {
        self.fuse().join("meminfo")
    }

    fn entry(&self, suffix: &str) -> PathBuf {
        self.state_dir.join(format!("{}.{suffix}", self.name))
    }
}

/// Returns where a host path is visible after pivoting, i.e. below
/// `/.oldroot`.
#[must_use]
pub fn under_old_root(path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    Path::new(OLD_ROOT_PATH).join(relative)
}
