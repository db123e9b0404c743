//! Launch specification types.
//!
//! The supervisor builds a [`ContainerLaunchSpec`] before duplicating the
//! child; the child only ever reads its own copy of it.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Complete description of one container launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLaunchSpec {
    /// Container name, also used to locate its staging directories.
    pub name: String,
    /// Container UUID, exported to the init program.
    pub uuid: Uuid,
    /// Target CPU architecture.
    #[serde(default = "default_arch")]
    pub arch: String,
    /// Filesystems to mount. Exactly one targets `/`.
    #[serde(default)]
    pub filesystems: Vec<FilesystemSpec>,
    /// Optional uid/gid mapping. When active a user namespace is used.
    #[serde(default)]
    pub idmap: IdentityMap,
    /// Enabled features.
    #[serde(default)]
    pub features: BTreeSet<Feature>,
    /// Program executed as the container's init.
    pub init: InitProgram,
    /// Host-side network devices configured for the container.
    #[serde(default)]
    pub net_devices: Vec<String>,
    /// Host devices delegated to the container.
    #[serde(default)]
    pub hostdevs: Vec<HostDevice>,
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}

impl ContainerLaunchSpec {
    /// Returns the filesystem entry mounted at `/`, if any.
    #[must_use]
    pub fn root_filesystem(&self) -> Option<&FilesystemSpec> {
        self.filesystems.iter().find(|fs| fs.is_root())
    }

    /// Whether the given feature is enabled.
    #[must_use]
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Whether the container needs its own network namespace.
    ///
    /// True when network devices are configured, private networking is on,
    /// or a network interface is delegated as a host device.
    #[must_use]
    pub fn needs_network_namespace(&self) -> bool {
        !self.net_devices.is_empty()
            || self.has_feature(Feature::PrivateNetwork)
            || self.hostdevs.iter().any(HostDevice::is_network)
    }
}

/// Kind of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    /// Bind mount of a host directory, resolved under the preserved old root.
    Mount,
    /// Block device with auto-detected filesystem type.
    Block,
    /// Size-limited tmpfs.
    Ram,
    /// Bind mount of a path already visible inside the container.
    Bind,
    /// Image file. Must have been attached to a loop device and turned into
    /// [`FilesystemKind::Block`] by the supervisor before launch.
    File,
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mount => write!(f, "mount"),
            Self::Block => write!(f, "block"),
            Self::Ram => write!(f, "ram"),
            Self::Bind => write!(f, "bind"),
            Self::File => write!(f, "file"),
        }
    }
}

/// A filesystem to make visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSpec {
    /// How the filesystem is provided.
    pub kind: FilesystemKind,
    /// Source path. Unused for [`FilesystemKind::Ram`].
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Mount point inside the container.
    pub destination: PathBuf,
    /// Mount read-only.
    #[serde(default)]
    pub readonly: bool,
    /// tmpfs size limit in bytes.
    #[serde(default)]
    pub size_limit: u64,
}

impl FilesystemSpec {
    /// Whether this entry provides the container root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.destination == Path::new("/")
    }

    /// Returns the source path or an empty path for source-less entries.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        self.source.as_deref().unwrap_or_else(|| Path::new(""))
    }
}

/// One contiguous id range mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapEntry {
    /// First id inside the container.
    pub start: u32,
    /// First id on the host.
    pub target: u32,
    /// Number of ids in the range.
    pub count: u32,
}

impl fmt::Display for IdMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.start, self.target, self.count)
    }
}

/// uid and gid mappings for a user namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMap {
    /// uid ranges.
    #[serde(default)]
    pub uid: Vec<IdMapEntry>,
    /// gid ranges.
    #[serde(default)]
    pub gid: Vec<IdMapEntry>,
}

impl IdentityMap {
    /// A map is only usable when both uid and gid ranges are given.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.uid.is_empty() && !self.gid.is_empty()
    }
}

/// Optional container features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Give the container a network namespace even without interfaces.
    PrivateNetwork,
}

/// The program run as PID 1 inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitProgram {
    /// Absolute path inside the new root.
    pub path: PathBuf,
    /// Arguments, not including the program name.
    #[serde(default)]
    pub args: Vec<String>,
    /// Raw kernel-style command line exported to the init program.
    #[serde(default)]
    pub cmdline: Option<String>,
}

/// A host device delegated to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostDevice {
    /// Block device node.
    Storage {
        /// Device node path.
        block: PathBuf,
    },
    /// Character device node.
    Misc {
        /// Device node path.
        chardev: PathBuf,
    },
    /// Network interface moved into the container.
    Net {
        /// Interface name on the host.
        interface: String,
    },
}

impl HostDevice {
    /// Whether the device is a network interface.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Net { .. })
    }
}
