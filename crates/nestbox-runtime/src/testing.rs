//! Fixtures shared by the unit tests of this crate.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nestbox_common::error::Result;
use nestbox_common::types::{
    ContainerLaunchSpec, FilesystemKind, FilesystemSpec, IdentityMap, InitProgram,
};
use nestbox_core::filesystem::Mounter;
use nestbox_core::filesystem::table::MountTable;
use nix::mount::MsFlags;
use uuid::Uuid;

/// A recorded kernel call. Filesystem types and data are left out; the
/// core crate tests those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Mount {
        source: Option<PathBuf>,
        target: PathBuf,
        flags: MsFlags,
    },
    Unmount(PathBuf),
    Detach(PathBuf),
}

/// [`Mounter`] over a fixed mount table that records every call.
#[derive(Debug, Default)]
pub struct RecordingMounter {
    table: String,
    calls: RefCell<Vec<Recorded>>,
}

impl RecordingMounter {
    pub fn with_table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            calls: RefCell::default(),
        }
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.calls.borrow().clone()
    }

    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.recorded()
            .into_iter()
            .filter_map(|c| match c {
                Recorded::Unmount(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

impl Mounter for RecordingMounter {
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        _fs_type: Option<&str>,
        flags: MsFlags,
        _data: Option<&str>,
    ) -> nix::Result<()> {
        self.calls.borrow_mut().push(Recorded::Mount {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            flags,
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        self.calls
            .borrow_mut()
            .push(Recorded::Unmount(target.to_path_buf()));
        Ok(())
    }

    fn detach(&self, target: &Path) -> nix::Result<()> {
        self.calls
            .borrow_mut()
            .push(Recorded::Detach(target.to_path_buf()));
        Ok(())
    }

    fn mount_table(&self) -> Result<MountTable> {
        Ok(MountTable::parse(&self.table))
    }
}

/// A minimal launch spec with a host-directory root.
pub fn spec(name: &str) -> ContainerLaunchSpec {
    ContainerLaunchSpec {
        name: name.to_string(),
        uuid: Uuid::new_v4(),
        arch: "x86_64".to_string(),
        filesystems: vec![FilesystemSpec {
            kind: FilesystemKind::Mount,
            source: Some(PathBuf::from("/srv/containers/web")),
            destination: PathBuf::from("/"),
            readonly: false,
            size_limit: 0,
        }],
        idmap: IdentityMap::default(),
        features: BTreeSet::new(),
        init: InitProgram {
            path: PathBuf::from("/sbin/init"),
            args: Vec::new(),
            cmdline: None,
        },
        net_devices: Vec::new(),
        hostdevs: Vec::new(),
    }
}
