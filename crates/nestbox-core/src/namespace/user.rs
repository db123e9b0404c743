//! User namespace identity handling.
//!
//! The supervisor writes the uid/gid maps of a launched child; the child
//! then switches to root inside its namespace.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::{ContainerLaunchSpec, IdMapEntry, IdentityMap};
use nix::unistd::{Gid, Pid, Uid};

/// Becomes uid/gid 0 inside the new user namespace.
///
/// Does nothing unless the identity map is active.
///
/// # Errors
///
/// Returns a syscall error if dropping supplementary groups or switching ids
/// fails.
pub fn apply_identity(idmap: &IdentityMap) -> Result<()> {
    if !idmap.is_active() {
        return Ok(());
    }

    nix::unistd::setgroups(&[])
        .map_err(|e| NestboxError::syscall("setgroups failed", e))?;

    let root_gid = Gid::from_raw(0);
    nix::unistd::setresgid(root_gid, root_gid, root_gid)
        .map_err(|e| NestboxError::syscall("setresgid failed", e))?;

    let root_uid = Uid::from_raw(0);
    nix::unistd::setresuid(root_uid, root_uid, root_uid)
        .map_err(|e| NestboxError::syscall("setresuid failed", e))?;

    tracing::debug!("switched to root in user namespace");
    Ok(())
}

/// Hands `path` to the host ids that container root maps to.
///
/// Uses the first uid and gid ranges of the identity map; a spec without an
/// active map leaves the path untouched.
///
/// # Errors
///
/// Returns a syscall error if `chown(2)` fails.
pub fn change_ownership(spec: &ContainerLaunchSpec, path: &Path) -> Result<()> {
    let (Some(uid), Some(gid)) = (spec.idmap.uid.first(), spec.idmap.gid.first()) else {
        return Ok(());
    };

    nix::unistd::chown(
        path,
        Some(Uid::from_raw(uid.target)),
        Some(Gid::from_raw(gid.target)),
    )
    .map_err(|e| {
        NestboxError::syscall(
            format!(
                "failed to change owner of {} to {}:{}",
                path.display(),
                uid.target,
                gid.target
            ),
            e,
        )
    })
}

/// Writes `/proc/<pid>/uid_map` and `gid_map` for a freshly launched child.
///
/// # Errors
///
/// Returns an I/O error if either map cannot be written.
pub fn write_id_maps(pid: Pid, idmap: &IdentityMap) -> Result<()> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    write_map(&proc_dir.join("uid_map"), &idmap.uid)?;
    write_map(&proc_dir.join("gid_map"), &idmap.gid)?;
    tracing::debug!(%pid, "wrote uid/gid maps");
    Ok(())
}

fn write_map(path: &Path, entries: &[IdMapEntry]) -> Result<()> {
    std::fs::write(path, format_id_map(entries)).map_err(|e| NestboxError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Renders ranges in the kernel's `inside outside count` line format.
#[must_use]
pub fn format_id_map(entries: &[IdMapEntry]) -> String {
    entries.iter().fold(String::new(), |mut out, entry| {
        let _ = writeln!(out, "{entry}");
        out
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use nestbox_common::types::InitProgram;
    use uuid::Uuid;

    use super::*;

    fn spec(idmap: IdentityMap) -> ContainerLaunchSpec {
        ContainerLaunchSpec {
            name: "web".into(),
            uuid: Uuid::nil(),
            arch: "x86_64".into(),
            filesystems: Vec::new(),
            idmap,
            features: BTreeSet::new(),
            init: InitProgram {
                path: "/sbin/init".into(),
                args: Vec::new(),
                cmdline: None,
            },
            net_devices: Vec::new(),
            hostdevs: Vec::new(),
        }
    }

    #[test]
    fn id_map_lines() {
        let entries = [
            IdMapEntry {
                start: 0,
                target: 100_000,
                count: 1000,
            },
            IdMapEntry {
                start: 1000,
                target: 1000,
                count: 1,
            },
        ];
        assert_eq!(format_id_map(&entries), "0 100000 1000\n1000 1000 1\n");
        assert_eq!(format_id_map(&[]), "");
    }

    #[test]
    fn inactive_map_leaves_identity_alone() {
        apply_identity(&IdentityMap::default()).unwrap();
    }

    #[test]
    fn ownership_without_map_is_a_no_op() {
        change_ownership(&spec(IdentityMap::default()), Path::new("/nonexistent")).unwrap();
    }

    #[test]
    fn ownership_uses_first_targets() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let uid = Uid::current().as_raw();
        let gid = Gid::current().as_raw();
        let idmap = IdentityMap {
            uid: vec![IdMapEntry {
                start: 0,
                target: uid,
                count: 1,
            }],
            gid: vec![IdMapEntry {
                start: 0,
                target: gid,
                count: 1,
            }],
        };
        change_ownership(&spec(idmap), file.path()).unwrap();
    }

    #[test]
    fn ownership_failure_names_path() {
        let idmap = IdentityMap {
            uid: vec![IdMapEntry {
                start: 0,
                target: 0,
                count: 1,
            }],
            gid: vec![IdMapEntry {
                start: 0,
                target: 0,
                count: 1,
            }],
        };
        let err = change_ownership(&spec(idmap), Path::new("/nonexistent/state")).unwrap_err();
        assert_eq!(err.errno(), Some(nix::errno::Errno::ENOENT));
        assert!(err.to_string().contains("/nonexistent/state"));
    }
}
