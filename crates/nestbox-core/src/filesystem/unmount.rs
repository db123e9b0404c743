//! Removal of whole mount subtrees.

use std::path::Path;

use nestbox_common::error::{NestboxError, Result};

use super::Mounter;

/// Unmounts every mount point at or below `prefix`, deepest first.
///
/// If a mount refuses to go away, the subtree is detached lazily at its
/// root-most entry instead. When `also_unmount_hosting_tmpfs` is set (used
/// for the preserved old root), the staging tmpfs underneath is unmounted
/// too.
///
/// # Errors
///
/// Returns a syscall error carrying the errno of the *first* failed unmount
/// when the fallback cannot clean up either.
pub fn unmount_subtree(
    mounter: &dyn Mounter,
    prefix: &Path,
    also_unmount_hosting_tmpfs: bool,
) -> Result<()> {
    tracing::debug!(prefix = %prefix.display(), "unmounting subtree");

    let mounts = mounter.mount_table()?.reverse_subtree(prefix);
    let Some(root_most) = mounts.last() else {
        return Ok(());
    };

    let mut failure = None;
    for mount in &mounts {
        tracing::debug!(path = %mount.display(), "umount");
        if let Err(errno) = mounter.unmount(mount) {
            tracing::warn!(
                failed = %mount.display(),
                subtree = %root_most.display(),
                error = %errno,
                "failed to unmount, trying to detach subtree"
            );
            failure = Some((mount, errno));
            break;
        }
    }

    let Some((failed, errno)) = failure else {
        return Ok(());
    };

    if mounter.detach(root_most).is_err() {
        return Err(NestboxError::syscall(
            format!(
                "failed to unmount '{}' and could not detach subtree '{}'",
                failed.display(),
                root_most.display()
            ),
            errno,
        ));
    }

    if also_unmount_hosting_tmpfs && mounter.unmount(root_most).is_err() {
        return Err(NestboxError::syscall(
            format!(
                "failed to unmount '{}' and could not unmount old root '{}'",
                failed.display(),
                root_most.display()
            ),
            errno,
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use nix::errno::Errno;

    use super::*;
    use crate::filesystem::testing::{Call, FakeMounter};

    const TABLE: &str = "\
/dev/sda1 / ext4 rw 0 0
tmprootfs /.oldroot tmpfs rw 0 0
proc /.oldroot/proc proc rw 0 0
sysfs /.oldroot/sys sysfs rw 0 0
securityfs /.oldroot/sys/kernel/security securityfs rw 0 0
tmpfs /.oldroot/run tmpfs rw 0 0
";

    #[test]
    fn unmounts_deepest_first() {
        let mounter = FakeMounter::with_table(TABLE);
        unmount_subtree(&mounter, Path::new("/.oldroot"), true).expect("unmount");
        assert_eq!(
            mounter.calls(),
            vec![
                Call::Unmount(PathBuf::from("/.oldroot/run")),
                Call::Unmount(PathBuf::from("/.oldroot/sys/kernel/security")),
                Call::Unmount(PathBuf::from("/.oldroot/sys")),
                Call::Unmount(PathBuf::from("/.oldroot/proc")),
                Call::Unmount(PathBuf::from("/.oldroot")),
            ]
        );
    }

    #[test]
    fn empty_subtree_is_a_no_op() {
        let mounter = FakeMounter::with_table(TABLE);
        unmount_subtree(&mounter, Path::new("/srv"), false).expect("unmount");
        assert!(mounter.calls().is_empty());
    }

    #[test]
    fn busy_mount_falls_back_to_detaching_root_most_entry() {
        let mut mounter = FakeMounter::with_table(TABLE);
        let _ = mounter
            .unmount_errors
            .insert(PathBuf::from("/.oldroot/sys"), Errno::EBUSY);

        unmount_subtree(&mounter, Path::new("/.oldroot"), true).expect("fallback succeeds");
        assert_eq!(
            mounter.calls(),
            vec![
                Call::Unmount(PathBuf::from("/.oldroot/run")),
                Call::Unmount(PathBuf::from("/.oldroot/sys/kernel/security")),
                Call::Unmount(PathBuf::from("/.oldroot/sys")),
                Call::Detach(PathBuf::from("/.oldroot")),
                Call::Unmount(PathBuf::from("/.oldroot")),
            ]
        );
    }

    #[test]
    fn fallback_does_not_touch_hosting_tmpfs_unless_asked() {
        let mut mounter = FakeMounter::with_table(TABLE);
        let _ = mounter
            .unmount_errors
            .insert(PathBuf::from("/.oldroot/run"), Errno::EBUSY);

        unmount_subtree(&mounter, Path::new("/.oldroot"), false).expect("fallback succeeds");
        assert_eq!(
            mounter.calls().last(),
            Some(&Call::Detach(PathBuf::from("/.oldroot")))
        );
    }

    #[test]
    fn failed_detach_surfaces_original_errno() {
        let mut mounter = FakeMounter::with_table(TABLE);
        let _ = mounter
            .unmount_errors
            .insert(PathBuf::from("/.oldroot/proc"), Errno::EBUSY);
        let _ = mounter
            .detach_errors
            .insert(PathBuf::from("/.oldroot"), Errno::EINVAL);

        let err = unmount_subtree(&mounter, Path::new("/.oldroot"), true).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EBUSY));
        assert!(err.to_string().contains("/.oldroot/proc"));
    }

    #[test]
    fn failed_hosting_unmount_surfaces_original_errno() {
        let mut mounter = FakeMounter::with_table(TABLE);
        let _ = mounter
            .unmount_errors
            .insert(PathBuf::from("/.oldroot"), Errno::EPERM);

        let err = unmount_subtree(&mounter, Path::new("/.oldroot"), true).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM));
        assert!(err.to_string().contains("could not unmount old root"));
    }
}
