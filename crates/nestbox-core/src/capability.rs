//! Linux capability dropping for the contained process.
//!
//! A handful of capabilities act on global kernel state rather than on
//! namespaced resources. They are removed from the effective, permitted,
//! inheritable and bounding sets. Shrinking the bounding set is what keeps
//! them from being re-acquired through an exec.

use std::fmt;

use nestbox_common::error::Result;

/// Capabilities the container never keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DroppedCapability {
    /// `CAP_SYS_MODULE`: no kernel module loading.
    SysModule,
    /// `CAP_SYS_TIME`: no changing the clock.
    SysTime,
    /// `CAP_MKNOD`: no creating device nodes.
    Mknod,
    /// `CAP_AUDIT_CONTROL`: no messing with auditing status.
    AuditControl,
    /// `CAP_MAC_ADMIN`: no messing with LSM config.
    MacAdmin,
    /// `CAP_SYS_BOOT`: no use of reboot, unless the kernel namespaces it.
    SysBoot,
}

impl DroppedCapability {
    /// The set dropped regardless of kernel support.
    pub const ALWAYS: [Self; 5] = [
        Self::SysModule,
        Self::SysTime,
        Self::Mknod,
        Self::AuditControl,
        Self::MacAdmin,
    ];

    #[cfg(feature = "capabilities")]
    const fn to_caps(self) -> caps::Capability {
        match self {
            Self::SysModule => caps::Capability::CAP_SYS_MODULE,
            Self::SysTime => caps::Capability::CAP_SYS_TIME,
            Self::Mknod => caps::Capability::CAP_MKNOD,
            Self::AuditControl => caps::Capability::CAP_AUDIT_CONTROL,
            Self::MacAdmin => caps::Capability::CAP_MAC_ADMIN,
            Self::SysBoot => caps::Capability::CAP_SYS_BOOT,
        }
    }
}

impl fmt::Display for DroppedCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SysModule => "CAP_SYS_MODULE",
            Self::SysTime => "CAP_SYS_TIME",
            Self::Mknod => "CAP_MKNOD",
            Self::AuditControl => "CAP_AUDIT_CONTROL",
            Self::MacAdmin => "CAP_MAC_ADMIN",
            Self::SysBoot => "CAP_SYS_BOOT",
        };
        f.write_str(name)
    }
}

/// The capabilities to drop for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDropSet {
    caps: Vec<DroppedCapability>,
}

impl CapabilityDropSet {
    /// Builds the drop set. `keep_reboot` is set when the kernel handles
    /// `reboot(2)` per pid namespace.
    #[must_use]
    pub fn new(keep_reboot: bool) -> Self {
        let mut caps = DroppedCapability::ALWAYS.to_vec();
        if !keep_reboot {
            caps.push(DroppedCapability::SysBoot);
        }
        Self { caps }
    }

    /// Capabilities in the set.
    #[must_use]
    pub fn capabilities(&self) -> &[DroppedCapability] {
        &self.caps
    }

    /// Whether `cap` will be dropped.
    #[must_use]
    pub fn contains(&self, cap: DroppedCapability) -> bool {
        self.caps.contains(&cap)
    }
}

/// Removes every capability of `set` from the calling process.
///
/// # Errors
///
/// Returns a syscall error if a capability set cannot be updated.
#[cfg(feature = "capabilities")]
pub fn drop_capabilities(set: &CapabilityDropSet) -> Result<()> {
    use caps::CapSet;
    use nestbox_common::error::NestboxError;
    use nix::errno::Errno;

    // Bounding first: it needs CAP_SETPCAP, which may sit in the effective set.
    let sets = [
        CapSet::Bounding,
        CapSet::Inheritable,
        CapSet::Effective,
        CapSet::Permitted,
    ];
    for cap_set in sets {
        for cap in set.capabilities() {
            caps::drop(None, cap_set, cap.to_caps()).map_err(|e| {
                NestboxError::syscall(
                    format!("failed to remove {cap} from {cap_set:?} set: {e}"),
                    Errno::last(),
                )
            })?;
        }
    }

    tracing::info!(dropped = set.capabilities().len(), "dropped capabilities");
    Ok(())
}

/// Built without capability support: warns and leaves the sets untouched.
///
/// # Errors
///
/// Never fails.
#[cfg(not(feature = "capabilities"))]
pub fn drop_capabilities(set: &CapabilityDropSet) -> Result<()> {
    tracing::warn!(
        requested = set.capabilities().len(),
        "capability support not compiled in, unable to clear capabilities"
    );
    Ok(())
}
