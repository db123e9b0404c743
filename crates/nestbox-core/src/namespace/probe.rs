//! Kernel feature probes.
//!
//! Each probe duplicates a throwaway process and looks at how that went.
//! A negative answer is a normal outcome, not an error.

use std::io;
use std::path::Path;

use nestbox_common::constants::{CTRL_ALT_DEL_PATH, PROBE_STACK_SIZE};
use nestbox_common::error::{NestboxError, Result};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::wait::{WaitStatus, waitpid};

use super::{BASE_NAMESPACES, NamespaceKind, clone_process};

/// Exit status of the reboot probe child when the kernel rejected the call
/// with `EINVAL`.
const REBOOT_REJECTED: i32 = 1;

/// Whether the kernel lets a pid namespace handle `reboot(2)` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootSupport {
    /// Reboot inside the container would affect the host, or is refused.
    Unsupported,
    /// `reboot(2)` inside a pid namespace terminates that namespace.
    Available,
}

impl RebootSupport {
    /// Whether the reboot capability may be kept.
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Checks whether processes can be created with `flags` on top of the base
/// namespaces.
///
/// The probe child exits immediately and is always reaped.
#[must_use]
pub fn probe_namespace_support(flags: CloneFlags) -> bool {
    let flags = BASE_NAMESPACES | flags;
    let pid = match clone_process(Box::new(|| 0), PROBE_STACK_SIZE, flags) {
        Ok(pid) => pid,
        Err(e) => {
            tracing::debug!(error = %e, ?flags, "clone returned error, container support is not enabled");
            return false;
        }
    };

    if let Err(e) = waitpid(pid, None) {
        tracing::debug!(error = %e, %pid, "failed to reap namespace probe");
        return false;
    }

    tracing::debug!(?flags, "container support is enabled");
    true
}

/// Whether namespaces of `kind` can be created on this kernel.
#[must_use]
pub fn is_namespace_supported(kind: NamespaceKind) -> bool {
    probe_namespace_support(kind.clone_flag())
}

/// Detects whether `reboot(2)` is namespaced.
///
/// A child in fresh pid/mount/uts/ipc namespaces re-applies the host's
/// ctrl-alt-del setting. Kernels that namespace reboot reject that with
/// `EINVAL` inside a child pid namespace; older ones accept it or return
/// `EPERM`.
///
/// # Errors
///
/// Returns an I/O error if the ctrl-alt-del setting cannot be read or parsed,
/// and a syscall error if the probe process cannot be created or reaped.
pub fn probe_reboot_support() -> Result<RebootSupport> {
    let path = Path::new(CTRL_ALT_DEL_PATH);
    let raw = std::fs::read_to_string(path).map_err(|e| NestboxError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let enabled = parse_ctrl_alt_del(path, &raw)?;

    let pid = clone_process(
        Box::new(move || {
            match nix::sys::reboot::set_cad_enabled(enabled) {
                Err(Errno::EINVAL) => REBOOT_REJECTED as isize,
                _ => 0,
            }
        }),
        PROBE_STACK_SIZE,
        BASE_NAMESPACES,
    )
    .map_err(|e| NestboxError::syscall("unable to clone to check reboot support", e))?;

    let status = waitpid(pid, None)
        .map_err(|e| NestboxError::syscall("failed to wait for reboot probe", e))?;

    let support = reboot_support_from(status);
    tracing::debug!(?support, "containerized reboot support");
    Ok(support)
}

/// Interprets the probe child's exit status.
pub(crate) const fn reboot_support_from(status: WaitStatus) -> RebootSupport {
    match status {
        WaitStatus::Exited(_, REBOOT_REJECTED) => RebootSupport::Available,
        _ => RebootSupport::Unsupported,
    }
}

/// Parses the integer content of the ctrl-alt-del setting. Non-zero means
/// enabled.
///
/// # Errors
///
/// Returns an I/O error of kind `InvalidData` if the content is not an
/// integer.
pub fn parse_ctrl_alt_del(path: &Path, raw: &str) -> Result<bool> {
    let value: i64 = raw.trim().parse().map_err(|_| NestboxError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed ctrl-alt-del setting '{}'", raw.trim()),
        ),
    })?;
    Ok(value != 0)
}
