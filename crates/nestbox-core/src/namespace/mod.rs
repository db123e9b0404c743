//! Linux namespace management for container isolation.
//!
//! Computes the `clone(2)` flags a launch needs, duplicates processes into
//! new namespaces, and probes what the running kernel supports.

pub mod probe;
pub mod user;

use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::ContainerLaunchSpec;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Namespace kinds whose availability varies between kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    /// User namespace (`CLONE_NEWUSER`).
    User,
    /// Network namespace (`CLONE_NEWNET`).
    Net,
}

impl NamespaceKind {
    /// The `clone(2)` flag requesting this namespace.
    #[must_use]
    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Net => CloneFlags::CLONE_NEWNET,
        }
    }
}

/// Answers whether the kernel supports an optional namespace kind.
pub trait KernelFeatures {
    /// Whether namespaces of `kind` can be created.
    fn supports(&self, kind: NamespaceKind) -> bool;
}

/// [`KernelFeatures`] answered by probing the running kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostKernel;

impl KernelFeatures for HostKernel {
    fn supports(&self, kind: NamespaceKind) -> bool {
        probe::is_namespace_supported(kind)
    }
}

/// Namespaces every container gets.
pub const BASE_NAMESPACES: CloneFlags = CloneFlags::CLONE_NEWPID
    .union(CloneFlags::CLONE_NEWNS)
    .union(CloneFlags::CLONE_NEWUTS)
    .union(CloneFlags::CLONE_NEWIPC);

/// The namespaces requested for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceFlagSet {
    flags: CloneFlags,
}

impl NamespaceFlagSet {
    /// Derives the flag set from a launch spec.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the spec carries an identity map but
    /// the kernel cannot create user namespaces.
    pub fn compute(spec: &ContainerLaunchSpec, kernel: &dyn KernelFeatures) -> Result<Self> {
        let mut flags = BASE_NAMESPACES;

        if spec.idmap.is_active() {
            if !kernel.supports(NamespaceKind::User) {
                return Err(NestboxError::config("kernel doesn't support user namespace"));
            }
            tracing::debug!("enable user namespace");
            flags |= CloneFlags::CLONE_NEWUSER;
        }

        if spec.needs_network_namespace() {
            tracing::debug!("enable network namespace");
            flags |= CloneFlags::CLONE_NEWNET;
        }

        Ok(Self { flags })
    }

    /// The raw `clone(2)` flags.
    #[must_use]
    pub const fn flags(&self) -> CloneFlags {
        self.flags
    }

    /// Whether a user namespace is requested.
    #[must_use]
    pub const fn user_namespace(&self) -> bool {
        self.flags.contains(CloneFlags::CLONE_NEWUSER)
    }

    /// Whether a network namespace is requested.
    #[must_use]
    pub const fn network_namespace(&self) -> bool {
        self.flags.contains(CloneFlags::CLONE_NEWNET)
    }
}

/// Runs `child` in a new process created with `flags`, on a fresh stack of
/// `stack_size` bytes. The child's return value becomes its exit status and
/// the parent is sent `SIGCHLD` when it exits.
///
/// # Errors
///
/// Returns the errno of the failed `clone(2)`.
pub fn clone_process(
    child: Box<dyn FnMut() -> isize + '_>,
    stack_size: usize,
    flags: CloneFlags,
) -> nix::Result<Pid> {
    let mut stack = vec![0u8; stack_size];
    // SAFETY: CLONE_VM is never part of `flags`, so the child runs on its own
    // copy of the address space, including its copy of `stack`. The parent's
    // buffer is dropped once clone returns, which the child never observes.
    unsafe { nix::sched::clone(child, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
}
