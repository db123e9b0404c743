//! # nestbox-runtime
//!
//! Launch orchestration for nestbox containers.
//!
//! The supervisor side ([`launch::Launcher`]) computes the namespaces a
//! container needs and duplicates a child into them. The child side
//! ([`child`]) waits for the supervisor, pivots into the container root,
//! sets up devices, interfaces and descriptors, drops capabilities, reports
//! back, and finally execs the container's init.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod child;
pub mod init;
pub mod launch;
pub mod provider;
pub mod rootfs;

#[cfg(test)]
mod testing;

pub use launch::{LaunchRequest, Launcher};
pub use nestbox_core::handshake::{send_continue, wait_for_continue};
pub use nestbox_core::namespace::user::{change_ownership, write_id_maps};

use nestbox_core::namespace::NamespaceKind;

/// Whether the running kernel can create namespaces of `kind`.
#[must_use]
pub fn probe_kernel_feature_support(kind: NamespaceKind) -> bool {
    nestbox_core::namespace::probe::is_namespace_supported(kind)
}
