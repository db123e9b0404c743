//! # nestbox-core
//!
//! Low-level Linux primitives used to turn a launch specification into an
//! isolated process tree.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: flag computation, kernel feature probing, identity setup.
//! - **Filesystem**: mount-table reading, subtree unmounting, basic mounts,
//!   block/bind/tmpfs mounts, and the `pivot_root` switch.
//! - **Devices and descriptors**: `/dev` population and fd renumbering.
//! - **Network**: renaming delegated interfaces to `ethN`.
//! - **Capabilities**: stripping privileges that are not namespaced.
//! - **Handshake**: the single-byte parent/child synchronisation protocol.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod device;
pub mod fd;
pub mod filesystem;
pub mod handshake;
pub mod namespace;
pub mod network;
