//! # nestbox-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire nestbox workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the launch specification that the supervisor
//! builds and the contained child consumes.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod layout;
pub mod types;
