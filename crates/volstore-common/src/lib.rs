//! # volstore-common
//!
//! Shared utilities and types for the volstore storage layer.
//!
//! This crate provides common functionality used across all volstore crates:
//! - The common error type
//! - Standard filesystem paths
//! - External command execution with privilege elevation
//! - Atomic file replacement and lexical path cleaning

#![warn(missing_docs)]

pub mod error;
pub mod exec;
pub mod fsutil;
pub mod paths;

pub use error::{VolstoreError, VolstoreResult};
pub use exec::{CommandOutput, CommandRunner, Privilege, ScriptedRunner, SystemRunner};
pub use paths::StoragePaths;
