//! # volstore
//!
//! Tenant volume storage with NFS exports.
//!
//! [`DistributedFilesystem`] ties a volume driver root to an optional
//! [`volstore_nfs::NfsServer`]: creating a tenant volume exports it, removing
//! one withdraws the export first. The `volstore` binary drives it from a
//! TOML [`Config`].

pub mod cli;
pub mod config;
pub mod facade;

pub use config::Config;
pub use facade::DistributedFilesystem;
