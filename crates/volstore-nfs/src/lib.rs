//! NFS export synchronization.
//!
//! [`NfsServer`] keeps a desired set of volumes and allowed clients and, on
//! [`NfsServer::sync`], bind-mounts each volume under the export tree and
//! rewrites the managed sections of `/etc/hosts.deny`, `/etc/hosts.allow`
//! and `/etc/exports` to match. Operator content outside those sections is
//! left alone.
//!
//! ```no_run
//! use std::sync::Arc;
//! use volstore_common::SystemRunner;
//! use volstore_nfs::{NfsConfig, NfsServer};
//!
//! # fn main() -> volstore_common::VolstoreResult<()> {
//! let config = NfsConfig::new("/var/lib/volstore/volumes", "volstore_var", "10.0.0.0/8");
//! let server = NfsServer::new(config, Arc::new(SystemRunner))?;
//! server.set_clients(["10.0.0.5"]);
//! server.add_volume("/var/lib/volstore/volumes/tenant1");
//! server.sync()?;
//! # Ok(())
//! # }
//! ```

pub mod daemon;
pub mod managed;
pub mod mounts;
pub mod server;

pub use daemon::{Daemon, DaemonCommands};
pub use mounts::{MountEntry, Mounter};
pub use server::{NfsConfig, NfsServer};
