//! # volstore-volume
//!
//! Pluggable volume drivers for volstore.
//!
//! A [`DriverRegistry`] binds backend kinds to constructors and driver roots
//! to live [`Driver`]s. Paths resolve to volumes by walking up to the nearest
//! bound root, creating the volume on first use:
//!
//! ```no_run
//! use volstore_volume::{DriverRegistry, DriverType};
//!
//! # fn example() -> volstore_common::VolstoreResult<()> {
//! let registry = DriverRegistry::system();
//! registry.init_driver(DriverType::Rsync, "/var/lib/volstore/volumes", &[])?;
//!
//! let volume = registry.find_mount("/var/lib/volstore/volumes/tenant1")?;
//! volume.snapshot("before-upgrade")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod btrfs;
pub mod detect;
pub mod driver;
pub mod registry;
mod resolve;
pub mod rsync;
pub mod snapshot;

pub use detect::{Detector, detect_driver_type};
pub use driver::{Driver, DriverContext, DriverInit, DriverType, Status, Statuses, Volume};
pub use registry::DriverRegistry;
