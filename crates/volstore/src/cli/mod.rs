//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, eyre};
use tabled::{Table, Tabled};
use volstore_common::{CommandRunner, Privilege, SystemRunner, VolstoreError};
use volstore_volume::detect_driver_type;

use crate::config::{Config, DEFAULT_CONFIG};
use crate::facade::DistributedFilesystem;

/// Volstore - tenant volumes with NFS exports
#[derive(Parser)]
#[command(name = "volstore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file
    #[arg(
        long,
        global = true,
        env = "VOLSTORE_CONFIG",
        default_value = DEFAULT_CONFIG
    )]
    pub config: PathBuf,

    /// Root directory for volstore data (overrides the configuration file)
    #[arg(long, global = true, env = "VOLSTORE_ROOT")]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output formats for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable table
    Table,
    /// JSON
    Json,
}

/// Volstore commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Bind the configured driver to the data root
    Init,

    /// Create a tenant volume
    Create {
        /// Tenant ID
        tenant: String,
    },

    /// Remove a tenant volume
    Remove {
        /// Tenant ID
        tenant: String,
    },

    /// List tenant volumes
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: Format,
    },

    /// Show driver space usage
    Status {
        /// Only drivers holding these volumes
        volumes: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: Format,
    },

    /// Snapshot a tenant volume
    Snapshot {
        /// Tenant ID
        tenant: String,

        /// Snapshot label
        label: String,
    },

    /// List snapshots of a tenant volume
    Snapshots {
        /// Tenant ID
        tenant: String,
    },

    /// Remove a snapshot
    RemoveSnapshot {
        /// Tenant ID
        tenant: String,

        /// Snapshot label
        label: String,
    },

    /// Restore a tenant volume to a snapshot
    Rollback {
        /// Tenant ID
        tenant: String,

        /// Snapshot label
        label: String,
    },

    /// Write a snapshot to an archive
    Export {
        /// Tenant ID
        tenant: String,

        /// Snapshot label
        label: String,

        /// Archive path
        file: PathBuf,

        /// Parent snapshot label
        #[arg(long, default_value = "")]
        parent: String,
    },

    /// Load a snapshot from an archive
    Import {
        /// Tenant ID
        tenant: String,

        /// Snapshot label
        label: String,

        /// Archive path
        file: PathBuf,
    },

    /// Print the backend owning a directory
    Detect {
        /// Directory to inspect
        path: PathBuf,
    },

    /// Reconcile NFS exports
    Sync,
}

#[derive(Tabled)]
struct VolumeRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PATH")]
    path: String,
    #[tabled(rename = "SNAPSHOTS")]
    snapshots: usize,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "KEY")]
    key: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
    #[tabled(rename = "AVAILABLE")]
    available: u64,
    #[tabled(rename = "USED")]
    used: u64,
    #[tabled(rename = "TOTAL")]
    total: u64,
}

impl Cli {
    /// Load the configuration, applying command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)?;
        if let Some(root) = &self.root {
            config = config.with_root(root);
        }
        Ok(config)
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub fn execute(self) -> Result<()> {
        let config = self.load_config()?;
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let privilege = Privilege::current();

        if let Commands::Detect { path } = &self.command {
            return match detect_driver_type(path, runner.as_ref(), privilege) {
                Ok(kind) => {
                    println!("{kind}");
                    Ok(())
                }
                Err(VolstoreError::DriverNotInit { .. }) => {
                    println!("uninitialized");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
        }

        let dfs = DistributedFilesystem::open(&config, runner, privilege)?;

        match self.command {
            Commands::Init => {
                let driver = dfs.driver()?;
                println!(
                    "Initialized {} driver at {}",
                    driver.driver_type(),
                    driver.root().display()
                );
                Ok(())
            }

            Commands::Create { tenant } => {
                let volume = dfs.create(&tenant)?;
                println!("Volume {} created at {}", tenant, volume.path().display());
                Ok(())
            }

            Commands::Remove { tenant } => {
                dfs.remove(&tenant)?;
                println!("Volume {tenant} removed");
                Ok(())
            }

            Commands::List { format } => {
                let driver = dfs.driver()?;
                let mut rows = Vec::new();
                for name in driver.list() {
                    let volume = driver.get(&name)?;
                    rows.push(VolumeRow {
                        path: volume.path().display().to_string(),
                        snapshots: volume.snapshots()?.len(),
                        name,
                    });
                }

                match format {
                    Format::Json => {
                        let names: Vec<_> = rows.iter().map(|r| &r.name).collect();
                        println!("{}", serde_json::to_string_pretty(&names)?);
                    }
                    Format::Table if rows.is_empty() => println!("No volumes"),
                    Format::Table => println!("{}", Table::new(rows)),
                }
                Ok(())
            }

            Commands::Status { volumes, format } => {
                let names: Vec<&str> = volumes.iter().map(String::as_str).collect();
                let statuses = dfs.registry().status(&names);
                match format {
                    Format::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
                    Format::Table => {
                        let rows: Vec<StatusRow> = statuses
                            .into_iter()
                            .map(|(key, s)| StatusRow {
                                key,
                                driver: s.driver.to_string(),
                                available: s.data_space_available,
                                used: s.data_space_used,
                                total: s.data_space_total,
                            })
                            .collect();
                        println!("{}", Table::new(rows));
                    }
                }
                Ok(())
            }

            Commands::Snapshot { tenant, label } => {
                dfs.volume(&tenant)?.snapshot(&label)?;
                println!("Snapshot {label} of {tenant} created");
                Ok(())
            }

            Commands::Snapshots { tenant } => {
                for label in dfs.volume(&tenant)?.snapshots()? {
                    println!("{label}");
                }
                Ok(())
            }

            Commands::RemoveSnapshot { tenant, label } => {
                dfs.volume(&tenant)?.remove_snapshot(&label)?;
                println!("Snapshot {label} of {tenant} removed");
                Ok(())
            }

            Commands::Rollback { tenant, label } => {
                dfs.volume(&tenant)?.rollback(&label)?;
                println!("Volume {tenant} rolled back to {label}");
                Ok(())
            }

            Commands::Export {
                tenant,
                label,
                file,
                parent,
            } => {
                dfs.volume(&tenant)?.export(&label, &parent, &file)?;
                println!("Snapshot {label} of {tenant} written to {}", file.display());
                Ok(())
            }

            Commands::Import {
                tenant,
                label,
                file,
            } => {
                dfs.volume(&tenant)?.import(&label, &file)?;
                println!("Snapshot {label} of {tenant} loaded from {}", file.display());
                Ok(())
            }

            Commands::Sync => {
                if dfs.nfs().is_none() {
                    return Err(eyre!("NFS exports are disabled in {}", self.config.display()));
                }
                for path in dfs.sync()? {
                    println!("Removed stale export {}", path.display());
                }
                Ok(())
            }

            Commands::Detect { .. } => Ok(()),
        }
    }
}
