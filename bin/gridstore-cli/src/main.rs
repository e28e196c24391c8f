//! gridstore CLI - Admin Command Line Interface
//!
//! This binary inspects and maintains a persistence environment: its active
//! stores, local snapshots and the snapshot archive, and decodes partition
//! GUIDs.

mod config;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use config::{Config, Overrides};
use gridstore_archive::{DirectoryArchiveBackend, Snapshot, SnapshotArchiver};
use gridstore_common::MemberId;
use gridstore_placement::{Guid, GuidResolver, allocate_snapshot_partitions};
use gridstore_storage::{
    PersistenceEnvironment, PersistenceManager, PersistenceTools, RedbEngine,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gridstore-cli")]
#[command(about = "gridstore Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/gridstore/gridstore.toml")]
    config: PathBuf,

    /// Base directory of the persistence environment
    #[arg(short, long)]
    base_dir: Option<PathBuf>,

    /// Archive directory
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Background task threads (0 runs tasks inline)
    #[arg(long)]
    task_threads: Option<usize>,

    /// Delete directly instead of moving to the trash
    #[arg(long)]
    no_trash: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store operations
    Store {
        #[command(subcommand)]
        action: StoreCommands,
    },
    /// Local snapshot operations
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommands,
    },
    /// Snapshot archive operations
    Archive {
        #[command(subcommand)]
        action: ArchiveCommands,
    },
    /// Partition GUID operations
    Guid {
        #[command(subcommand)]
        action: GuidCommands,
    },
}

#[derive(Subcommand, Debug)]
enum StoreCommands {
    /// List stores
    List {
        /// Snapshot to use instead of the active stores
        #[arg(short, long)]
        snapshot: Option<String>,
    },
    /// Export a store to a transfer file
    Export {
        /// Store ID
        store_id: String,
        /// Output file
        file: PathBuf,
        #[arg(short, long)]
        snapshot: Option<String>,
    },
    /// Import a store from a transfer file
    Import {
        /// Store ID
        store_id: String,
        /// Input file
        file: PathBuf,
        #[arg(short, long)]
        snapshot: Option<String>,
    },
    /// Delete a store
    Delete {
        /// Store ID
        store_id: String,
        /// Move to the trash instead of deleting outright
        #[arg(long)]
        safe: bool,
        #[arg(short, long)]
        snapshot: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommands {
    /// List local snapshots
    List,
    /// Snapshot the active stores
    Create {
        /// Snapshot name
        name: String,
        /// Create an empty snapshot
        #[arg(long)]
        empty: bool,
    },
    /// Remove a local snapshot
    Remove {
        /// Snapshot name
        name: String,
    },
    /// Show per-cache statistics of a snapshot
    Stats {
        /// Snapshot name
        name: String,
    },
    /// Check that every store of a snapshot is sealed and consistent
    Validate {
        /// Snapshot name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ArchiveCommands {
    /// List archived snapshots
    List,
    /// Archive a local snapshot
    Push {
        /// Snapshot name
        name: String,
    },
    /// Retrieve an archived snapshot into the local snapshots
    Pull {
        /// Snapshot name
        name: String,
    },
    /// Remove an archived snapshot
    Remove {
        /// Snapshot name
        name: String,
    },
    /// Validate an archived snapshot
    Validate {
        /// Snapshot name
        name: String,
    },
    /// Show per-cache statistics of an archived snapshot
    Stats {
        /// Snapshot name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum GuidCommands {
    /// Decode a GUID
    Parse {
        /// Partition GUID
        guid: String,
    },
    /// Resolve the newest GUIDs reported by members and assign them
    Resolve {
        /// Partition count
        #[arg(short, long)]
        partition_count: u32,
        /// Member reports as MEMBER=GUID[,GUID...]
        reports: Vec<String>,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Merge CLI args with config file (CLI takes precedence)
    let config = Config::load(&args.config)?.merge(Overrides {
        base_dir: args.base_dir,
        archive_dir: args.archive_dir,
        task_threads: args.task_threads,
        disable_trash: args.no_trash,
        log_level: args.log_level,
    });

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Guid { action } => run_guid(action),
        Commands::Store { action } => with_environment(&config, |env| run_store(env, action)),
        Commands::Snapshot { action } => {
            with_environment(&config, |env| run_snapshot(env, action))
        }
        Commands::Archive { action } => with_environment(&config, |env| {
            let backend = DirectoryArchiveBackend::new(config.environment.archive_dir())?;
            let archiver = SnapshotArchiver::new(backend, Arc::clone(env.engine()))
                .with_heartbeat(Arc::new(|store: &str| debug!("Processed store {}", store)));
            run_archive(env, &archiver, action)
        }),
    }
}

/// Open the configured environment, run `f`, and release the environment
fn with_environment<F>(config: &Config, f: F) -> Result<()>
where
    F: FnOnce(&PersistenceEnvironment) -> Result<()>,
{
    let env = PersistenceEnvironment::from_config(&config.environment, Arc::new(RedbEngine::new()))
        .context("failed to open persistence environment")?;
    info!("Opened persistence environment {}", env.name());
    let result = f(&env);
    env.release();
    result
}

fn open_manager(env: &PersistenceEnvironment, snapshot: Option<&str>) -> Result<PersistenceManager> {
    Ok(match snapshot {
        Some(name) => env.open_snapshot(name)?,
        None => env.open_active()?,
    })
}

fn run_store(env: &PersistenceEnvironment, action: StoreCommands) -> Result<()> {
    match action {
        StoreCommands::List { snapshot } => {
            let manager = open_manager(env, snapshot.as_deref())?;
            let ids = manager.list()?;
            println!("Stores ({})", manager.name());
            println!("======");
            if ids.is_empty() {
                println!("No stores found");
            }
            for id in ids {
                println!("{id}");
            }
        }
        StoreCommands::Export {
            store_id,
            file,
            snapshot,
        } => {
            let manager = open_manager(env, snapshot.as_deref())?;
            if !manager.list()?.contains(&store_id) {
                bail!("store {store_id} does not exist");
            }
            let output = BufWriter::new(
                File::create(&file).with_context(|| format!("failed to create {}", file.display()))?,
            );
            let records = manager.write(&store_id, output)?;
            println!("Exported {records} records of store {store_id} to {}", file.display());
        }
        StoreCommands::Import {
            store_id,
            file,
            snapshot,
        } => {
            let manager = open_manager(env, snapshot.as_deref())?;
            if manager.list()?.contains(&store_id) {
                bail!("store {store_id} already exists");
            }
            let input = BufReader::new(
                File::open(&file).with_context(|| format!("failed to open {}", file.display()))?,
            );
            let records = manager.read(&store_id, input)?;
            println!("Imported {records} records into store {store_id}");
        }
        StoreCommands::Delete {
            store_id,
            safe,
            snapshot,
        } => {
            open_manager(env, snapshot.as_deref())?.delete(&store_id, safe)?;
            println!("Deleted store {store_id}");
        }
    }
    Ok(())
}

fn run_snapshot(env: &PersistenceEnvironment, action: SnapshotCommands) -> Result<()> {
    match action {
        SnapshotCommands::List => {
            let names = env.list_snapshots()?;
            println!("Snapshots");
            println!("=========");
            if names.is_empty() {
                println!("No snapshots found");
            }
            for name in names {
                println!("{name}");
            }
        }
        SnapshotCommands::Create { name, empty } => {
            let manager = if empty {
                env.create_snapshot(&name, None)?
            } else {
                let active = env.open_active()?;
                env.create_snapshot(&name, Some(&active))?
            };
            println!(
                "Snapshot {name} created with {} stores",
                manager.list()?.len()
            );
        }
        SnapshotCommands::Remove { name } => {
            if !env.remove_snapshot(&name)? {
                bail!("snapshot {name} does not exist");
            }
            println!("Snapshot {name} removed");
        }
        SnapshotCommands::Stats { name } => {
            print_statistics(&env.open_snapshot(&name)?.persistence_tools()?)?;
        }
        SnapshotCommands::Validate { name } => {
            let tools = env.open_snapshot(&name)?.persistence_tools()?;
            tools.validate()?;
            println!("Snapshot {name} is valid ({} stores)", tools.info().store_ids.len());
        }
    }
    Ok(())
}

fn run_archive(
    env: &PersistenceEnvironment,
    archiver: &SnapshotArchiver<DirectoryArchiveBackend>,
    action: ArchiveCommands,
) -> Result<()> {
    match action {
        ArchiveCommands::List => {
            let names = archiver.list()?;
            println!("Archived snapshots ({})", archiver.backend().root().display());
            println!("==================");
            if names.is_empty() {
                println!("No archived snapshots found");
            }
            for name in names {
                println!("{name}");
            }
        }
        ArchiveCommands::Push { name } => {
            let snapshot = Snapshot::local(env, &name)?;
            archiver.archive(&snapshot, env)?;
            println!("Archived {snapshot}");
            println!("{}", archiver.statistics().archive);
        }
        ArchiveCommands::Pull { name } => {
            let snapshot = archiver.get(&name)?;
            archiver.retrieve(&snapshot, env)?;
            println!("Retrieved {snapshot}");
            println!("{}", archiver.statistics().retrieve);
        }
        ArchiveCommands::Remove { name } => {
            archiver.remove(&name)?;
            println!("Archived snapshot {name} removed");
        }
        ArchiveCommands::Validate { name } => {
            let tools = archiver.get_persistence_tools(&name)?;
            tools.validate()?;
            println!(
                "Archived snapshot {name} is valid ({} stores)",
                tools.info().store_ids.len()
            );
        }
        ArchiveCommands::Stats { name } => {
            print_statistics(&archiver.get_persistence_tools(&name)?)?;
        }
    }
    Ok(())
}

fn print_statistics(tools: &PersistenceTools) -> Result<()> {
    let stats = tools.statistics()?;
    println!("{}", tools.info());
    println!();
    println!("{stats}");
    Ok(())
}

fn run_guid(action: GuidCommands) -> Result<()> {
    match action {
        GuidCommands::Parse { guid } => {
            let parsed: Guid = guid.parse()?;
            println!("GUID:      {parsed}");
            println!("Partition: {}", parsed.partition);
            println!("Version:   {}", parsed.version);
            println!("Timestamp: {}", parsed.timestamp);
            println!("Member:    {}", parsed.member);
        }
        GuidCommands::Resolve {
            partition_count,
            reports,
        } => {
            let resolver = GuidResolver::new(partition_count);
            for report in &reports {
                let (member, guids) = parse_report(report)?;
                resolver.register(member, guids.iter().map(String::as_str))?;
            }

            println!("{:<10} {:<40}", "PARTITION", "NEWEST GUID");
            println!("{}", "-".repeat(51));
            for (partition, guid) in resolver.resolved_guids().iter().enumerate() {
                println!("{:<10} {:<40}", partition, guid.as_deref().unwrap_or("-"));
            }
            println!();
            println!("Unresolved: {}", resolver.unresolved_partitions());
            println!("Shared:     {}", resolver.is_shared());

            let visible: BTreeMap<MemberId, Vec<String>> = resolver
                .members()
                .into_iter()
                .map(|member| (member, resolver.member_guids(member)))
                .collect();
            println!();
            println!("{:<10} {:<10} {}", "MEMBER", "OWNS", "ASSIGNED");
            println!("{}", "-".repeat(51));
            let ownership = resolver.member_ownership();
            for (member, assigned) in allocate_snapshot_partitions("resolved", &visible)? {
                let owns = ownership
                    .get(&member)
                    .map_or(0, gridstore_common::PartitionSet::cardinality);
                println!("{:<10} {:<10} {}", member, owns, assigned.join(", "));
            }
        }
    }
    Ok(())
}

/// Parse `MEMBER=GUID[,GUID...]`
fn parse_report(report: &str) -> Result<(MemberId, Vec<String>)> {
    let Some((member, guids)) = report.split_once('=') else {
        bail!("invalid member report {report:?}, expected MEMBER=GUID[,GUID...]");
    };
    let member = member
        .trim()
        .parse()
        .with_context(|| format!("invalid member id in {report:?}"))?;
    let guids = guids
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect();
    Ok((member, guids))
}
