use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use statecache::{
    CURRENT_SCHEMA_VERSION, FsSnapshotStore, PersistenceCodec, SnapshotStore, upgrade_snapshots,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statecache")]
#[command(about = "Maintenance tooling for entity snapshot directories")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode one snapshot file and print it as JSON
    Inspect { file: PathBuf },
    /// Decode every snapshot in a directory and report damage
    Verify { dir: PathBuf },
    /// Rewrite every readable snapshot at the current schema version
    Upgrade {
        dir: PathBuf,
        /// Skip fsync after each rewrite
        #[arg(long)]
        no_fsync: bool,
        /// Also rewrite snapshots with dropped entries, quarantining the originals
        #[arg(long)]
        accept_damage: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { file } => inspect(&file),
        Command::Verify { dir } => verify(&dir).await,
        Command::Upgrade {
            dir,
            no_fsync,
            accept_damage,
        } => upgrade(&dir, !no_fsync, accept_damage).await,
    }
}

fn inspect(file: &Path) -> Result<()> {
    let bytes =
        fs::read(file).with_context(|| format!("Failed to read snapshot '{}'", file.display()))?;
    let decoded = PersistenceCodec::new()
        .decode(&bytes)
        .with_context(|| format!("Snapshot '{}' is unreadable", file.display()))?;

    println!("schema version: {}", decoded.version);
    if decoded.is_clean() {
        println!("dropped entries: 0");
    } else {
        println!("dropped entries: {}", decoded.dropped.len());
        for dropped in &decoded.dropped {
            println!("  - {}", dropped);
        }
    }
    let json = serde_json::to_string_pretty(&decoded.record)
        .context("Failed to render record as JSON")?;
    println!("{}", json);
    Ok(())
}

async fn verify(dir: &Path) -> Result<()> {
    let store = open_store(dir, false)?;
    let codec = PersistenceCodec::new();
    let ids = store.list().await?;

    let mut unreadable = 0usize;
    let mut damaged = 0usize;
    for id in &ids {
        let Some(bytes) = store.read(id).await? else {
            continue;
        };
        match codec.decode(&bytes) {
            Ok(decoded) if decoded.is_clean() => {}
            Ok(decoded) => {
                damaged += 1;
                println!(
                    "{}: v{} with {} dropped entries",
                    id,
                    decoded.version,
                    decoded.dropped.len()
                );
                for dropped in &decoded.dropped {
                    println!("  - {}", dropped);
                }
            }
            Err(err) => {
                unreadable += 1;
                println!("{}: unreadable: {}", id, err);
            }
        }
    }

    println!(
        "checked {} snapshots: {} unreadable, {} with dropped entries",
        ids.len(),
        unreadable,
        damaged
    );
    if unreadable > 0 || damaged > 0 {
        return Err(anyhow!("snapshot directory '{}' has damage", dir.display()));
    }
    Ok(())
}

async fn upgrade(dir: &Path, fsync: bool, accept_damage: bool) -> Result<()> {
    let store = open_store(dir, fsync)?;
    let report = upgrade_snapshots(&store, &PersistenceCodec::new(), accept_damage)
        .await
        .with_context(|| format!("Failed to upgrade snapshots in '{}'", dir.display()))?;

    for id in &report.unreadable {
        eprintln!("{}: skipped, unreadable", id);
    }
    for id in &report.damaged_skipped {
        eprintln!("{}: skipped, has dropped entries (rerun with --accept-damage)", id);
    }
    for id in &report.damaged_rewritten {
        eprintln!("{}: rewritten without dropped entries; original quarantined", id);
    }
    println!(
        "upgraded {} snapshots to v{} ({} already current, {} unreadable, {} damaged skipped)",
        report.upgraded,
        CURRENT_SCHEMA_VERSION,
        report.current,
        report.unreadable.len(),
        report.damaged_skipped.len()
    );
    Ok(())
}

fn open_store(dir: &Path, fsync: bool) -> Result<FsSnapshotStore> {
    if !dir.is_dir() {
        return Err(anyhow!("'{}' is not a directory", dir.display()));
    }
    FsSnapshotStore::open(dir, fsync)
        .with_context(|| format!("Failed to open snapshot directory '{}'", dir.display()))
}
