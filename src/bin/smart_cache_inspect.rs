//! smart-cache-inspect: 缓存快照检查、备份管理与恢复的命令行工具
//!
//! Usage:
//!   smart-cache-inspect validate <dir> <cache_type>        Validate the primary snapshot
//!   smart-cache-inspect backups <dir> <cache_type>         List backups and their validity
//!   smart-cache-inspect restore <dir> <cache_type>         Promote the newest valid backup
//!   smart-cache-inspect prune <dir> <cache_type> <keep>    Keep only the newest N backups
//!   smart-cache-inspect show <dir> <cache_type> [limit]    Print records as JSON

use anyhow::{bail, Context, Result};
use smart_cache::clock::system_clock;
use smart_cache::config::StoreConfig;
use smart_cache::store::{validate_bytes, CacheStore, FileBackend, SnapshotBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "validate" => cmd_validate(&args[2..]).await,
        "backups" => cmd_backups(&args[2..]).await,
        "restore" => cmd_restore(&args[2..]).await,
        "prune" => cmd_prune(&args[2..]).await,
        "show" => cmd_show(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("smart-cache-inspect {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"smart-cache-inspect: 缓存快照检查工具

USAGE:
    smart-cache-inspect <COMMAND> <dir> <cache_type> [ARGS]

COMMANDS:
    validate <dir> <cache_type>         Validate the primary snapshot
    backups <dir> <cache_type>          List backups, newest first
    restore <dir> <cache_type>          Promote the newest valid backup to primary
    prune <dir> <cache_type> <keep>     Delete all but the newest <keep> backups
    show <dir> <cache_type> [limit]     Print the first [limit] records as JSON
    version                             Show version information
    help                                Show this help message

ENVIRONMENT:
    RUST_LOG                            Log filter (default: warn)"#
    );
}

struct Target {
    dir: PathBuf,
    cache_type: String,
}

fn target(args: &[String]) -> Result<Target> {
    match (args.first(), args.get(1)) {
        (Some(dir), Some(cache_type)) => Ok(Target {
            dir: PathBuf::from(dir),
            cache_type: cache_type.clone(),
        }),
        _ => bail!("expected <dir> <cache_type>"),
    }
}

fn open_store(t: &Target) -> CacheStore {
    // Zero TTL: every load goes to disk.
    let config = StoreConfig {
        dir: t.dir.clone(),
        ..StoreConfig::default()
    }
    .with_memory_ttl(Duration::ZERO);
    CacheStore::open(
        t.cache_type.clone(),
        &config,
        Arc::new(FileBackend::new(t.dir.clone())),
        system_clock(),
    )
}

async fn cmd_validate(args: &[String]) -> Result<()> {
    let t = target(args)?;
    let backend = FileBackend::new(t.dir.clone());
    let path = backend.primary_path(&t.cache_type);
    let bytes = backend
        .read_primary(&t.cache_type)
        .await?
        .with_context(|| format!("{} does not exist", path.display()))?;

    match validate_bytes(&bytes) {
        Ok(snapshot) => {
            println!("✓ {} ({} bytes)", path.display(), bytes.len());
            println!("  records:                  {}", snapshot.len());
            println!("  generated_at:             {}", fmt_time(snapshot.generated_at));
            println!(
                "  last_enrichment_sweep_at: {}",
                fmt_time(snapshot.last_enrichment_sweep_at)
            );
            Ok(())
        }
        Err(e) => {
            println!("✗ {}", path.display());
            bail!(e)
        }
    }
}

async fn cmd_backups(args: &[String]) -> Result<()> {
    let t = target(args)?;
    let backend = FileBackend::new(t.dir.clone());
    let ids = backend.list_backups(&t.cache_type).await?;
    if ids.is_empty() {
        println!("No backups for {} in {}", t.cache_type, t.dir.display());
        return Ok(());
    }
    println!("{} backup(s), newest first:", ids.len());
    for id in ids {
        let status = match backend.read_backup(&t.cache_type, &id).await? {
            Some(bytes) => match validate_bytes(&bytes) {
                Ok(snapshot) => format!("✓ {} records", snapshot.len()),
                Err(e) => format!("✗ {e}"),
            },
            None => "✗ vanished".to_string(),
        };
        println!("  {id}  {status}");
    }
    Ok(())
}

async fn cmd_restore(args: &[String]) -> Result<()> {
    let t = target(args)?;
    let store = open_store(&t);
    let Some((snapshot, id)) = store.restore_from_backup().await else {
        bail!("no valid backup for {}", t.cache_type);
    };
    let records = snapshot.len();
    store.save(snapshot).await.context("writing restored snapshot")?;
    println!("Restored {} ({} records) from backup {}", t.cache_type, records, id);
    Ok(())
}

async fn cmd_prune(args: &[String]) -> Result<()> {
    let t = target(args)?;
    let keep: usize = args
        .get(2)
        .context("expected <keep>")?
        .parse()
        .context("<keep> must be a non-negative integer")?;
    let removed = open_store(&t).prune_backups(keep).await?;
    println!("Removed {removed} backup(s), kept at most {keep}");
    Ok(())
}

async fn cmd_show(args: &[String]) -> Result<()> {
    let t = target(args)?;
    let limit = match args.get(2) {
        Some(s) => Some(s.parse::<usize>().context("[limit] must be an integer")?),
        None => None,
    };
    let outcome = open_store(&t).load().await?;
    if outcome.emergency_refresh {
        bail!("snapshot and all backups are invalid");
    }
    eprintln!("source: {:?}", outcome.source);
    let records = outcome.snapshot.head(limit);
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

fn fmt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
}
