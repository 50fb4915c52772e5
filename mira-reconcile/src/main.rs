//! mira-reconcile - Study reconciliation worker
//!
//! Processes staged reconcile queue entries against the archive database.
//! Entries are named on the command line by guid; each is processed
//! independently, and a failure on one does not stop the rest.

use anyhow::Result;
use clap::Parser;
use mira_common::config::{self, ReconcileConfig};
use mira_common::db::init::init_database;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mira-reconcile", version, about = "Process staged study reconcile queue entries")]
struct Args {
    /// Archive filesystem root (overrides MIRA_ROOT and the config file)
    #[arg(long)]
    root: Option<PathBuf>,

    /// SQLite database path (defaults to <root>/mira.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Guids of the reconcile queue entries to process
    #[arg(required = true)]
    entries: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    info!("Starting mira-reconcile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let root = config::resolve_root_folder(args.root.as_deref());
    let db_path = config::resolve_db_path(args.db.as_deref(), &root);
    info!("Filesystem root: {}", root.display());
    info!("Database: {}", db_path.display());

    let pool = init_database(&db_path).await?;
    let cfg = ReconcileConfig::new(root, db_path);

    let mut failures = 0usize;
    for guid in &args.entries {
        match mira_reconcile::process_queue_entry(&pool, &cfg, guid).await {
            Ok(()) => info!(entry = %guid, "Entry processed"),
            Err(e) => {
                error!(entry = %guid, error = %e, "Entry failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} entries failed", failures, args.entries.len());
    }
    Ok(())
}
