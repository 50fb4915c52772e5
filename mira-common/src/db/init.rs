//! Database initialization
//!
//! Opens (or creates) the SQLite database and brings the schema up.
//! All table creation is idempotent, so initialization is safe to run on
//! every startup.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize the database connection pool and create tables if needed.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables (idempotent). Split out so tests can run it against an
/// in-memory pool.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_server_partitions_table(pool).await?;
    create_studies_table(pool).await?;
    create_reconcile_queue_table(pool).await?;
    create_work_queue_uids_table(pool).await?;
    create_study_history_table(pool).await?;
    Ok(())
}

pub async fn create_server_partitions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS server_partitions (
            guid TEXT PRIMARY KEY,
            ae_title TEXT NOT NULL UNIQUE,
            partition_folder TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_studies_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS studies (
            guid TEXT PRIMARY KEY,
            partition_guid TEXT NOT NULL REFERENCES server_partitions(guid),
            study_instance_uid TEXT NOT NULL,
            patient_name TEXT,
            patient_id TEXT,
            accession_number TEXT,
            number_of_series INTEGER NOT NULL DEFAULT 0,
            number_of_instances INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'Online',
            storage_path TEXT NOT NULL,
            UNIQUE (partition_guid, study_instance_uid)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_reconcile_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconcile_queue (
            guid TEXT PRIMARY KEY,
            partition_guid TEXT NOT NULL REFERENCES server_partitions(guid),
            group_id TEXT NOT NULL,
            study_instance_uid TEXT NOT NULL,
            series_instance_uid TEXT NOT NULL,
            sop_instance_uid TEXT NOT NULL,
            staging_path TEXT NOT NULL,
            queue_data TEXT NOT NULL,
            description TEXT NOT NULL,
            failure_reason TEXT,
            insert_time TEXT NOT NULL,
            UNIQUE (partition_guid, group_id, study_instance_uid)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_work_queue_uids_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_queue_uids (
            guid TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            series_instance_uid TEXT NOT NULL,
            sop_instance_uid TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_study_history_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS study_history (
            guid TEXT PRIMARY KEY,
            study_guid TEXT NOT NULL,
            dest_study_guid TEXT,
            history_type TEXT NOT NULL DEFAULT 'StudyReconciled',
            study_data TEXT NOT NULL,
            change_description TEXT NOT NULL,
            insert_time TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
