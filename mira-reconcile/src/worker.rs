//! Queue-entry processing
//!
//! Loads a claimed queue entry, parses its descriptor, assembles the
//! processing context and dispatches to the matching strategy. Exclusive
//! ownership of the entry is the external scheduler's guarantee; nothing
//! here locks.

use crate::context::{ReconcileContext, ReconcileQueueData, StagedFile};
use crate::descriptor::StudyReconcileDescriptorParser;
use crate::processors;
use crate::storage::{detect_layout, StagingLayout};
use crate::uid_mapper::{UidMapper, UID_MAP_FILE};
use mira_common::config::ReconcileConfig;
use mira_common::db::broker;
use mira_common::db::models::Study;
use mira_common::{Error, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Process one reconcile queue entry end to end.
///
/// On success the staged conflict has been resolved, the audit trail
/// written, and the queue entry removed. On failure all mutations have been
/// rolled back, the failure reason is recorded on the entry, and the entry
/// remains in place for a retry.
pub async fn process_queue_entry(
    pool: &SqlitePool,
    config: &ReconcileConfig,
    entry_guid: &str,
) -> Result<()> {
    let ctx = build_context(pool, config, entry_guid).await?;

    match processors::run(pool, ctx).await {
        Ok(()) => {
            let mut conn = pool.acquire().await?;
            broker::delete_queue_entry(&mut conn, entry_guid).await?;
            info!(entry = %entry_guid, "Reconcile complete, queue entry removed");
            Ok(())
        }
        Err(e) => {
            // Surface the reason on the entry; the entry itself stays
            // retryable.
            let mut conn = pool.acquire().await?;
            if let Err(update_err) =
                broker::update_queue_failure_reason(&mut conn, entry_guid, Some(&e.to_string()))
                    .await
            {
                warn!(entry = %entry_guid, error = %update_err, "Could not record failure reason");
            }
            Err(e)
        }
    }
}

async fn build_context(
    pool: &SqlitePool,
    config: &ReconcileConfig,
    entry_guid: &str,
) -> Result<ReconcileContext> {
    let mut conn = pool.acquire().await?;

    let entry = broker::find_queue_entry(&mut conn, entry_guid)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Reconcile queue entry {}", entry_guid)))?;

    let descriptor = StudyReconcileDescriptorParser::parse(&entry.description)?;

    let partition = broker::find_partition(&mut conn, &entry.partition_guid)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Partition {}", entry.partition_guid)))?;

    let queue_data = ReconcileQueueData::decode(&entry.queue_data)?;

    let staging_folder = PathBuf::from(&queue_data.staging_path);
    if detect_layout(&staging_folder) == StagingLayout::Legacy {
        debug!(
            entry = %entry.guid,
            path = %staging_folder.display(),
            "Entry staged under the legacy layout"
        );
    }

    let files: Vec<StagedFile> = queue_data
        .files
        .iter()
        .map(|info| StagedFile {
            path: staging_folder.join(&info.relative_path),
            info: info.clone(),
        })
        .collect();

    let target_study =
        broker::find_study(&mut conn, &partition.guid, &entry.study_instance_uid).await?;

    let history = match &target_study {
        Some(study) => broker::find_latest_history(&mut conn, &study.guid).await?,
        None => None,
    };

    let dest_study = match history.as_ref().and_then(|h| h.dest_study_guid.clone()) {
        Some(guid) => broker::find_study_by_guid(&mut conn, &guid).await?,
        None => None,
    };
    drop(conn);

    // The sidecar of the study this run will write into is authoritative
    // across restarts; replay it when present.
    let uid_mapper = match sidecar_study(dest_study.as_ref(), target_study.as_ref()) {
        Some(study) => {
            UidMapper::load_or_default(&Path::new(&study.storage_path).join(UID_MAP_FILE)).await?
        }
        None => UidMapper::new(),
    };

    Ok(ReconcileContext {
        config: config.clone(),
        entry,
        partition,
        descriptor,
        queue_data,
        history,
        files,
        target_study,
        dest_study,
        uid_mapper,
        staging_folder,
    })
}

fn sidecar_study<'a>(dest: Option<&'a Study>, target: Option<&'a Study>) -> Option<&'a Study> {
    dest.or(target)
}
