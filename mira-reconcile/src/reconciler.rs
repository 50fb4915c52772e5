//! Conflict staging and history-driven auto-reconciliation
//!
//! When an incoming image disagrees with previously archived data for the
//! same study, [`ImageReconciler::schedule_reconcile`] stages the file and
//! records (or extends) the queue entry atomically. [`AutoReconciler`]
//! applies a previously recorded decision to a late-arriving image so the
//! operator never answers the same question twice.

use crate::command::database::DeleteWorkQueueUidCommand;
use crate::command::filesystem::{CreateDirectoryCommand, SaveInstanceCommand};
use crate::command::{Command, CommandProcessor, ProcessorContext};
use crate::context::{ReconcileFileInfo, ReconcileQueueData};
use crate::descriptor::{ReconcileAction, StudyReconcileDescriptorParser};
use crate::storage::{ReconcileStorage, INSTANCE_EXTENSION};
use crate::uid_mapper::{UidMapper, UID_MAP_FILE};
use async_trait::async_trait;
use chrono::Utc;
use mira_common::config::ReconcileConfig;
use mira_common::db::broker;
use mira_common::db::models::{ReconcileQueueEntry, ServerPartition, Study};
use mira_common::instance::{InstanceDocument, TAG_STUDY_INSTANCE_UID};
use mira_common::{Error, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Stages conflicting images pending a resolution decision.
pub struct ImageReconciler {
    pool: SqlitePool,
    config: ReconcileConfig,
}

impl ImageReconciler {
    pub fn new(pool: SqlitePool, config: ReconcileConfig) -> Self {
        Self { pool, config }
    }

    /// Stage a conflicting instance and insert-or-extend the queue entry.
    ///
    /// The staging write and the queue mutation run in one processor, so a
    /// failure leaves neither behind. Multiple conflicting instances of the
    /// same study and group accumulate in one entry's detail payload.
    pub async fn schedule_reconcile(
        &self,
        partition: &ServerPartition,
        group_id: &str,
        document: &InstanceDocument,
        descriptor_xml: &str,
        superseded_uid: Option<&str>,
    ) -> Result<ReconcileQueueEntry> {
        // A malformed or deprecated descriptor must fail before any
        // queueing side effect.
        StudyReconcileDescriptorParser::parse(descriptor_xml)?;

        let storage = ReconcileStorage::new(
            &self.config.filesystem_root,
            &partition.partition_folder,
            group_id,
            &document.study_instance_uid,
        );
        let staging_folder = storage.staging_folder();
        let staged_file = storage.instance_file(&document.sop_instance_uid);

        let file_info = ReconcileFileInfo {
            series_instance_uid: document.series_instance_uid.clone(),
            sop_instance_uid: document.sop_instance_uid.clone(),
            relative_path: format!("{}.{}", document.sop_instance_uid, INSTANCE_EXTENSION),
        };

        let candidate = ReconcileQueueEntry {
            guid: Uuid::new_v4().to_string(),
            partition_guid: partition.guid.clone(),
            group_id: group_id.to_string(),
            study_instance_uid: document.study_instance_uid.clone(),
            series_instance_uid: document.series_instance_uid.clone(),
            sop_instance_uid: document.sop_instance_uid.clone(),
            staging_path: staging_folder.display().to_string(),
            queue_data: ReconcileQueueData {
                staging_path: staging_folder.display().to_string(),
                files: vec![file_info.clone()],
            }
            .encode()?,
            description: descriptor_xml.to_string(),
            failure_reason: None,
            insert_time: Utc::now(),
        };

        let ctx = ProcessorContext::new(self.pool.clone(), self.config.clone());
        let mut processor = CommandProcessor::new(
            format!("Stage conflict for study {}", document.study_instance_uid),
            ctx,
        );
        processor.add_command(Box::new(CreateDirectoryCommand::new(&staging_folder)));
        processor.add_command(Box::new(SaveInstanceCommand::new(
            document.clone(),
            &staged_file,
            false,
        )));
        processor.add_command(Box::new(InsertOrUpdateReconcileQueueCommand::new(
            candidate, file_info,
        )));
        if let Some(uid_guid) = superseded_uid {
            processor.add_command(Box::new(DeleteWorkQueueUidCommand::new(uid_guid)));
        }

        processor.execute().await?;

        // Re-read the authoritative row; an earlier arrival may own the
        // natural key.
        let mut conn = self.pool.acquire().await?;
        let entry = broker::find_queue_entry_by_key(
            &mut conn,
            &partition.guid,
            group_id,
            &document.study_instance_uid,
        )
        .await?
        .ok_or_else(|| Error::Internal("Queue entry vanished after staging".to_string()))?;

        info!(
            entry = %entry.guid,
            study = %entry.study_instance_uid,
            group = %entry.group_id,
            "Conflict staged"
        );
        Ok(entry)
    }
}

/// Insert a queue row on its natural key, or extend the existing row's
/// detail payload with the new file reference. The payload is
/// read-modify-written, never replaced, so file references accumulated
/// across earlier arrivals survive.
struct InsertOrUpdateReconcileQueueCommand {
    candidate: ReconcileQueueEntry,
    file_info: ReconcileFileInfo,
}

impl InsertOrUpdateReconcileQueueCommand {
    fn new(candidate: ReconcileQueueEntry, file_info: ReconcileFileInfo) -> Self {
        Self {
            candidate,
            file_info,
        }
    }
}

#[async_trait]
impl Command for InsertOrUpdateReconcileQueueCommand {
    fn describe(&self) -> String {
        format!(
            "Insert or update queue entry for study {} (group {})",
            self.candidate.study_instance_uid, self.candidate.group_id
        )
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let conn = ctx.connection().await?;
        let (existing, created) = broker::find_or_insert_queue_entry(conn, &self.candidate).await?;
        if created {
            debug!(entry = %self.candidate.guid, "Created queue entry");
            return Ok(());
        }

        let mut data = ReconcileQueueData::decode(&existing.queue_data)?;
        if data.append_file(self.file_info.clone()) {
            let conn = ctx.connection().await?;
            broker::update_queue_data(conn, &existing.guid, &data.encode()?).await?;
            debug!(
                entry = %existing.guid,
                files = data.files.len(),
                "Extended queue entry detail payload"
            );
        }
        Ok(())
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}

/// Outcome of applying recorded history to a late-arriving instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoReconcileOutcome {
    /// The recorded decision was to discard conflicting images.
    Discard,
    /// The instance was retargeted to the recorded destination study; the
    /// document has been patched accordingly.
    Retargeted { dest_study_guid: String },
}

/// Applies a past reconcile decision to a new instance of the same study.
pub struct AutoReconciler {
    pool: SqlitePool,
    config: ReconcileConfig,
}

impl AutoReconciler {
    pub fn new(pool: SqlitePool, config: ReconcileConfig) -> Self {
        Self { pool, config }
    }

    /// Look up the latest reconcile history for `source_study` and apply it
    /// to `document`. Returns `None` when no history exists (the caller
    /// falls back to regular staging).
    pub async fn apply_history(
        &self,
        source_study: &Study,
        document: &mut InstanceDocument,
    ) -> Result<Option<AutoReconcileOutcome>> {
        let mut conn = self.pool.acquire().await?;
        let Some(history) = broker::find_latest_history(&mut conn, &source_study.guid).await?
        else {
            return Ok(None);
        };

        let descriptor = StudyReconcileDescriptorParser::parse(&history.change_description)?;

        match descriptor.action {
            ReconcileAction::Discard => Ok(Some(AutoReconcileOutcome::Discard)),
            ReconcileAction::ProcessAsIs => {
                let dest = self
                    .destination_study(&mut conn, history.dest_study_guid.as_deref())
                    .await?;
                ensure_updatable(&dest)?;
                document.set_tag(TAG_STUDY_INSTANCE_UID, &dest.study_instance_uid);
                Ok(Some(AutoReconcileOutcome::Retargeted {
                    dest_study_guid: dest.guid,
                }))
            }
            ReconcileAction::CreateNewStudy | ReconcileAction::Merge => {
                let dest = self
                    .destination_study(&mut conn, history.dest_study_guid.as_deref())
                    .await?;
                ensure_updatable(&dest)?;
                drop(conn);

                // Replay the persisted associations so the new instance
                // lands with the same identifiers as its predecessors.
                let map_path = Path::new(&dest.storage_path).join(UID_MAP_FILE);
                let mut mapper = UidMapper::load_or_default(&map_path).await?;

                document.set_tag(TAG_STUDY_INSTANCE_UID, &dest.study_instance_uid);
                let series = mapper.series_uid(&document.series_instance_uid);
                let sop = mapper.instance_uid(&document.sop_instance_uid);
                document.series_instance_uid = series;
                document.sop_instance_uid = sop;

                if mapper.dirty() {
                    mapper.save(&map_path).await?;
                }

                Ok(Some(AutoReconcileOutcome::Retargeted {
                    dest_study_guid: dest.guid,
                }))
            }
        }
    }

    async fn destination_study(
        &self,
        conn: &mut sqlx::SqliteConnection,
        dest_study_guid: Option<&str>,
    ) -> Result<Study> {
        let guid = dest_study_guid
            .ok_or_else(|| Error::NotFound("History records no destination study".to_string()))?;
        broker::find_study_by_guid(conn, guid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Destination study {}", guid)))
    }
}

fn ensure_updatable(study: &Study) -> Result<()> {
    study.can_update().map_err(|reason| Error::InvalidState {
        study_instance_uid: study.study_instance_uid.clone(),
        reason,
    })
}

impl ImageReconciler {
    /// Staging folder that would be used for a conflict, for callers that
    /// need to inspect it (diagnostics, cleanup tooling).
    pub fn staging_folder_for(
        &self,
        partition: &ServerPartition,
        group_id: &str,
        study_instance_uid: &str,
    ) -> PathBuf {
        ReconcileStorage::new(
            &self.config.filesystem_root,
            &partition.partition_folder,
            group_id,
            study_instance_uid,
        )
        .staging_folder()
    }
}
