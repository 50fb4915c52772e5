//! Reconcile strategy processors
//!
//! Each of the four mutually exclusive actions maps 1:1 to a processor that
//! builds its command list from the processing context and executes it
//! through the rollback-capable engine. The dispatch match is exhaustive;
//! there is no fallback branch. A best-effort staging cleanup is always
//! appended as the final, non-reversible command.

mod create_study;
mod discard;
mod merge;
mod process_as_is;

pub use create_study::CreateStudyProcessor;
pub use discard::DiscardProcessor;
pub use merge::MergeProcessor;
pub use process_as_is::ProcessAsIsProcessor;

use crate::command::filesystem::CleanupStagingCommand;
use crate::command::{Command, CommandProcessor, ProcessorContext};
use crate::context::ReconcileContext;
use crate::descriptor::ReconcileAction;
use crate::history::{
    change_description, reconcile_history, InsertStudyHistoryCommand, UpdateHistoryMappingCommand,
};
use async_trait::async_trait;
use mira_common::db::models::Study;
use mira_common::instance::{
    TAG_SERIES_INSTANCE_UID, TAG_SOP_INSTANCE_UID, TAG_STUDY_INSTANCE_UID,
};
use mira_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// A reconciliation strategy: turns the processing context into the ordered
/// command list the engine will run.
#[async_trait]
pub trait ReconcileProcessor: Send {
    fn name(&self) -> &'static str;

    async fn build_commands(
        &mut self,
        ctx: &mut ReconcileContext,
    ) -> Result<Vec<Box<dyn Command>>>;
}

/// 1:1 action-to-processor dispatch. Unrecognized actions cannot reach this
/// point; the descriptor parser already fails fast on them.
pub fn processor_for(action: ReconcileAction) -> Box<dyn ReconcileProcessor> {
    match action {
        ReconcileAction::CreateNewStudy => Box::new(CreateStudyProcessor),
        ReconcileAction::Discard => Box::new(DiscardProcessor),
        ReconcileAction::Merge => Box::new(MergeProcessor),
        ReconcileAction::ProcessAsIs => Box::new(ProcessAsIsProcessor),
    }
}

/// Build and execute the processor for the context's action.
///
/// On failure the engine has already rolled the run back; the queue entry
/// is left untouched and stays retryable.
pub async fn run(pool: &SqlitePool, mut ctx: ReconcileContext) -> Result<()> {
    let mut strategy = processor_for(ctx.descriptor.action);
    info!(
        entry = %ctx.entry.guid,
        study = %ctx.entry.study_instance_uid,
        action = strategy.name(),
        files = ctx.files.len(),
        "Reconciling staged conflict"
    );

    let commands = strategy.build_commands(&mut ctx).await?;

    let engine_ctx = ProcessorContext::new(pool.clone(), ctx.config.clone());
    let mut engine = CommandProcessor::new(
        format!("{} reconcile of entry {}", strategy.name(), ctx.entry.guid),
        engine_ctx,
    );
    for command in commands {
        engine.add_command(command);
    }
    engine.add_command(Box::new(CleanupStagingCommand::new(
        ctx.staging_folder.clone(),
    )));

    engine.execute().await
}

/// Destination path of one instance inside a study's storage folder.
pub(crate) fn destination_file(storage: &Path, series_uid: &str, sop_uid: &str) -> PathBuf {
    storage
        .join(series_uid)
        .join(format!("{}.{}", sop_uid, crate::storage::INSTANCE_EXTENSION))
}

/// Directory-creation commands for the given destination series folders,
/// plus the number of folders that do not exist yet (the series-count
/// delta for the statistics update).
pub(crate) async fn series_dir_commands(
    storage: &Path,
    series: &BTreeSet<String>,
) -> Result<(Vec<Box<dyn Command>>, i64)> {
    let mut commands: Vec<Box<dyn Command>> = Vec::new();
    let mut new_series = 0i64;
    for uid in series {
        let dir = storage.join(uid);
        if !tokio::fs::try_exists(&dir).await? {
            new_series += 1;
        }
        commands.push(Box::new(
            crate::command::filesystem::CreateDirectoryCommand::new(dir),
        ));
    }
    Ok((commands, new_series))
}

/// Tag edits aligning an instance with the identity of the target study.
pub(crate) fn identity_edits(
    study: &Study,
    descriptor: &crate::descriptor::StudyReconcileDescriptor,
) -> Vec<(String, String)> {
    let mut edits = vec![(
        TAG_STUDY_INSTANCE_UID.to_string(),
        study.study_instance_uid.clone(),
    )];
    if let Some(name) = &study.patient_name {
        edits.push(("PatientName".to_string(), name.clone()));
    }
    if let Some(id) = &study.patient_id {
        edits.push(("PatientId".to_string(), id.clone()));
    }
    if let Some(accession) = &study.accession_number {
        edits.push(("AccessionNumber".to_string(), accession.clone()));
    }
    for edit in &descriptor.tag_edits.edits {
        edits.push((edit.tag.clone(), edit.value.clone()));
    }
    edits
}

/// Per-file identifier remap edits (series and, when remapped, instance).
pub(crate) fn remap_edits(dest_series: &str, dest_sop: &str) -> Vec<(String, String)> {
    vec![
        (TAG_SERIES_INSTANCE_UID.to_string(), dest_series.to_string()),
        (TAG_SOP_INSTANCE_UID.to_string(), dest_sop.to_string()),
    ]
}

/// The history-update step shared by the mutating strategies.
///
/// A first run against a study inserts the audit record. A later run against
/// the same study only touches the record when the mapper introduced new
/// associations, appending the mapping detail in place.
pub(crate) fn history_command(
    ctx: &ReconcileContext,
    study_guid: &str,
    dest_study_guid: Option<&str>,
) -> Result<Option<Box<dyn Command>>> {
    let description = change_description(&ctx.descriptor, &ctx.uid_mapper)?;

    match &ctx.history {
        None => {
            let study_data = serde_json::json!({
                "study_instance_uid": ctx.entry.study_instance_uid,
                "series_instance_uid": ctx.entry.series_instance_uid,
                "sop_instance_uid": ctx.entry.sop_instance_uid,
                "group_id": ctx.entry.group_id,
            })
            .to_string();
            let record =
                reconcile_history(study_guid, dest_study_guid, study_data, description);
            Ok(Some(Box::new(InsertStudyHistoryCommand::new(record))))
        }
        Some(existing) if ctx.uid_mapper.dirty() => Ok(Some(Box::new(
            UpdateHistoryMappingCommand::new(existing.guid.clone(), description),
        ))),
        Some(_) => Ok(None),
    }
}

/// Destination study for merge/process-as-is: the study recorded by prior
/// history when present, otherwise the archived study the conflict was
/// staged against.
pub(crate) fn destination_study(ctx: &ReconcileContext) -> Result<Study> {
    if let Some(dest) = &ctx.dest_study {
        return Ok(dest.clone());
    }
    ctx.require_target_study().cloned().map_err(|_| {
        Error::NotFound(format!(
            "Queue entry {} has no destination study",
            ctx.entry.guid
        ))
    })
}
