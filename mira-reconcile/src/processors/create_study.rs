//! Create-new-study strategy: give the staged files a study of their own.
//!
//! Series and instance identifiers are remapped through the [`UidMapper`]
//! so a collision with the archived study cannot occur; associations the
//! mapper already holds (replayed from the sidecar after a restart) are
//! reused rather than reallocated. When prior history already established a
//! destination study, later arrivals are routed into it instead of creating
//! a second study.
//!
//! [`UidMapper`]: crate::uid_mapper::UidMapper

use super::{
    destination_file, history_command, remap_edits, series_dir_commands, ReconcileProcessor,
};
use crate::command::database::{InsertStudyCommand, UpdateStudyCountsCommand};
use crate::command::filesystem::{CreateDirectoryCommand, MoveInstanceCommand, PatchInstanceCommand};
use crate::command::Command;
use crate::context::ReconcileContext;
use crate::storage::study_storage_folder;
use crate::uid_mapper::{SaveUidMapCommand, UID_MAP_FILE};
use async_trait::async_trait;
use mira_common::db::models::{Study, StudyStatus};
use mira_common::instance::{self, InstanceDocument, TAG_STUDY_INSTANCE_UID};
use mira_common::{Error, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

pub struct CreateStudyProcessor;

#[async_trait]
impl ReconcileProcessor for CreateStudyProcessor {
    fn name(&self) -> &'static str {
        "CreateNewStudy"
    }

    async fn build_commands(
        &mut self,
        ctx: &mut ReconcileContext,
    ) -> Result<Vec<Box<dyn Command>>> {
        // Resume into the study a previous run created, or allocate a new
        // storage location.
        let resume = ctx.dest_study.clone();
        let new_study_uid = match &resume {
            Some(dest) => dest.study_instance_uid.clone(),
            None => target_study_uid(ctx),
        };
        let storage = match &resume {
            Some(dest) => PathBuf::from(&dest.storage_path),
            None => study_storage_folder(
                &ctx.config.filesystem_root,
                &ctx.partition.partition_folder,
                &new_study_uid,
            ),
        };

        let mut commands: Vec<Box<dyn Command>> = Vec::new();
        commands.push(Box::new(CreateDirectoryCommand::new(storage.clone())));

        // Resolve every file's destination identifiers up front; lookups
        // are idempotent, so a restarted run lands on the same values.
        let mut placements = Vec::new();
        let mut series: BTreeSet<String> = BTreeSet::new();
        for file in &ctx.files {
            let dest_series = ctx.uid_mapper.series_uid(&file.info.series_instance_uid);
            let dest_sop = ctx.uid_mapper.instance_uid(&file.info.sop_instance_uid);
            series.insert(dest_series.clone());
            placements.push((file.clone(), dest_series, dest_sop));
        }

        let (dir_commands, _) = series_dir_commands(&storage, &series).await?;
        commands.extend(dir_commands);

        for (file, dest_series, dest_sop) in &placements {
            let mut edits = vec![(TAG_STUDY_INSTANCE_UID.to_string(), new_study_uid.clone())];
            edits.extend(remap_edits(dest_series, dest_sop));
            for edit in &ctx.descriptor.tag_edits.edits {
                edits.push((edit.tag.clone(), edit.value.clone()));
            }
            commands.push(Box::new(PatchInstanceCommand::new(file.path.clone(), edits)));
            commands.push(Box::new(MoveInstanceCommand::new(
                file.path.clone(),
                destination_file(&storage, dest_series, dest_sop),
            )));
        }

        let study_guid = match &resume {
            Some(dest) => {
                commands.push(Box::new(UpdateStudyCountsCommand::new(
                    dest.guid.clone(),
                     series_not_yet_stored(&storage, &series).await?,
                    ctx.files.len() as i64,
                )));
                dest.guid.clone()
            }
            None => {
                let study = new_study_record(ctx, &new_study_uid, &storage, series.len()).await?;
                let guid = study.guid.clone();
                commands.push(Box::new(InsertStudyCommand::new(study)));
                guid
            }
        };

        // History hangs off the collision source so late arrivals for the
        // original study can be routed to the destination created here.
        let source_guid = ctx
            .target_study
            .as_ref()
            .map(|s| s.guid.clone())
            .unwrap_or_else(|| study_guid.clone());
        if let Some(history) = history_command(ctx, &source_guid, Some(&study_guid))? {
            commands.push(history);
        }

        if ctx.uid_mapper.dirty() {
            commands.push(Box::new(SaveUidMapCommand::new(
                storage.join(UID_MAP_FILE),
                ctx.uid_mapper.clone(),
            )));
        }

        Ok(commands)
    }
}

/// Study uid for the new study: an explicit tag edit wins; otherwise a
/// fresh uid when the staged uid collides with an archived study, else the
/// staged uid itself.
fn target_study_uid(ctx: &ReconcileContext) -> String {
    if let Some(edit) = ctx
        .descriptor
        .tag_edits
        .edits
        .iter()
        .find(|e| e.tag == TAG_STUDY_INSTANCE_UID)
    {
        return edit.value.clone();
    }
    if ctx.target_study.is_some() {
        instance::new_uid()
    } else {
        ctx.entry.study_instance_uid.clone()
    }
}

/// Series folders among the destinations that do not exist yet.
async fn series_not_yet_stored(storage: &PathBuf, series: &BTreeSet<String>) -> Result<i64> {
    let mut count = 0i64;
    for uid in series {
        if !tokio::fs::try_exists(storage.join(uid)).await? {
            count += 1;
        }
    }
    Ok(count)
}

/// Build the record for the study being activated, taking identifying
/// attributes from the first staged file.
async fn new_study_record(
    ctx: &ReconcileContext,
    study_instance_uid: &str,
    storage: &PathBuf,
    series_count: usize,
) -> Result<Study> {
    let first = ctx
        .files
        .first()
        .ok_or_else(|| Error::Internal("No staged files to reconcile".to_string()))?;
    let document = InstanceDocument::load(&first.path).await?;

    let attribute = |tag: &str| -> Option<String> {
        ctx.descriptor
            .tag_edits
            .edits
            .iter()
            .find(|e| e.tag == tag)
            .map(|e| e.value.clone())
            .or_else(|| document.tag(tag).map(str::to_string))
    };

    Ok(Study {
        guid: Uuid::new_v4().to_string(),
        partition_guid: ctx.partition.guid.clone(),
        study_instance_uid: study_instance_uid.to_string(),
        patient_name: attribute("PatientName"),
        patient_id: attribute("PatientId"),
        accession_number: attribute("AccessionNumber"),
        number_of_series: series_count as i64,
        number_of_instances: ctx.files.len() as i64,
        status: StudyStatus::Online.as_str().to_string(),
        storage_path: storage.display().to_string(),
    })
}
