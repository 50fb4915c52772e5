//! Merge strategy: fold the staged files into the destination study.
//!
//! A file changes series only when the descriptor maps its source series to
//! a different target; in that case the association is recorded in the
//! [`UidMapper`] so later arrivals for the same series land identically.
//!
//! [`UidMapper`]: crate::uid_mapper::UidMapper

use super::{
    destination_file, destination_study, history_command, identity_edits, series_dir_commands,
    ReconcileProcessor,
};
use crate::command::database::UpdateStudyCountsCommand;
use crate::command::filesystem::{MoveInstanceCommand, PatchInstanceCommand};
use crate::command::Command;
use crate::context::ReconcileContext;
use crate::uid_mapper::{SaveUidMapCommand, UID_MAP_FILE};
use async_trait::async_trait;
use mira_common::instance::TAG_SERIES_INSTANCE_UID;
use mira_common::Result;
use std::collections::BTreeSet;
use std::path::PathBuf;

pub struct MergeProcessor;

#[async_trait]
impl ReconcileProcessor for MergeProcessor {
    fn name(&self) -> &'static str {
        "Merge"
    }

    async fn build_commands(
        &mut self,
        ctx: &mut ReconcileContext,
    ) -> Result<Vec<Box<dyn Command>>> {
        let study = destination_study(ctx)?;
        let storage = PathBuf::from(&study.storage_path);

        // Resolve each file's destination series through the mapper first
        // so the directory commands cover exactly the folders needed.
        let mut placements = Vec::new();
        let mut series: BTreeSet<String> = BTreeSet::new();
        for file in ctx.files.clone() {
            let source_series = file.info.series_instance_uid.clone();
            let dest_series = match ctx.descriptor.series_mapping(&source_series) {
                Some(mapping) => {
                    let target = mapping.target.clone();
                    ctx.uid_mapper.record_series(&source_series, &target)
                }
                None => ctx
                    .uid_mapper
                    .lookup_series(&source_series)
                    .map(str::to_string)
                    .unwrap_or(source_series.clone()),
            };
            series.insert(dest_series.clone());
            placements.push((file, source_series, dest_series));
        }

        let mut commands: Vec<Box<dyn Command>> = Vec::new();
        let (dir_commands, new_series) = series_dir_commands(&storage, &series).await?;
        commands.extend(dir_commands);

        let base_edits = identity_edits(&study, &ctx.descriptor);
        for (file, source_series, dest_series) in &placements {
            let mut edits = base_edits.clone();
            if dest_series != source_series {
                edits.push((TAG_SERIES_INSTANCE_UID.to_string(), dest_series.clone()));
            }
            commands.push(Box::new(PatchInstanceCommand::new(file.path.clone(), edits)));
            commands.push(Box::new(MoveInstanceCommand::new(
                file.path.clone(),
                destination_file(&storage, dest_series, &file.info.sop_instance_uid),
            )));
        }

        commands.push(Box::new(UpdateStudyCountsCommand::new(
            study.guid.clone(),
            new_series,
            ctx.files.len() as i64,
        )));

        if let Some(history) = history_command(ctx, &study.guid, Some(&study.guid))? {
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
