//! Process-as-is strategy: accept the staged files into the existing study.
//!
//! The target study must still be updatable; the precondition command runs
//! first so an invalid-state failure aborts before any mutation.

use super::{
    destination_file, destination_study, history_command, identity_edits, series_dir_commands,
    ReconcileProcessor,
};
use crate::command::database::{CheckStudyUpdatableCommand, UpdateStudyCountsCommand};
use crate::command::filesystem::{MoveInstanceCommand, PatchInstanceCommand};
use crate::command::Command;
use crate::context::ReconcileContext;
use async_trait::async_trait;
use mira_common::Result;
use std::collections::BTreeSet;
use std::path::PathBuf;

pub struct ProcessAsIsProcessor;

#[async_trait]
impl ReconcileProcessor for ProcessAsIsProcessor {
    fn name(&self) -> &'static str {
        "ProcessAsIs"
    }

    async fn build_commands(
        &mut self,
        ctx: &mut ReconcileContext,
    ) -> Result<Vec<Box<dyn Command>>> {
        let study = destination_study(ctx)?;
        let storage = PathBuf::from(&study.storage_path);

        let mut commands: Vec<Box<dyn Command>> = Vec::new();
        commands.push(Box::new(CheckStudyUpdatableCommand::new(study.guid.clone())));

        let series: BTreeSet<String> = ctx
            .files
            .iter()
            .map(|f| f.info.series_instance_uid.clone())
            .collect();
        let (dir_commands, new_series) = series_dir_commands(&storage, &series).await?;
        commands.extend(dir_commands);

        let edits = identity_edits(&study, &ctx.descriptor);
        for file in &ctx.files {
            commands.push(Box::new(PatchInstanceCommand::new(
                file.path.clone(),
                edits.clone(),
            )));
            commands.push(Box::new(MoveInstanceCommand::new(
                file.path.clone(),
                destination_file(
                    &storage,
                    &file.info.series_instance_uid,
                    &file.info.sop_instance_uid,
                ),
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

        Ok(commands)
    }
}
