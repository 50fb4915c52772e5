//! Discard strategy: delete the staged files and nothing else.

use super::ReconcileProcessor;
use crate::command::filesystem::DeleteInstanceCommand;
use crate::command::Command;
use crate::context::ReconcileContext;
use async_trait::async_trait;
use mira_common::Result;

/// Terminal strategy. No database mutation; the staged conflict is dropped.
pub struct DiscardProcessor;

#[async_trait]
impl ReconcileProcessor for DiscardProcessor {
    fn name(&self) -> &'static str {
        "Discard"
    }

    async fn build_commands(
        &mut self,
        ctx: &mut ReconcileContext,
    ) -> Result<Vec<Box<dyn Command>>> {
        let mut commands: Vec<Box<dyn Command>> = Vec::new();
        for file in &ctx.files {
            commands.push(Box::new(DeleteInstanceCommand::new(file.path.clone())));
        }
        Ok(commands)
    }
}
