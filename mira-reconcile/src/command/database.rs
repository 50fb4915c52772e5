//! Database commands
//!
//! All of these run on the processor's shared update transaction, so the
//! database mutations of one run commit or roll back together. Undo is a
//! no-op: the transaction itself is the compensation.

use super::{Command, ProcessorContext};
use async_trait::async_trait;
use mira_common::db::broker;
use mira_common::db::models::Study;
use mira_common::{Error, Result};

/// Precondition: the target study must still be updatable. Fails with
/// [`Error::InvalidState`] before any mutation when it is not; ordered
/// first by the processors that need it.
pub struct CheckStudyUpdatableCommand {
    study_guid: String,
}

impl CheckStudyUpdatableCommand {
    pub fn new(study_guid: impl Into<String>) -> Self {
        Self {
            study_guid: study_guid.into(),
        }
    }
}

#[async_trait]
impl Command for CheckStudyUpdatableCommand {
    fn describe(&self) -> String {
        format!("Verify study {} is updatable", self.study_guid)
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let conn = ctx.connection().await?;
        let study = broker::find_study_by_guid(conn, &self.study_guid)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Study {}", self.study_guid)))?;

        study.can_update().map_err(|reason| Error::InvalidState {
            study_instance_uid: study.study_instance_uid.clone(),
            reason,
        })
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}

/// Insert (and thereby activate) a new study record.
pub struct InsertStudyCommand {
    study: Study,
}

impl InsertStudyCommand {
    pub fn new(study: Study) -> Self {
        Self { study }
    }
}

#[async_trait]
impl Command for InsertStudyCommand {
    fn describe(&self) -> String {
        format!("Insert study {}", self.study.study_instance_uid)
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let conn = ctx.connection().await?;
        broker::insert_study(conn, &self.study).await
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}

/// Adjust a study's series/instance counts by deltas.
pub struct UpdateStudyCountsCommand {
    study_guid: String,
    series_delta: i64,
    instance_delta: i64,
}

impl UpdateStudyCountsCommand {
    pub fn new(study_guid: impl Into<String>, series_delta: i64, instance_delta: i64) -> Self {
        Self {
            study_guid: study_guid.into(),
            series_delta,
            instance_delta,
        }
    }
}

#[async_trait]
impl Command for UpdateStudyCountsCommand {
    fn describe(&self) -> String {
        format!(
            "Update counts of study {} (+{} series, +{} instances)",
            self.study_guid, self.series_delta, self.instance_delta
        )
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let conn = ctx.connection().await?;
        broker::update_study_counts(conn, &self.study_guid, self.series_delta, self.instance_delta)
            .await
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}

/// Remove a superseded work-queue object reference.
pub struct DeleteWorkQueueUidCommand {
    uid_guid: String,
}

impl DeleteWorkQueueUidCommand {
    pub fn new(uid_guid: impl Into<String>) -> Self {
        Self {
            uid_guid: uid_guid.into(),
        }
    }
}

#[async_trait]
impl Command for DeleteWorkQueueUidCommand {
    fn describe(&self) -> String {
        format!("Delete work queue uid {}", self.uid_guid)
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let conn = ctx.connection().await?;
        broker::delete_work_queue_uid(conn, &self.uid_guid).await
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}
