//! Audit-trail commands
//!
//! Every successful reconcile run leaves a history record linking the
//! source and destination storage locations with the serialized descriptor
//! that drove it. Records are updated in place to add mapping detail and
//! are never deleted.

use crate::command::{Command, ProcessorContext};
use crate::descriptor::{SeriesMapping, StudyReconcileDescriptor};
use crate::uid_mapper::UidMapper;
use async_trait::async_trait;
use chrono::Utc;
use mira_common::db::broker;
use mira_common::db::models::StudyHistory;
use mira_common::Result;
use uuid::Uuid;

/// History type recorded for reconcile outcomes.
pub const HISTORY_TYPE_RECONCILED: &str = "StudyReconciled";

/// Serialize the descriptor for the audit record, folding in any series
/// associations the mapper introduced beyond what the descriptor already
/// carried.
pub fn change_description(
    descriptor: &StudyReconcileDescriptor,
    mapper: &UidMapper,
) -> Result<String> {
    let mut extended = descriptor.clone();
    for (source, target) in mapper.series_map() {
        if extended.series_mapping(source).is_none() {
            extended.series_mappings.mappings.push(SeriesMapping {
                source: source.clone(),
                target: target.clone(),
            });
        }
    }
    extended.to_xml()
}

/// Build a reconcile history record.
pub fn reconcile_history(
    study_guid: &str,
    dest_study_guid: Option<&str>,
    study_data: String,
    change_description: String,
) -> StudyHistory {
    StudyHistory {
        guid: Uuid::new_v4().to_string(),
        study_guid: study_guid.to_string(),
        dest_study_guid: dest_study_guid.map(str::to_string),
        history_type: HISTORY_TYPE_RECONCILED.to_string(),
        study_data,
        change_description,
        insert_time: Utc::now(),
    }
}

/// Append a new audit record. Runs on the shared transaction, so it only
/// becomes visible once the storage mutations of the same run commit.
pub struct InsertStudyHistoryCommand {
    history: StudyHistory,
}

impl InsertStudyHistoryCommand {
    pub fn new(history: StudyHistory) -> Self {
        Self { history }
    }
}

#[async_trait]
impl Command for InsertStudyHistoryCommand {
    fn describe(&self) -> String {
        format!("Insert history record for study {}", self.history.study_guid)
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let conn = ctx.connection().await?;
        broker::insert_history(conn, &self.history).await
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}

/// Update an existing record's change description in place (adds mapping
/// detail accumulated by later runs against the same study).
pub struct UpdateHistoryMappingCommand {
    history_guid: String,
    change_description: String,
}

impl UpdateHistoryMappingCommand {
    pub fn new(history_guid: impl Into<String>, change_description: String) -> Self {
        Self {
            history_guid: history_guid.into(),
            change_description,
        }
    }
}

#[async_trait]
impl Command for UpdateHistoryMappingCommand {
    fn describe(&self) -> String {
        format!("Update history record {}", self.history_guid)
    }

    async fn execute(&mut self, ctx: &mut ProcessorContext) -> Result<()> {
        let conn = ctx.connection().await?;
        broker::update_history_description(conn, &self.history_guid, &self.change_description).await
    }

    async fn undo(&mut self, _ctx: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}
