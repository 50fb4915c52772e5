//! Reconcile processing context
//!
//! Everything a reconcile processor needs is assembled up front and handed
//! in as one value: the queue entry, the decoded detail payload, the staged
//! file references, the destination study and the identifier mapper. No
//! processor reads ambient state.

use crate::descriptor::StudyReconcileDescriptor;
use crate::uid_mapper::UidMapper;
use mira_common::config::ReconcileConfig;
use mira_common::db::models::{ReconcileQueueEntry, ServerPartition, Study, StudyHistory};
use mira_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata of one staged conflicting file, as recorded in the queue
/// entry's detail payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileFileInfo {
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    /// Path relative to the staging folder.
    pub relative_path: String,
}

/// Serialized descriptor of a staged conflict: where the files were staged
/// and the per-file metadata accumulated across arrivals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileQueueData {
    pub staging_path: String,
    pub files: Vec<ReconcileFileInfo>,
}

impl ReconcileQueueData {
    pub fn decode(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::UnsupportedFormat(format!("Queue detail payload unreadable: {}", e)))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize queue data: {}", e)))
    }

    /// Append a file reference unless an entry for the same sop instance is
    /// already present. Returns whether the payload changed.
    pub fn append_file(&mut self, file: ReconcileFileInfo) -> bool {
        if self
            .files
            .iter()
            .any(|f| f.sop_instance_uid == file.sop_instance_uid)
        {
            return false;
        }
        self.files.push(file);
        true
    }
}

/// One staged conflicting file resolved to its absolute location.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    pub info: ReconcileFileInfo,
}

/// Context a reconcile processor is built from.
pub struct ReconcileContext {
    pub config: ReconcileConfig,
    pub entry: ReconcileQueueEntry,
    pub partition: ServerPartition,
    pub descriptor: StudyReconcileDescriptor,
    pub queue_data: ReconcileQueueData,
    /// Latest reconcile history for the target study, if one exists.
    pub history: Option<StudyHistory>,
    /// Staged conflicting files, resolved against the recorded staging path.
    pub files: Vec<StagedFile>,
    /// The archived study the conflict was staged against. Present for
    /// merge/process-as-is; for create-new-study it is the collision source.
    pub target_study: Option<Study>,
    /// Destination study recorded by prior history, when a previous run
    /// against the same conflict already established one.
    pub dest_study: Option<Study>,
    /// Identifier mapper for this run, preloaded from the sidecar when the
    /// target study already has one.
    pub uid_mapper: UidMapper,
    /// Absolute staging folder (current or legacy layout, as recorded).
    pub staging_folder: PathBuf,
}

impl ReconcileContext {
    /// The target study, or a not-found error naming the queue entry.
    pub fn require_target_study(&self) -> Result<&Study> {
        self.target_study.as_ref().ok_or_else(|| {
            Error::NotFound(format!(
                "No archived study for queue entry {} (study {})",
                self.entry.guid, self.entry.study_instance_uid
            ))
        })
    }
}
