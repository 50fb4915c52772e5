//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical partition of the archive (one AE title, one folder).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServerPartition {
    pub guid: String,
    pub ae_title: String,
    pub partition_folder: String,
    pub enabled: bool,
}

/// Lifecycle state of an archived study.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyStatus {
    /// Fully online and writable.
    Online,
    /// Online but frozen (e.g. pending QC sign-off).
    OnlineReadOnly,
    /// Moved to nearline storage; must be restored before mutation.
    Nearline,
}

impl StudyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudyStatus::Online => "Online",
            StudyStatus::OnlineReadOnly => "OnlineReadOnly",
            StudyStatus::Nearline => "Nearline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Online" => Some(StudyStatus::Online),
            "OnlineReadOnly" => Some(StudyStatus::OnlineReadOnly),
            "Nearline" => Some(StudyStatus::Nearline),
            _ => None,
        }
    }
}

/// An archived study together with its storage location.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Study {
    pub guid: String,
    pub partition_guid: String,
    pub study_instance_uid: String,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub accession_number: Option<String>,
    pub number_of_series: i64,
    pub number_of_instances: i64,
    pub status: String,
    pub storage_path: String,
}

impl Study {
    /// Domain predicate: can this study still be updated?
    ///
    /// Returns the human-readable reason when it cannot.
    pub fn can_update(&self) -> Result<(), String> {
        match StudyStatus::parse(&self.status) {
            Some(StudyStatus::Online) => Ok(()),
            Some(other) => Err(format!(
                "Study {} is {} and cannot be updated",
                self.study_instance_uid,
                other.as_str()
            )),
            None => Err(format!(
                "Study {} has unrecognized status '{}'",
                self.study_instance_uid, self.status
            )),
        }
    }
}

/// One staged conflict awaiting an operator (or automatic) decision.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReconcileQueueEntry {
    pub guid: String,
    pub partition_guid: String,
    /// Groups files from the same source association.
    pub group_id: String,
    /// Identifiers of the first conflicting instance (the reference file).
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub staging_path: String,
    /// Serialized detail payload; read-modify-written, never replaced.
    pub queue_data: String,
    /// Serialized reconcile descriptor (XML).
    pub description: String,
    /// Human-readable reason of the last failed attempt, if any.
    pub failure_reason: Option<String>,
    pub insert_time: DateTime<Utc>,
}

/// One conflicting object reference held by the external work queue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkQueueUid {
    pub guid: String,
    pub group_id: String,
    pub relative_path: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
}

/// Append-only audit record of a reconciliation outcome.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudyHistory {
    pub guid: String,
    /// Source storage location (the study the conflict was staged against).
    pub study_guid: String,
    /// Destination storage location, when the action produced/targeted one.
    pub dest_study_guid: Option<String>,
    pub history_type: String,
    /// Snapshot of the conflicting study-level data (JSON).
    pub study_data: String,
    /// Serialized descriptor, optionally extended with mapping detail (XML).
    pub change_description: String,
    pub insert_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn study_with_status(status: &str) -> Study {
        Study {
            guid: "g1".to_string(),
            partition_guid: "p1".to_string(),
            study_instance_uid: "1.2.3".to_string(),
            patient_name: None,
            patient_id: None,
            accession_number: None,
            number_of_series: 0,
            number_of_instances: 0,
            status: status.to_string(),
            storage_path: "/tmp/s".to_string(),
        }
    }

    #[test]
    fn online_study_is_updatable() {
        assert!(study_with_status("Online").can_update().is_ok());
    }

    #[test]
    fn nearline_study_is_not_updatable() {
        let reason = study_with_status("Nearline").can_update().unwrap_err();
        assert!(reason.contains("Nearline"));
    }

    #[test]
    fn unknown_status_is_not_updatable() {
        assert!(study_with_status("Bogus").can_update().is_err());
    }
}
