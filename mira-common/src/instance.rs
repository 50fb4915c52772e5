//! Instance documents
//!
//! Wire-level image parsing happens upstream of this subsystem. What flows
//! through reconciliation is a pre-decoded header for each image instance:
//! the three addressing identifiers plus the identifying attributes the
//! protocol layer extracted (patient name, patient id, accession number and
//! so on). Commands read, patch and rewrite these documents; pixel data
//! never transits this crate.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Attribute names with dedicated fields on [`InstanceDocument`].
pub const TAG_STUDY_INSTANCE_UID: &str = "StudyInstanceUid";
pub const TAG_SERIES_INSTANCE_UID: &str = "SeriesInstanceUid";
pub const TAG_SOP_INSTANCE_UID: &str = "SopInstanceUid";

/// Pre-decoded header of one image instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDocument {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    /// Remaining identifying attributes, keyed by attribute name.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl InstanceDocument {
    pub fn new(
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
    ) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: series_instance_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Read a document from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(|e| {
            Error::UnsupportedFormat(format!(
                "Instance document {} is not readable: {}",
                path.display(),
                e
            ))
        })
    }

    /// Write the document to disk, replacing any existing file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize instance: {}", e)))?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Set an attribute by name, returning the previous value.
    ///
    /// The three addressing identifiers are routed to their dedicated
    /// fields; everything else lands in the attribute map.
    pub fn set_tag(&mut self, tag: &str, value: &str) -> Option<String> {
        match tag {
            TAG_STUDY_INSTANCE_UID => {
                Some(std::mem::replace(&mut self.study_instance_uid, value.to_string()))
            }
            TAG_SERIES_INSTANCE_UID => {
                Some(std::mem::replace(&mut self.series_instance_uid, value.to_string()))
            }
            TAG_SOP_INSTANCE_UID => {
                Some(std::mem::replace(&mut self.sop_instance_uid, value.to_string()))
            }
            other => self.attributes.insert(other.to_string(), value.to_string()),
        }
    }

    /// Get an attribute by name.
    pub fn tag(&self, tag: &str) -> Option<&str> {
        match tag {
            TAG_STUDY_INSTANCE_UID => Some(&self.study_instance_uid),
            TAG_SERIES_INSTANCE_UID => Some(&self.series_instance_uid),
            TAG_SOP_INSTANCE_UID => Some(&self.sop_instance_uid),
            other => self.attributes.get(other).map(String::as_str),
        }
    }
}

/// Allocate a fresh UID under the UUID-derived root (`2.25.<decimal>`).
pub fn new_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}
