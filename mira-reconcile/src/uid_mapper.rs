//! Per-study identifier remapping
//!
//! When reconciliation assigns fresh series/instance identifiers (to avoid
//! collisions when creating a new study, or to land files in a different
//! destination series on merge), the old-to-new associations are recorded
//! here. The map is persisted as an XML sidecar next to the study so a
//! restarted worker replays the identical associations; allocating a
//! different mapping mid-study would corrupt cross-series references.

use mira_common::{instance, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Sidecar file name, fixed relative to the study's storage root.
pub const UID_MAP_FILE: &str = "UidMap.xml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MapEntry {
    #[serde(rename = "@Source")]
    source: String,
    #[serde(rename = "@Target")]
    target: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MapSection {
    #[serde(rename = "Map", default)]
    maps: Vec<MapEntry>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "UidMap")]
struct UidMapXml {
    #[serde(rename = "Series", default)]
    series: MapSection,
    #[serde(rename = "Instances", default)]
    instances: MapSection,
}

/// Old-to-new identifier associations for one reconciliation run.
#[derive(Debug, Default, Clone)]
pub struct UidMapper {
    series: BTreeMap<String, String>,
    instances: BTreeMap<String, String>,
    dirty: bool,
}

impl UidMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing mapping for a source series uid, if any.
    pub fn lookup_series(&self, source: &str) -> Option<&str> {
        self.series.get(source).map(String::as_str)
    }

    /// Existing mapping for a source instance uid, if any.
    pub fn lookup_instance(&self, source: &str) -> Option<&str> {
        self.instances.get(source).map(String::as_str)
    }

    /// Mapped series uid for `source`, allocating (and caching) a fresh uid
    /// on first sight. Idempotent within a pass.
    pub fn series_uid(&mut self, source: &str) -> String {
        if let Some(target) = self.series.get(source) {
            return target.clone();
        }
        let target = instance::new_uid();
        self.series.insert(source.to_string(), target.clone());
        self.dirty = true;
        target
    }

    /// Mapped instance uid for `source`, allocating on first sight.
    pub fn instance_uid(&mut self, source: &str) -> String {
        if let Some(target) = self.instances.get(source) {
            return target.clone();
        }
        let target = instance::new_uid();
        self.instances.insert(source.to_string(), target.clone());
        self.dirty = true;
        target
    }

    /// Record an explicit series mapping. A new association is introduced
    /// only when the target actually differs from the source; an existing
    /// association for `source` always wins.
    pub fn record_series(&mut self, source: &str, target: &str) -> String {
        if let Some(existing) = self.series.get(source) {
            return existing.clone();
        }
        if source == target {
            return source.to_string();
        }
        self.series.insert(source.to_string(), target.to_string());
        self.dirty = true;
        target.to_string()
    }

    /// Whether this run introduced associations not yet persisted. Consumed
    /// by the history-update step to decide whether mapping detail must be
    /// appended to the audit record.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn series_map(&self) -> &BTreeMap<String, String> {
        &self.series
    }

    pub fn instance_map(&self) -> &BTreeMap<String, String> {
        &self.instances
    }

    /// Persist the map as the XML sidecar and clear the dirty flag.
    pub async fn save(&mut self, path: &Path) -> Result<()> {
        let xml = UidMapXml {
            series: MapSection {
                maps: to_entries(&self.series),
            },
            instances: MapSection {
                maps: to_entries(&self.instances),
            },
        };
        let content = quick_xml::se::to_string(&xml)
            .map_err(|e| Error::Internal(format!("Failed to serialize uid map: {}", e)))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        self.dirty = false;
        Ok(())
    }

    /// Restore a previously saved map.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let xml: UidMapXml = quick_xml::de::from_str(&content).map_err(|e| {
            Error::UnsupportedFormat(format!("Uid map {} is not readable: {}", path.display(), e))
        })?;
        Ok(Self {
            series: from_entries(xml.series.maps),
            instances: from_entries(xml.instances.maps),
            dirty: false,
        })
    }

    /// Restore the sidecar if present, otherwise start empty.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path).await? {
            Self::load(path).await
        } else {
            Ok(Self::new())
        }
    }
}

/// Persist the sidecar as part of a reconcile run. Undo restores the
/// previous sidecar content (or removes a freshly created file).
pub struct SaveUidMapCommand {
    path: std::path::PathBuf,
    mapper: UidMapper,
    previous: Option<String>,
    written: bool,
}

impl SaveUidMapCommand {
    pub fn new(path: impl Into<std::path::PathBuf>, mapper: UidMapper) -> Self {
        Self {
            path: path.into(),
            mapper,
            previous: None,
            written: false,
        }
    }
}

#[async_trait::async_trait]
impl crate::command::Command for SaveUidMapCommand {
    fn describe(&self) -> String {
        format!("Save uid map {}", self.path.display())
    }

    async fn execute(&mut self, _ctx: &mut crate::command::ProcessorContext) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await? {
            self.previous = Some(tokio::fs::read_to_string(&self.path).await?);
        }
        self.mapper.save(&self.path).await?;
        self.written = true;
        Ok(())
    }

    async fn undo(&mut self, _ctx: &mut crate::command::ProcessorContext) -> Result<()> {
        if !self.written {
            return Ok(());
        }
        match &self.previous {
            Some(content) => tokio::fs::write(&self.path, content).await?,
            None => tokio::fs::remove_file(&self.path).await?,
        }
        Ok(())
    }
}

fn to_entries(map: &BTreeMap<String, String>) -> Vec<MapEntry> {
    map.iter()
        .map(|(source, target)| MapEntry {
            source: source.clone(),
            target: target.clone(),
        })
        .collect()
}

fn from_entries(entries: Vec<MapEntry>) -> BTreeMap<String, String> {
    entries
        .into_iter()
        .map(|entry| (entry.source, entry.target))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_idempotent_within_a_pass() {
        let mut mapper = UidMapper::new();
        let first = mapper.series_uid("1.2.3");
        let second = mapper.series_uid("1.2.3");
        assert_eq!(first, second);
        assert!(mapper.dirty());
    }

    #[test]
    fn explicit_mapping_records_only_differing_targets() {
        let mut mapper = UidMapper::new();

        assert_eq!(mapper.record_series("1.2.3", "1.2.3"), "1.2.3");
        assert!(!mapper.dirty());
        assert!(mapper.lookup_series("1.2.3").is_none());

        assert_eq!(mapper.record_series("1.2.3", "9.9.9"), "9.9.9");
        assert!(mapper.dirty());

        // An existing association always wins.
        assert_eq!(mapper.record_series("1.2.3", "5.5.5"), "9.9.9");
        assert_eq!(mapper.series_uid("1.2.3"), "9.9.9");
    }

    #[tokio::test]
    async fn save_then_load_reproduces_associations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(UID_MAP_FILE);

        let mut mapper = UidMapper::new();
        let series = mapper.series_uid("1.2.3");
        let sop = mapper.instance_uid("1.2.3.1.1");
        mapper.save(&path).await.unwrap();
        assert!(!mapper.dirty());

        let mut restored = UidMapper::load(&path).await.unwrap();
        assert!(!restored.dirty());
        assert_eq!(restored.series_uid("1.2.3"), series);
        assert_eq!(restored.instance_uid("1.2.3.1.1"), sop);
        assert!(!restored.dirty());
    }

    #[tokio::test]
    async fn load_or_default_starts_empty_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = UidMapper::load_or_default(&dir.path().join(UID_MAP_FILE))
            .await
            .unwrap();
        assert!(mapper.series_map().is_empty());
        assert!(!mapper.dirty());
    }
}
