//! Staging-path resolution for conflicting images
//!
//! Current layout:
//! `<filesystem-root>/<partition>/Reconcile/<group-id>/<study-uid>/<sop-uid>.dcmj`
//!
//! A legacy layout without the group-id segment predates grouped staging.
//! Old queue entries recorded under it must remain readable, but new paths
//! always include the group id; the asymmetry is intentional.

use std::path::{Path, PathBuf};

/// Folder under a partition that holds staged conflicts.
pub const RECONCILE_FOLDER: &str = "Reconcile";

/// Folder under a partition that holds archived studies.
pub const STUDIES_FOLDER: &str = "Studies";

/// Extension of staged instance documents.
pub const INSTANCE_EXTENSION: &str = "dcmj";

/// Which staging layout a recorded path uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingLayout {
    /// `<root>/<partition>/Reconcile/<group-id>/<study-uid>`
    Current,
    /// `<root>/<partition>/Reconcile/<study-uid>` (read-only)
    Legacy,
}

/// Staging-path resolution for one conflicting study.
#[derive(Debug, Clone)]
pub struct ReconcileStorage {
    filesystem_root: PathBuf,
    partition_folder: String,
    group_id: String,
    study_instance_uid: String,
}

impl ReconcileStorage {
    pub fn new(
        filesystem_root: impl Into<PathBuf>,
        partition_folder: impl Into<String>,
        group_id: impl Into<String>,
        study_instance_uid: impl Into<String>,
    ) -> Self {
        Self {
            filesystem_root: filesystem_root.into(),
            partition_folder: partition_folder.into(),
            group_id: group_id.into(),
            study_instance_uid: study_instance_uid.into(),
        }
    }

    /// Staging folder for this conflict. Always the current layout; the
    /// legacy layout is never written.
    pub fn staging_folder(&self) -> PathBuf {
        self.filesystem_root
            .join(&self.partition_folder)
            .join(RECONCILE_FOLDER)
            .join(&self.group_id)
            .join(&self.study_instance_uid)
    }

    /// Where an entry staged before grouped layouts would live. Read-only.
    pub fn legacy_staging_folder(&self) -> PathBuf {
        self.filesystem_root
            .join(&self.partition_folder)
            .join(RECONCILE_FOLDER)
            .join(&self.study_instance_uid)
    }

    /// Path of a staged instance document inside the staging folder.
    pub fn instance_file(&self, sop_instance_uid: &str) -> PathBuf {
        self.staging_folder()
            .join(format!("{}.{}", sop_instance_uid, INSTANCE_EXTENSION))
    }
}

/// Storage folder of an archived study.
pub fn study_storage_folder(
    filesystem_root: &Path,
    partition_folder: &str,
    study_instance_uid: &str,
) -> PathBuf {
    filesystem_root
        .join(partition_folder)
        .join(STUDIES_FOLDER)
        .join(study_instance_uid)
}

/// Classify a recorded staging path. The legacy layout has the study folder
/// directly under `Reconcile`; the current layout interposes the group id.
pub fn detect_layout(staging_path: &Path) -> StagingLayout {
    let parent_is_reconcile = staging_path
        .parent()
        .and_then(Path::file_name)
        .map(|name| name == RECONCILE_FOLDER)
        .unwrap_or(false);

    if parent_is_reconcile {
        StagingLayout::Legacy
    } else {
        StagingLayout::Current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_layout_includes_group_id() {
        let storage = ReconcileStorage::new("/archive", "PACS1", "grp-7", "1.2.3");
        assert_eq!(
            storage.staging_folder(),
            PathBuf::from("/archive/PACS1/Reconcile/grp-7/1.2.3")
        );
        assert_eq!(
            storage.instance_file("1.2.3.1.1"),
            PathBuf::from("/archive/PACS1/Reconcile/grp-7/1.2.3/1.2.3.1.1.dcmj")
        );
    }

    #[test]
    fn legacy_layout_omits_group_id() {
        let storage = ReconcileStorage::new("/archive", "PACS1", "grp-7", "1.2.3");
        assert_eq!(
            storage.legacy_staging_folder(),
            PathBuf::from("/archive/PACS1/Reconcile/1.2.3")
        );
    }

    #[test]
    fn layouts_are_detected_from_recorded_paths() {
        assert_eq!(
            detect_layout(Path::new("/archive/PACS1/Reconcile/grp-7/1.2.3")),
            StagingLayout::Current
        );
        assert_eq!(
            detect_layout(Path::new("/archive/PACS1/Reconcile/1.2.3")),
            StagingLayout::Legacy
        );
    }

    #[test]
    fn study_storage_is_partition_scoped() {
        assert_eq!(
            study_storage_folder(Path::new("/archive"), "PACS1", "1.2.3"),
            PathBuf::from("/archive/PACS1/Studies/1.2.3")
        );
    }
}
