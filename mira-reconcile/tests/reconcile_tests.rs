//! End-to-end pipeline tests
//!
//! Each test drives the public surface the way a deployment would: stage a
//! conflict through `ImageReconciler`, then process the queue entry and
//! inspect the filesystem and database outcomes.

use mira_common::config::ReconcileConfig;
use mira_common::db::models::{ServerPartition, Study};
use mira_common::db::{broker, init::init_database};
use mira_common::instance::InstanceDocument;
use mira_common::Error;
use mira_reconcile::context::ReconcileQueueData;
use mira_reconcile::storage::study_storage_folder;
use mira_reconcile::uid_mapper::{UidMapper, UID_MAP_FILE};
use mira_reconcile::{process_queue_entry, AutoReconcileOutcome, AutoReconciler, ImageReconciler};
use sqlx::SqlitePool;
use std::path::Path;
use tempfile::TempDir;
use uuid::Uuid;

const DISCARD: &str = "<Reconcile><Action>Discard</Action></Reconcile>";
const PROCESS_AS_IS: &str = "<Reconcile><Action>ProcessAsIs</Action></Reconcile>";
const CREATE_NEW: &str = "<Reconcile><Action>CreateNewStudy</Action></Reconcile>";

struct Harness {
    _dir: TempDir,
    pool: SqlitePool,
    config: ReconcileConfig,
    partition: ServerPartition,
}

async fn setup() -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("mira.db");
    let pool = init_database(&db_path).await.unwrap();
    let config = ReconcileConfig::new(dir.path(), &db_path);

    let partition = ServerPartition {
        guid: Uuid::new_v4().to_string(),
        ae_title: "MIRA_TEST".to_string(),
        partition_folder: "MIRA_TEST".to_string(),
        enabled: true,
    };
    let mut conn = pool.acquire().await.unwrap();
    broker::insert_partition(&mut conn, &partition).await.unwrap();
    drop(conn);

    Harness {
        _dir: dir,
        pool,
        config,
        partition,
    }
}

async fn archive_study(h: &Harness, study_uid: &str, status: &str) -> Study {
    let storage = study_storage_folder(
        &h.config.filesystem_root,
        &h.partition.partition_folder,
        study_uid,
    );
    tokio::fs::create_dir_all(&storage).await.unwrap();

    let study = Study {
        guid: Uuid::new_v4().to_string(),
        partition_guid: h.partition.guid.clone(),
        study_instance_uid: study_uid.to_string(),
        patient_name: Some("DOE^JOHN".to_string()),
        patient_id: Some("P001".to_string()),
        accession_number: Some("A100".to_string()),
        number_of_series: 1,
        number_of_instances: 1,
        status: status.to_string(),
        storage_path: storage.display().to_string(),
    };
    let mut conn = h.pool.acquire().await.unwrap();
    broker::insert_study(&mut conn, &study).await.unwrap();
    study
}

/// A conflicting instance: same addressing as the archive expects, but
/// different demographics.
fn conflicting_document(study: &str, series: &str, sop: &str) -> InstanceDocument {
    let mut doc = InstanceDocument::new(study, series, sop);
    doc.set_tag("PatientName", "DOE^JON");
    doc
}

#[tokio::test]
async fn discard_removes_staged_files_and_staging_folder() {
    let h = setup().await;
    let reconciler = ImageReconciler::new(h.pool.clone(), h.config.clone());

    let entry = reconciler
        .schedule_reconcile(
            &h.partition,
            "g1",
            &conflicting_document("1.2.3", "1.2.3.1", "1.2.3.1.1"),
            DISCARD,
            None,
        )
        .await
        .unwrap();

    let staging = Path::new(&entry.staging_path).to_path_buf();
    assert!(staging.join("1.2.3.1.1.dcmj").exists());

    process_queue_entry(&h.pool, &h.config, &entry.guid)
        .await
        .unwrap();

    // Files, the emptied staging folder and the group folder are all gone.
    assert!(!staging.exists());
    assert!(!staging.parent().unwrap().exists());

    let mut conn = h.pool.acquire().await.unwrap();
    assert!(broker::find_queue_entry(&mut conn, &entry.guid)
        .await
        .unwrap()
        .is_none());
    assert!(broker::find_study(&mut conn, &h.partition.guid, "1.2.3")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn second_arrival_joins_the_existing_queue_entry() {
    let h = setup().await;
    let reconciler = ImageReconciler::new(h.pool.clone(), h.config.clone());

    let first = reconciler
        .schedule_reconcile(
            &h.partition,
            "g1",
            &conflicting_document("1.2.3", "1.2.3.1", "1.2.3.1.1"),
            DISCARD,
            None,
        )
        .await
        .unwrap();
    let second = reconciler
        .schedule_reconcile(
            &h.partition,
            "g1",
            &conflicting_document("1.2.3", "1.2.3.1", "1.2.3.1.2"),
            DISCARD,
            None,
        )
        .await
        .unwrap();

    assert_eq!(first.guid, second.guid);

    let data = ReconcileQueueData::decode(&second.queue_data).unwrap();
    assert_eq!(data.files.len(), 2);

    let staging = Path::new(&second.staging_path);
    assert!(staging.join("1.2.3.1.1.dcmj").exists());
    assert!(staging.join("1.2.3.1.2.dcmj").exists());
}

#[tokio::test]
async fn process_as_is_accepts_files_into_the_archived_study() {
    let h = setup().await;
    let study = archive_study(&h, "1.2.3", "Online").await;
    let reconciler = ImageReconciler::new(h.pool.clone(), h.config.clone());

    let entry = reconciler
        .schedule_reconcile(
            &h.partition,
            "g1",
            &conflicting_document("1.2.3", "1.2.3.9", "1.2.3.9.1"),
            PROCESS_AS_IS,
            None,
        )
        .await
        .unwrap();

    process_queue_entry(&h.pool, &h.config, &entry.guid)
        .await
        .unwrap();

    // The file landed in the study storage with the archived identity.
    let dest = Path::new(&study.storage_path)
        .join("1.2.3.9")
        .join("1.2.3.9.1.dcmj");
    let landed = InstanceDocument::load(&dest).await.unwrap();
    assert_eq!(landed.study_instance_uid, "1.2.3");
    assert_eq!(landed.tag("PatientName"), Some("DOE^JOHN"));
    assert_eq!(landed.tag("PatientId"), Some("P001"));

    let mut conn = h.pool.acquire().await.unwrap();
    let updated = broker::find_study_by_guid(&mut conn, &study.guid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.number_of_series, 2);
    assert_eq!(updated.number_of_instances, 2);

    assert!(broker::find_latest_history(&mut conn, &study.guid)
        .await
        .unwrap()
        .is_some());
    assert!(broker::find_queue_entry(&mut conn, &entry.guid)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn process_as_is_fails_before_any_move_when_study_is_frozen() {
    let h = setup().await;
    let study = archive_study(&h, "1.2.3", "Nearline").await;
    let reconciler = ImageReconciler::new(h.pool.clone(), h.config.clone());

    let entry = reconciler
        .schedule_reconcile(
            &h.partition,
            "g1",
            &conflicting_document("1.2.3", "1.2.3.1", "1.2.3.1.1"),
            PROCESS_AS_IS,
            None,
        )
        .await
        .unwrap();
    let staged = Path::new(&entry.staging_path).join("1.2.3.1.1.dcmj");

    let err = process_queue_entry(&h.pool, &h.config, &entry.guid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert!(err.is_fatal());

    // Nothing moved: the staged file is intact and the study storage was
    // never touched.
    assert!(staged.exists());
    assert!(!Path::new(&study.storage_path).join("1.2.3.1").exists());

    // The entry survives with the reason surfaced on it.
    let mut conn = h.pool.acquire().await.unwrap();
    let remaining = broker::find_queue_entry(&mut conn, &entry.guid)
        .await
        .unwrap()
        .unwrap();
    assert!(remaining.failure_reason.unwrap().contains("Nearline"));
}

#[tokio::test]
async fn merge_lands_files_in_the_mapped_series() {
    let h = setup().await;
    let study = archive_study(&h, "4.5.6", "Online").await;
    let reconciler = ImageReconciler::new(h.pool.clone(), h.config.clone());

    let descriptor = "<Reconcile><Action>Merge</Action>\
         <SeriesMappings><SeriesMapping>\
         <Source>1.2.3.1</Source><Target>7.7.7.1</Target>\
         </SeriesMapping></SeriesMappings></Reconcile>";
    let entry = reconciler
        .schedule_reconcile(
            &h.partition,
            "g1",
            &conflicting_document("4.5.6", "1.2.3.1", "1.2.3.1.1"),
            descriptor,
            None,
        )
        .await
        .unwrap();

    process_queue_entry(&h.pool, &h.config, &entry.guid)
        .await
        .unwrap();

    let dest = Path::new(&study.storage_path)
        .join("7.7.7.1")
        .join("1.2.3.1.1.dcmj");
    let landed = InstanceDocument::load(&dest).await.unwrap();
    assert_eq!(landed.series_instance_uid, "7.7.7.1");
    assert_eq!(landed.tag("PatientName"), Some("DOE^JOHN"));

    // The association is persisted in the sidecar and in the audit record.
    let mapper = UidMapper::load(&Path::new(&study.storage_path).join(UID_MAP_FILE))
        .await
        .unwrap();
    assert_eq!(mapper.lookup_series("1.2.3.1"), Some("7.7.7.1"));

    let mut conn = h.pool.acquire().await.unwrap();
    let history = broker::find_latest_history(&mut conn, &study.guid)
        .await
        .unwrap()
        .unwrap();
    let recorded =
        mira_reconcile::StudyReconcileDescriptorParser::parse(&history.change_description).unwrap();
    assert_eq!(recorded.series_mapping("1.2.3.1").unwrap().target, "7.7.7.1");

    let updated = broker::find_study_by_guid(&mut conn, &study.guid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.number_of_series, 2);
    assert_eq!(updated.number_of_instances, 2);
}

#[tokio::test]
async fn create_new_study_remaps_identifiers_and_routes_late_arrivals() {
    let h = setup().await;
    let source = archive_study(&h, "1.2.3", "Online").await;
    let reconciler = ImageReconciler::new(h.pool.clone(), h.config.clone());

    let entry = reconciler
        .schedule_reconcile(
            &h.partition,
            "g1",
            &conflicting_document("1.2.3", "1.2.3.1", "1.2.3.1.1"),
            CREATE_NEW,
            None,
        )
        .await
        .unwrap();

    process_queue_entry(&h.pool, &h.config, &entry.guid)
        .await
        .unwrap();

    // History links the collision source to the freshly created study.
    let mut conn = h.pool.acquire().await.unwrap();
    let history = broker::find_latest_history(&mut conn, &source.guid)
        .await
        .unwrap()
        .unwrap();
    let dest_guid = history.dest_study_guid.clone().unwrap();
    let dest = broker::find_study_by_guid(&mut conn, &dest_guid)
        .await
        .unwrap()
        .unwrap();
    drop(conn);

    assert_ne!(dest.study_instance_uid, "1.2.3");
    assert!(dest.study_instance_uid.starts_with("2.25."));
    assert_eq!(dest.number_of_series, 1);
    assert_eq!(dest.number_of_instances, 1);

    // The sidecar holds the allocated identifiers, and the file landed
    // under them.
    let mapper = UidMapper::load(&Path::new(&dest.storage_path).join(UID_MAP_FILE))
        .await
        .unwrap();
    let mapped_series = mapper.lookup_series("1.2.3.1").unwrap().to_string();
    let mapped_sop = mapper.lookup_instance("1.2.3.1.1").unwrap().to_string();
    let landed = InstanceDocument::load(
        &Path::new(&dest.storage_path)
            .join(&mapped_series)
            .join(format!("{mapped_sop}.dcmj")),
    )
    .await
    .unwrap();
    assert_eq!(landed.study_instance_uid, dest.study_instance_uid);
    assert_eq!(landed.series_instance_uid, mapped_series);

    // A late arrival for the same source series replays the association
    // instead of allocating a new one.
    let auto = AutoReconciler::new(h.pool.clone(), h.config.clone());
    let mut late = conflicting_document("1.2.3", "1.2.3.1", "1.2.3.1.2");
    let outcome = auto.apply_history(&source, &mut late).await.unwrap().unwrap();
    assert_eq!(
        outcome,
        AutoReconcileOutcome::Retargeted {
            dest_study_guid: dest.guid.clone()
        }
    );
    assert_eq!(late.study_instance_uid, dest.study_instance_uid);
    assert_eq!(late.series_instance_uid, mapped_series);
    assert_ne!(late.sop_instance_uid, "1.2.3.1.2");
}

#[tokio::test]
async fn deprecated_descriptor_schema_never_stages_anything() {
    let h = setup().await;
    let reconciler = ImageReconciler::new(h.pool.clone(), h.config.clone());

    let err = reconciler
        .schedule_reconcile(
            &h.partition,
            "g1",
            &conflicting_document("1.2.3", "1.2.3.1", "1.2.3.1.1"),
            "<MergeStudy><Action>Merge</Action></MergeStudy>",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));

    // No staging folder, no queue row.
    assert!(!h
        .config
        .filesystem_root
        .join(&h.partition.partition_folder)
        .exists());
    let mut conn = h.pool.acquire().await.unwrap();
    assert!(
        broker::find_queue_entry_by_key(&mut conn, &h.partition.guid, "g1", "1.2.3")
            .await
            .unwrap()
            .is_none()
    );
}
