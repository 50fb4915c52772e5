//! Typed broker queries
//!
//! Every function takes `&mut SqliteConnection` so the same call runs
//! against a plain pool connection or inside a caller-owned transaction.
//! The reconcile command processor relies on this to keep all database
//! mutations of one run in a single transaction scope.

use crate::db::models::{
    ReconcileQueueEntry, ServerPartition, Study, StudyHistory, WorkQueueUid,
};
use crate::Result;
use sqlx::SqliteConnection;

// --- server_partitions ---

pub async fn insert_partition(
    conn: &mut SqliteConnection,
    partition: &ServerPartition,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO server_partitions (guid, ae_title, partition_folder, enabled)
         VALUES (?, ?, ?, ?)",
    )
    .bind(&partition.guid)
    .bind(&partition.ae_title)
    .bind(&partition.partition_folder)
    .bind(partition.enabled)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn find_partition(
    conn: &mut SqliteConnection,
    guid: &str,
) -> Result<Option<ServerPartition>> {
    let row = sqlx::query_as::<_, ServerPartition>(
        "SELECT guid, ae_title, partition_folder, enabled FROM server_partitions WHERE guid = ?",
    )
    .bind(guid)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

// --- studies ---

const STUDY_COLUMNS: &str = "guid, partition_guid, study_instance_uid, patient_name, patient_id, \
     accession_number, number_of_series, number_of_instances, status, storage_path";

pub async fn insert_study(conn: &mut SqliteConnection, study: &Study) -> Result<()> {
    sqlx::query(
        "INSERT INTO studies (guid, partition_guid, study_instance_uid, patient_name,
             patient_id, accession_number, number_of_series, number_of_instances,
             status, storage_path)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&study.guid)
    .bind(&study.partition_guid)
    .bind(&study.study_instance_uid)
    .bind(&study.patient_name)
    .bind(&study.patient_id)
    .bind(&study.accession_number)
    .bind(study.number_of_series)
    .bind(study.number_of_instances)
    .bind(&study.status)
    .bind(&study.storage_path)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_study(conn: &mut SqliteConnection, guid: &str) -> Result<()> {
    sqlx::query("DELETE FROM studies WHERE guid = ?")
        .bind(guid)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn find_study(
    conn: &mut SqliteConnection,
    partition_guid: &str,
    study_instance_uid: &str,
) -> Result<Option<Study>> {
    let query = format!(
        "SELECT {STUDY_COLUMNS} FROM studies WHERE partition_guid = ? AND study_instance_uid = ?"
    );
    let row = sqlx::query_as::<_, Study>(&query)
        .bind(partition_guid)
        .bind(study_instance_uid)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn find_study_by_guid(
    conn: &mut SqliteConnection,
    guid: &str,
) -> Result<Option<Study>> {
    let query = format!("SELECT {STUDY_COLUMNS} FROM studies WHERE guid = ?");
    let row = sqlx::query_as::<_, Study>(&query)
        .bind(guid)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// Adjust series/instance counts by the given deltas.
pub async fn update_study_counts(
    conn: &mut SqliteConnection,
    guid: &str,
    series_delta: i64,
    instance_delta: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE studies
         SET number_of_series = number_of_series + ?,
             number_of_instances = number_of_instances + ?
         WHERE guid = ?",
    )
    .bind(series_delta)
    .bind(instance_delta)
    .bind(guid)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_study_status(
    conn: &mut SqliteConnection,
    guid: &str,
    status: &str,
) -> Result<()> {
    sqlx::query("UPDATE studies SET status = ? WHERE guid = ?")
        .bind(status)
        .bind(guid)
        .execute(conn)
        .await?;
    Ok(())
}

// --- reconcile_queue ---

const QUEUE_COLUMNS: &str = "guid, partition_guid, group_id, study_instance_uid, \
     series_instance_uid, sop_instance_uid, staging_path, queue_data, description, \
     failure_reason, insert_time";

/// Insert-or-find on the natural key (partition, group id, study uid).
///
/// Returns the authoritative row together with a flag telling the caller
/// whether it was newly created. When the row already existed the caller is
/// expected to read-modify-write its detail payload rather than replace it.
pub async fn find_or_insert_queue_entry(
    conn: &mut SqliteConnection,
    entry: &ReconcileQueueEntry,
) -> Result<(ReconcileQueueEntry, bool)> {
    let query = format!(
        "SELECT {QUEUE_COLUMNS} FROM reconcile_queue
         WHERE partition_guid = ? AND group_id = ? AND study_instance_uid = ?"
    );
    let existing = sqlx::query_as::<_, ReconcileQueueEntry>(&query)
        .bind(&entry.partition_guid)
        .bind(&entry.group_id)
        .bind(&entry.study_instance_uid)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(row) = existing {
        return Ok((row, false));
    }

    sqlx::query(
        "INSERT INTO reconcile_queue (guid, partition_guid, group_id, study_instance_uid,
             series_instance_uid, sop_instance_uid, staging_path, queue_data,
             description, failure_reason, insert_time)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.guid)
    .bind(&entry.partition_guid)
    .bind(&entry.group_id)
    .bind(&entry.study_instance_uid)
    .bind(&entry.series_instance_uid)
    .bind(&entry.sop_instance_uid)
    .bind(&entry.staging_path)
    .bind(&entry.queue_data)
    .bind(&entry.description)
    .bind(&entry.failure_reason)
    .bind(entry.insert_time)
    .execute(conn)
    .await?;

    Ok((entry.clone(), true))
}

/// Find a queue row by its natural key.
pub async fn find_queue_entry_by_key(
    conn: &mut SqliteConnection,
    partition_guid: &str,
    group_id: &str,
    study_instance_uid: &str,
) -> Result<Option<ReconcileQueueEntry>> {
    let query = format!(
        "SELECT {QUEUE_COLUMNS} FROM reconcile_queue
         WHERE partition_guid = ? AND group_id = ? AND study_instance_uid = ?"
    );
    let row = sqlx::query_as::<_, ReconcileQueueEntry>(&query)
        .bind(partition_guid)
        .bind(group_id)
        .bind(study_instance_uid)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

pub async fn find_queue_entry(
    conn: &mut SqliteConnection,
    guid: &str,
) -> Result<Option<ReconcileQueueEntry>> {
    let query = format!("SELECT {QUEUE_COLUMNS} FROM reconcile_queue WHERE guid = ?");
    let row = sqlx::query_as::<_, ReconcileQueueEntry>(&query)
        .bind(guid)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// Replace the serialized detail payload of an existing row.
pub async fn update_queue_data(
    conn: &mut SqliteConnection,
    guid: &str,
    queue_data: &str,
) -> Result<()> {
    sqlx::query("UPDATE reconcile_queue SET queue_data = ? WHERE guid = ?")
        .bind(queue_data)
        .bind(guid)
        .execute(conn)
        .await?;
    Ok(())
}

/// Record (or clear) the failure reason surfaced on a queue entry.
pub async fn update_queue_failure_reason(
    conn: &mut SqliteConnection,
    guid: &str,
    failure_reason: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE reconcile_queue SET failure_reason = ? WHERE guid = ?")
        .bind(failure_reason)
        .bind(guid)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn delete_queue_entry(conn: &mut SqliteConnection, guid: &str) -> Result<()> {
    sqlx::query("DELETE FROM reconcile_queue WHERE guid = ?")
        .bind(guid)
        .execute(conn)
        .await?;
    Ok(())
}

// --- work_queue_uids ---

pub async fn insert_work_queue_uid(
    conn: &mut SqliteConnection,
    uid: &WorkQueueUid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO work_queue_uids (guid, group_id, relative_path,
             series_instance_uid, sop_instance_uid)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&uid.guid)
    .bind(&uid.group_id)
    .bind(&uid.relative_path)
    .bind(&uid.series_instance_uid)
    .bind(&uid.sop_instance_uid)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn find_work_queue_uid(
    conn: &mut SqliteConnection,
    guid: &str,
) -> Result<Option<WorkQueueUid>> {
    let row = sqlx::query_as::<_, WorkQueueUid>(
        "SELECT guid, group_id, relative_path, series_instance_uid, sop_instance_uid
         FROM work_queue_uids WHERE guid = ?",
    )
    .bind(guid)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Object references still held by the work queue for one group.
pub async fn find_work_queue_uids(
    conn: &mut SqliteConnection,
    group_id: &str,
) -> Result<Vec<WorkQueueUid>> {
    let rows = sqlx::query_as::<_, WorkQueueUid>(
        "SELECT guid, group_id, relative_path, series_instance_uid, sop_instance_uid
         FROM work_queue_uids WHERE group_id = ?",
    )
    .bind(group_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn delete_work_queue_uid(conn: &mut SqliteConnection, guid: &str) -> Result<()> {
    sqlx::query("DELETE FROM work_queue_uids WHERE guid = ?")
        .bind(guid)
        .execute(conn)
        .await?;
    Ok(())
}

// --- study_history ---

const HISTORY_COLUMNS: &str = "guid, study_guid, dest_study_guid, history_type, study_data, \
     change_description, insert_time";

pub async fn insert_history(conn: &mut SqliteConnection, history: &StudyHistory) -> Result<()> {
    sqlx::query(
        "INSERT INTO study_history (guid, study_guid, dest_study_guid, history_type,
             study_data, change_description, insert_time)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&history.guid)
    .bind(&history.study_guid)
    .bind(&history.dest_study_guid)
    .bind(&history.history_type)
    .bind(&history.study_data)
    .bind(&history.change_description)
    .bind(history.insert_time)
    .execute(conn)
    .await?;
    Ok(())
}

/// Update a record's change description in place (mapping detail is
/// appended this way). History rows are never deleted.
pub async fn update_history_description(
    conn: &mut SqliteConnection,
    guid: &str,
    change_description: &str,
) -> Result<()> {
    sqlx::query("UPDATE study_history SET change_description = ? WHERE guid = ?")
        .bind(change_description)
        .bind(guid)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn find_history_by_guid(
    conn: &mut SqliteConnection,
    guid: &str,
) -> Result<Option<StudyHistory>> {
    let query = format!("SELECT {HISTORY_COLUMNS} FROM study_history WHERE guid = ?");
    let row = sqlx::query_as::<_, StudyHistory>(&query)
        .bind(guid)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// Latest reconcile history for a source study, if any.
pub async fn find_latest_history(
    conn: &mut SqliteConnection,
    study_guid: &str,
) -> Result<Option<StudyHistory>> {
    let query = format!(
        "SELECT {HISTORY_COLUMNS} FROM study_history
         WHERE study_guid = ? ORDER BY insert_time DESC, guid DESC LIMIT 1"
    );
    let row = sqlx::query_as::<_, StudyHistory>(&query)
        .bind(study_guid)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::create_schema;
    use chrono::Utc;
    use sqlx::SqlitePool;
    use uuid::Uuid;

    async fn setup() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    fn partition() -> ServerPartition {
        ServerPartition {
            guid: Uuid::new_v4().to_string(),
            ae_title: "MIRA_TEST".to_string(),
            partition_folder: "MIRA_TEST".to_string(),
            enabled: true,
        }
    }

    fn queue_entry(partition_guid: &str, group_id: &str, study_uid: &str) -> ReconcileQueueEntry {
        ReconcileQueueEntry {
            guid: Uuid::new_v4().to_string(),
            partition_guid: partition_guid.to_string(),
            group_id: group_id.to_string(),
            study_instance_uid: study_uid.to_string(),
            series_instance_uid: "1.2.3.1".to_string(),
            sop_instance_uid: "1.2.3.1.1".to_string(),
            staging_path: "/tmp/reconcile".to_string(),
            queue_data: "{}".to_string(),
            description: "<Reconcile/>".to_string(),
            failure_reason: None,
            insert_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn queue_insert_then_find_reports_existing() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let p = partition();
        insert_partition(&mut conn, &p).await.unwrap();

        let first = queue_entry(&p.guid, "g1", "1.2.3");
        let (row, created) = find_or_insert_queue_entry(&mut conn, &first).await.unwrap();
        assert!(created);
        assert_eq!(row.guid, first.guid);

        // Same natural key, different candidate row: the original row wins.
        let second = queue_entry(&p.guid, "g1", "1.2.3");
        let (row, created) = find_or_insert_queue_entry(&mut conn, &second).await.unwrap();
        assert!(!created);
        assert_eq!(row.guid, first.guid);

        // Different group id is a different conflict.
        let third = queue_entry(&p.guid, "g2", "1.2.3");
        let (_, created) = find_or_insert_queue_entry(&mut conn, &third).await.unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn study_counts_are_adjusted_by_delta() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let p = partition();
        insert_partition(&mut conn, &p).await.unwrap();

        let study = Study {
            guid: Uuid::new_v4().to_string(),
            partition_guid: p.guid.clone(),
            study_instance_uid: "1.2.3".to_string(),
            patient_name: Some("DOE^JOHN".to_string()),
            patient_id: None,
            accession_number: None,
            number_of_series: 2,
            number_of_instances: 10,
            status: "Online".to_string(),
            storage_path: "/tmp/study".to_string(),
        };
        insert_study(&mut conn, &study).await.unwrap();

        update_study_counts(&mut conn, &study.guid, 1, 3).await.unwrap();
        let loaded = find_study_by_guid(&mut conn, &study.guid).await.unwrap().unwrap();
        assert_eq!(loaded.number_of_series, 3);
        assert_eq!(loaded.number_of_instances, 13);
    }

    #[tokio::test]
    async fn study_status_update_flips_the_domain_predicate() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let p = partition();
        insert_partition(&mut conn, &p).await.unwrap();

        let study = Study {
            guid: Uuid::new_v4().to_string(),
            partition_guid: p.guid.clone(),
            study_instance_uid: "1.2.3".to_string(),
            patient_name: None,
            patient_id: None,
            accession_number: None,
            number_of_series: 0,
            number_of_instances: 0,
            status: "Online".to_string(),
            storage_path: "/tmp/study".to_string(),
        };
        insert_study(&mut conn, &study).await.unwrap();

        update_study_status(&mut conn, &study.guid, "Nearline").await.unwrap();
        let loaded = find_study_by_guid(&mut conn, &study.guid).await.unwrap().unwrap();
        assert!(loaded.can_update().is_err());
    }

    #[tokio::test]
    async fn work_queue_uids_are_scoped_to_their_group() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        for (group, sop) in [("g1", "1.2.3.1.1"), ("g1", "1.2.3.1.2"), ("g2", "1.2.3.1.3")] {
            let uid = WorkQueueUid {
                guid: Uuid::new_v4().to_string(),
                group_id: group.to_string(),
                relative_path: format!("{sop}.dcmj"),
                series_instance_uid: "1.2.3.1".to_string(),
                sop_instance_uid: sop.to_string(),
            };
            insert_work_queue_uid(&mut conn, &uid).await.unwrap();
        }

        let g1 = find_work_queue_uids(&mut conn, "g1").await.unwrap();
        assert_eq!(g1.len(), 2);

        delete_work_queue_uid(&mut conn, &g1[0].guid).await.unwrap();
        assert_eq!(find_work_queue_uids(&mut conn, "g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_history_is_returned() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let older = StudyHistory {
            guid: "h1".to_string(),
            study_guid: "s1".to_string(),
            dest_study_guid: None,
            history_type: "StudyReconciled".to_string(),
            study_data: "{}".to_string(),
            change_description: "<Reconcile/>".to_string(),
            insert_time: Utc::now() - chrono::Duration::minutes(5),
        };
        let newer = StudyHistory {
            guid: "h2".to_string(),
            insert_time: Utc::now(),
            ..older.clone()
        };
        insert_history(&mut conn, &older).await.unwrap();
        insert_history(&mut conn, &newer).await.unwrap();

        let latest = find_latest_history(&mut conn, "s1").await.unwrap().unwrap();
        assert_eq!(latest.guid, "h2");
    }
}
