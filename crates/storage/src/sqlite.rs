use std::path::Path;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use jobtrack_core::{
    CoreError,
    ids::*,
    item::Item,
    position::{PositionChange, PositionGroup, Sibling},
};

use crate::error::StorageError;
use crate::traits::{ItemStore, JobCounts, JobQueue, JobStatus, RebalanceJobRecord};

const ITEM_COLUMNS: &str = "item_id, owner_id, parent_id, title, position, (deleted_at IS NOT NULL)";
const JOB_COLUMNS: &str = "job_id, payload, status, attempts, max_attempts, last_error";

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Raw connection, for maintenance and tests.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Tunnel a decode failure through rusqlite's row-mapping error type.
fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Blob, Box::new(err))
}

fn column_id<T>(
    row: &rusqlite::Row,
    column: usize,
    parse: fn(&[u8]) -> Result<T, CoreError>,
) -> rusqlite::Result<T> {
    let bytes: Vec<u8> = row.get(column)?;
    parse(&bytes).map_err(|e| conversion_error(column, e))
}

fn column_opt_id<T>(
    row: &rusqlite::Row,
    column: usize,
    parse: fn(&[u8]) -> Result<T, CoreError>,
) -> rusqlite::Result<Option<T>> {
    let bytes: Option<Vec<u8>> = row.get(column)?;
    bytes
        .map(|b| parse(&b))
        .transpose()
        .map_err(|e| conversion_error(column, e))
}

fn read_item(row: &rusqlite::Row) -> rusqlite::Result<Item> {
    Ok(Item {
        item_id: column_id(row, 0, ItemId::from_slice)?,
        owner_id: column_id(row, 1, OwnerId::from_slice)?,
        parent_id: column_opt_id(row, 2, ItemId::from_slice)?,
        title: row.get(3)?,
        position: row.get(4)?,
        position_finalized: true,
        insert_after_id: None,
        insert_at_top: false,
        deleted: row.get(5)?,
    })
}

fn read_sibling(row: &rusqlite::Row) -> rusqlite::Result<Sibling> {
    Ok(Sibling {
        item_id: column_id(row, 0, ItemId::from_slice)?,
        position: row.get(1)?,
    })
}

fn read_job(row: &rusqlite::Row) -> rusqlite::Result<RebalanceJobRecord> {
    let payload: Vec<u8> = row.get(1)?;
    let group = PositionGroup::from_msgpack(&payload).map_err(|e| conversion_error(1, e))?;
    let status: String = row.get(2)?;
    let status = JobStatus::parse(&status).map_err(|e| conversion_error(2, e))?;
    Ok(RebalanceJobRecord {
        job_id: column_id(row, 0, RebalanceJobId::from_slice)?,
        group,
        status,
        attempts: row.get(3)?,
        max_attempts: row.get(4)?,
        last_error: row.get(5)?,
    })
}

fn parent_param(group: &PositionGroup) -> Option<&[u8]> {
    group.parent_id.as_ref().map(|p| p.as_bytes().as_slice())
}

fn select_members(conn: &Connection, group: &PositionGroup) -> Result<Vec<Sibling>, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT item_id, position FROM items
         WHERE owner_id = ?1 AND parent_id IS ?2 AND deleted_at IS NULL
         ORDER BY position, item_id",
    )?;
    let members = stmt
        .query_map(
            rusqlite::params![group.owner_id.as_bytes().as_slice(), parent_param(group)],
            read_sibling,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

impl ItemStore for SqliteStorage {
    fn insert_item(&mut self, item: &Item) -> Result<(), StorageError> {
        let result = self.conn.execute(
            "INSERT INTO items (item_id, owner_id, parent_id, title, position) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                item.item_id.as_bytes().as_slice(),
                item.owner_id.as_bytes().as_slice(),
                item.parent_id.as_ref().map(|p| p.as_bytes().as_slice()),
                item.title,
                item.position,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::ItemCollision {
                    item_id: item.item_id.to_string(),
                })
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn update_item(&mut self, item: &Item) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE items SET parent_id = ?2, title = ?3, position = ?4,
                 updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
             WHERE item_id = ?1 AND deleted_at IS NULL",
            rusqlite::params![
                item.item_id.as_bytes().as_slice(),
                item.parent_id.as_ref().map(|p| p.as_bytes().as_slice()),
                item.title,
                item.position,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("item {}", item.item_id)));
        }
        Ok(())
    }

    fn delete_item(&mut self, item_id: ItemId) -> Result<bool, StorageError> {
        let updated = self.conn.execute(
            "UPDATE items SET deleted_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
             WHERE item_id = ?1 AND deleted_at IS NULL",
            rusqlite::params![item_id.as_bytes().as_slice()],
        )?;
        Ok(updated > 0)
    }

    fn get_item(&self, item_id: ItemId) -> Result<Option<Item>, StorageError> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE item_id = ?1"),
                rusqlite::params![item_id.as_bytes().as_slice()],
                read_item,
            )
            .optional()?;
        Ok(item)
    }

    fn get_group_members(&self, group: &PositionGroup) -> Result<Vec<Sibling>, StorageError> {
        select_members(&self.conn, group)
    }

    fn get_group_items(&self, group: &PositionGroup) -> Result<Vec<Item>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE owner_id = ?1 AND parent_id IS ?2 AND deleted_at IS NULL
             ORDER BY position, item_id"
        ))?;
        let items = stmt
            .query_map(
                rusqlite::params![group.owner_id.as_bytes().as_slice(), parent_param(group)],
                read_item,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn count_group_members(&self, group: &PositionGroup) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM items WHERE owner_id = ?1 AND parent_id IS ?2 AND deleted_at IS NULL",
            rusqlite::params![group.owner_id.as_bytes().as_slice(), parent_param(group)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn apply_positions(
        &mut self,
        group: &PositionGroup,
        snapshot: &[Sibling],
        changes: &[PositionChange],
    ) -> Result<(), StorageError> {
        if changes.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        // The write lock is held from here on, so the group cannot change
        // between this check and the commit.
        let members = select_members(&tx, group)?;
        if members != snapshot {
            return Err(StorageError::Conflict(format!(
                "group {group} changed since it was read ({} members now, {} planned)",
                members.len(),
                snapshot.len()
            )));
        }
        {
            let mut stmt = tx.prepare(
                "UPDATE items SET position = ?2,
                     updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
                 WHERE item_id = ?1 AND position = ?3 AND deleted_at IS NULL",
            )?;
            for change in changes {
                let updated = stmt.execute(rusqlite::params![
                    change.item_id.as_bytes().as_slice(),
                    change.to,
                    change.from,
                ])?;
                if updated == 0 {
                    // Dropping `tx` rolls back everything written so far.
                    return Err(StorageError::Conflict(format!(
                        "item {} is no longer at position {}",
                        change.item_id, change.from
                    )));
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl JobQueue for SqliteStorage {
    fn enqueue_rebalance(
        &mut self,
        group: &PositionGroup,
        max_attempts: u32,
    ) -> Result<RebalanceJobId, StorageError> {
        let job_id = RebalanceJobId::new();
        let payload = group.to_msgpack()?;
        self.conn.execute(
            "INSERT INTO rebalance_jobs (job_id, owner_id, parent_id, payload, max_attempts) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                job_id.as_bytes().as_slice(),
                group.owner_id.as_bytes().as_slice(),
                parent_param(group),
                payload,
                max_attempts.max(1),
            ],
        )?;
        Ok(job_id)
    }

    fn claim_next_job(&mut self) -> Result<Option<RebalanceJobRecord>, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = tx
            .query_row(
                &format!(
                    "UPDATE rebalance_jobs SET status = 'running', attempts = attempts + 1,
                         updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
                     WHERE seq = (
                         SELECT seq FROM rebalance_jobs
                         WHERE status = 'queued'
                           AND run_after <= CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
                         ORDER BY seq LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                [],
                read_job,
            )
            .optional()?;
        tx.commit()?;
        Ok(job)
    }

    fn complete_job(&mut self, job_id: RebalanceJobId) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE rebalance_jobs SET status = 'done', last_error = NULL,
                 updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
             WHERE job_id = ?1 AND status = 'running'",
            rusqlite::params![job_id.as_bytes().as_slice()],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("running job {job_id}")));
        }
        Ok(())
    }

    fn fail_job(
        &mut self,
        job_id: RebalanceJobId,
        error: &str,
        retry_delay_ms: u64,
    ) -> Result<JobStatus, StorageError> {
        let delay = i64::try_from(retry_delay_ms).unwrap_or(i64::MAX);
        let status: Option<String> = self
            .conn
            .query_row(
                "UPDATE rebalance_jobs SET
                     status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'queued' END,
                     last_error = ?2,
                     run_after = CAST(unixepoch('now','subsec') * 1000 AS INTEGER) + ?3 * attempts,
                     updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
                 WHERE job_id = ?1 AND status = 'running'
                 RETURNING status",
                rusqlite::params![job_id.as_bytes().as_slice(), error, delay],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(status) => JobStatus::parse(&status),
            None => Err(StorageError::NotFound(format!("running job {job_id}"))),
        }
    }

    fn recover_jobs(&mut self) -> Result<usize, StorageError> {
        let recovered = self.conn.execute(
            "UPDATE rebalance_jobs SET status = 'queued',
                 updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
             WHERE status = 'running'",
            [],
        )?;
        Ok(recovered)
    }

    fn requeue_expired(&mut self, lease_ms: u64) -> Result<usize, StorageError> {
        let lease = i64::try_from(lease_ms).unwrap_or(i64::MAX);
        let requeued = self.conn.execute(
            "UPDATE rebalance_jobs SET status = 'queued',
                 updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)
             WHERE status = 'running'
               AND updated_at <= CAST(unixepoch('now','subsec') * 1000 AS INTEGER) - ?1",
            rusqlite::params![lease],
        )?;
        Ok(requeued)
    }

    fn get_job(&self, job_id: RebalanceJobId) -> Result<Option<RebalanceJobRecord>, StorageError> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM rebalance_jobs WHERE job_id = ?1"),
                rusqlite::params![job_id.as_bytes().as_slice()],
                read_job,
            )
            .optional()?;
        Ok(job)
    }

    fn jobs_for_group(&self, group: &PositionGroup) -> Result<Vec<RebalanceJobRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM rebalance_jobs
             WHERE owner_id = ?1 AND parent_id IS ?2
             ORDER BY seq"
        ))?;
        let jobs = stmt
            .query_map(
                rusqlite::params![group.owner_id.as_bytes().as_slice(), parent_param(group)],
                read_job,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn job_counts(&self) -> Result<JobCounts, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM rebalance_jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as u64;
            match JobStatus::parse(&status)? {
                JobStatus::Queued => counts.queued = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Done => counts.done = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobtrack_core::position::even_spacing;

    fn seeded(storage: &mut SqliteStorage, group: PositionGroup, positions: &[i64]) -> Vec<Item> {
        positions
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let mut item = Item::new(group.owner_id, format!("task {i}")).with_position(p);
                item.parent_id = group.parent_id;
                storage.insert_item(&item).unwrap();
                item
            })
            .collect()
    }

    #[test]
    fn group_members_are_scoped_and_ordered() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let owner = OwnerId::new();
        let root = PositionGroup::root(owner);
        let roots = seeded(&mut storage, root, &[30, 10, 20]);
        let children = PositionGroup::children(owner, roots[0].item_id);
        seeded(&mut storage, children, &[5]);

        let members = storage.get_group_members(&root).unwrap();
        let positions: Vec<i64> = members.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![10, 20, 30]);
        assert_eq!(storage.count_group_members(&children).unwrap(), 1);
        assert_eq!(storage.count_group_members(&PositionGroup::root(OwnerId::new())).unwrap(), 0);
    }

    #[test]
    fn ties_break_by_item_id() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::root(OwnerId::new());
        let items = seeded(&mut storage, group, &[10, 10, 10]);
        let ids: Vec<ItemId> = storage
            .get_group_members(&group)
            .unwrap()
            .iter()
            .map(|m| m.item_id)
            .collect();
        let expected: Vec<ItemId> = items.iter().map(|i| i.item_id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn deleted_items_leave_the_group() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::root(OwnerId::new());
        let items = seeded(&mut storage, group, &[10, 20]);

        assert!(storage.delete_item(items[0].item_id).unwrap());
        assert!(!storage.delete_item(items[0].item_id).unwrap());
        assert_eq!(storage.count_group_members(&group).unwrap(), 1);

        let loaded = storage.get_item(items[0].item_id).unwrap().unwrap();
        assert!(loaded.deleted);
        assert!(loaded.position_finalized);
        assert!(matches!(
            storage.update_item(&loaded),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_insert_is_a_collision() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::root(OwnerId::new());
        let items = seeded(&mut storage, group, &[10]);
        assert!(matches!(
            storage.insert_item(&items[0]),
            Err(StorageError::ItemCollision { .. })
        ));
    }

    #[test]
    fn stale_position_change_rolls_back_all() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::root(OwnerId::new());
        let items = seeded(&mut storage, group, &[1, 2, 3]);

        let changes = vec![
            PositionChange { item_id: items[0].item_id, from: 1, to: 10_000 },
            PositionChange { item_id: items[1].item_id, from: 2, to: 20_000 },
            PositionChange { item_id: items[2].item_id, from: 99, to: 30_000 },
        ];
        let snapshot = storage.get_group_members(&group).unwrap();
        let err = storage.apply_positions(&group, &snapshot, &changes).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert!(err.is_transient());

        let positions: Vec<i64> = storage
            .get_group_members(&group)
            .unwrap()
            .iter()
            .map(|m| m.position)
            .collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[test]
    fn member_added_after_planning_is_a_conflict() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::root(OwnerId::new());
        seeded(&mut storage, group, &[1, 2, 3]);

        let snapshot = storage.get_group_members(&group).unwrap();
        let changes = even_spacing(&snapshot, 10_000);
        seeded(&mut storage, group, &[2]);

        let err = storage.apply_positions(&group, &snapshot, &changes).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        let positions: Vec<i64> = storage
            .get_group_members(&group)
            .unwrap()
            .iter()
            .map(|m| m.position)
            .collect();
        assert_eq!(positions, vec![1, 2, 2, 3]);
    }

    #[test]
    fn job_lifecycle() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::children(OwnerId::new(), ItemId::new());

        let job_id = storage.enqueue_rebalance(&group, 2).unwrap();
        let job = storage.claim_next_job().unwrap().unwrap();
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.group, group);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert!(storage.claim_next_job().unwrap().is_none());

        assert_eq!(storage.fail_job(job_id, "busy", 0).unwrap(), JobStatus::Queued);
        let job = storage.claim_next_job().unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("busy"));

        assert_eq!(storage.fail_job(job_id, "busy again", 0).unwrap(), JobStatus::Failed);
        assert!(storage.claim_next_job().unwrap().is_none());

        let counts = storage.job_counts().unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.queued, 0);
    }

    #[test]
    fn retry_delay_postpones_claim() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::root(OwnerId::new());
        let job_id = storage.enqueue_rebalance(&group, 5).unwrap();
        storage.claim_next_job().unwrap().unwrap();
        storage.fail_job(job_id, "locked", 60_000).unwrap();
        assert!(storage.claim_next_job().unwrap().is_none());
        assert_eq!(storage.job_counts().unwrap().queued, 1);
    }

    #[test]
    fn recover_requeues_running_jobs() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::root(OwnerId::new());
        let job_id = storage.enqueue_rebalance(&group, 3).unwrap();
        storage.claim_next_job().unwrap().unwrap();

        assert_eq!(storage.recover_jobs().unwrap(), 1);
        let job = storage.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        storage.claim_next_job().unwrap().unwrap();
        storage.complete_job(job_id).unwrap();
        assert_eq!(storage.jobs_for_group(&group).unwrap()[0].status, JobStatus::Done);
        assert!(storage.complete_job(job_id).is_err());
    }

    #[test]
    fn expired_claims_are_requeued() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let group = PositionGroup::root(OwnerId::new());
        let job_id = storage.enqueue_rebalance(&group, 3).unwrap();
        storage.claim_next_job().unwrap().unwrap();

        // A fresh claim is still within a long lease.
        assert_eq!(storage.requeue_expired(60_000).unwrap(), 0);
        assert_eq!(storage.get_job(job_id).unwrap().unwrap().status, JobStatus::Running);

        assert_eq!(storage.requeue_expired(0).unwrap(), 1);
        assert_eq!(storage.get_job(job_id).unwrap().unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn file_database_is_shared_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.db");
        let mut writer = SqliteStorage::open(&path).unwrap();
        let reader = SqliteStorage::open(&path).unwrap();

        let group = PositionGroup::root(OwnerId::new());
        seeded(&mut writer, group, &[10_000]);
        writer.enqueue_rebalance(&group, 1).unwrap();

        assert_eq!(reader.count_group_members(&group).unwrap(), 1);
        assert_eq!(reader.job_counts().unwrap().queued, 1);
    }
}
