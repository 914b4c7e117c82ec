use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    PrEntry, PrState, WorkItem, WorkItemState, WorkerRecord, WorkflowRecord, WorkflowStatus,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_work_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItem> {
    let labels_json: String = row.get(5)?;
    let state_str: String = row.get(9)?;
    let created_at_str: String = row.get(11)?;
    let updated_at_str: String = row.get(12)?;
    Ok(WorkItem {
        id: row.get(0)?,
        repository: row.get(1)?,
        issue_number: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        feature_branch: row.get(6)?,
        attempt: row.get(7)?,
        max_attempts: row.get(8)?,
        state: WorkItemState::parse(&state_str).unwrap_or(WorkItemState::Pending),
        assigned_worker: row.get(10)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}

fn row_to_pr_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrEntry> {
    let state_str: String = row.get(2)?;
    let opened_at_str: String = row.get(3)?;
    let last_event_at_str: String = row.get(4)?;
    Ok(PrEntry {
        issue_number: row.get(0)?,
        pr_number: row.get(1)?,
        state: PrState::parse(&state_str).unwrap_or(PrState::Pending),
        opened_at: parse_ts(&opened_at_str),
        last_event_at: parse_ts(&last_event_at_str),
    })
}

fn row_to_worker_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkerRecord> {
    let last_seen_str: String = row.get(1)?;
    let registered_at_str: String = row.get(3)?;
    Ok(WorkerRecord {
        worker_id: row.get(0)?,
        last_seen: parse_ts(&last_seen_str),
        current_issue: row.get(2)?,
        registered_at: parse_ts(&registered_at_str),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        // Idempotent column additions for DBs created before these columns existed.
        // ALTER TABLE fails if the column already exists; ignore that error.
        let alters = ["ALTER TABLE work_items ADD COLUMN assigned_at TEXT"];
        for sql in alters {
            let _ = conn.execute(sql, []);
        }
        Ok(())
    }

    // ── Work Items ────────────────────────────────────────────────────────

    pub fn enqueue_work_item(
        &self,
        repository: &str,
        issue_number: i64,
        title: &str,
        body: &str,
        labels: &[String],
        feature_branch: &str,
        max_attempts: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT INTO work_items \
             (repository, issue_number, title, body, labels, feature_branch, attempt, \
              max_attempts, state, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, 'pending', ?8, ?8) \
             ON CONFLICT(repository, issue_number) DO NOTHING",
            params![
                repository,
                issue_number,
                title,
                body,
                serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string()),
                feature_branch,
                max_attempts,
                now,
            ],
        )
        .context("enqueue_work_item")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_work_item(&self, id: i64) -> Result<Option<WorkItem>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, repository, issue_number, title, body, labels, feature_branch, \
             attempt, max_attempts, state, assigned_worker, created_at, updated_at \
             FROM work_items WHERE id = ?1",
            params![id],
            row_to_work_item,
        )
        .optional()
        .context("get_work_item")
    }

    /// Claims the oldest pending item for `worker_id` (`AssignNext`).
    /// Atomic within the connection's single-writer lock: the `UPDATE`
    /// targets the same row the preceding `SELECT` found before any other
    /// caller can observe it.
    pub fn assign_next(&self, worker_id: &str) -> Result<Option<WorkItem>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM work_items WHERE state = 'pending' ORDER BY id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("assign_next: select")?;

        let Some(id) = id else {
            return Ok(None);
        };

        let now = now_str();
        conn.execute(
            "UPDATE work_items SET state = 'in_progress', assigned_worker = ?1, \
             assigned_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![worker_id, now, id],
        )
        .context("assign_next: update")?;

        conn.query_row(
            "SELECT id, repository, issue_number, title, body, labels, feature_branch, \
             attempt, max_attempts, state, assigned_worker, created_at, updated_at \
             FROM work_items WHERE id = ?1",
            params![id],
            row_to_work_item,
        )
        .optional()
        .context("assign_next: reload")
    }

    pub fn complete_work_item(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE work_items SET state = 'completed', updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )
        .context("complete_work_item")?;
        Ok(())
    }

    /// Returns the item to `pending` (transient failure, attempt unchanged)
    /// or to `failed` (attempt exhausted or non-retriable).
    pub fn fail_work_item(&self, id: i64, increment_attempt: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let (attempt, max_attempts): (i64, i64) = conn.query_row(
            "SELECT attempt, max_attempts FROM work_items WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let new_attempt = if increment_attempt { attempt + 1 } else { attempt };
        let state = if new_attempt > max_attempts { "failed" } else { "pending" };

        conn.execute(
            "UPDATE work_items SET state = ?1, attempt = ?2, assigned_worker = NULL, \
             assigned_at = NULL, updated_at = ?3 WHERE id = ?4",
            params![state, new_attempt, now_str(), id],
        )
        .context("fail_work_item")?;
        Ok(())
    }

    /// Forces an item straight to `failed` regardless of attempt count: a
    /// Product Owner rejection (or revision-exhaustion) is a deliberate
    /// terminal decision, not a flaky error worth retrying the whole
    /// pipeline over.
    pub fn fail_work_item_terminal(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE work_items SET state = 'failed', assigned_worker = NULL, \
             assigned_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )
        .context("fail_work_item_terminal")?;
        Ok(())
    }

    /// `ExpireStaleAssignments`: returns abandoned assignments (no
    /// heartbeat within `timeout_seconds`) to `pending` without penalizing
    /// the item's attempt count.
    pub fn expire_stale_assignments(&self, timeout_seconds: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = Utc::now() - chrono::Duration::seconds(timeout_seconds);
        let changed = conn.execute(
            "UPDATE work_items SET state = 'pending', assigned_worker = NULL, \
             assigned_at = NULL, updated_at = ?1 \
             WHERE state = 'in_progress' AND assigned_at < ?2",
            params![now_str(), fmt_ts(cutoff)],
        )
        .context("expire_stale_assignments")?;
        Ok(changed as u64)
    }

    pub fn list_work_items_by_state(&self, state: WorkItemState) -> Result<Vec<WorkItem>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, repository, issue_number, title, body, labels, feature_branch, \
             attempt, max_attempts, state, assigned_worker, created_at, updated_at \
             FROM work_items WHERE state = ?1 ORDER BY id ASC",
        )?;
        let items = stmt
            .query_map(params![state.as_str()], row_to_work_item)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_work_items_by_state")?;
        Ok(items)
    }

    // ── PR Entries ────────────────────────────────────────────────────────

    pub fn open_pr_entry(&self, repository: &str, issue_number: i64, pr_number: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT INTO pr_entries (issue_number, pr_number, repository, state, opened_at, last_event_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4) \
             ON CONFLICT(pr_number) DO NOTHING",
            params![issue_number, pr_number, repository, now],
        )
        .context("open_pr_entry")?;
        Ok(())
    }

    pub fn set_pr_state(&self, pr_number: i64, state: PrState) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pr_entries SET state = ?1, last_event_at = ?2 WHERE pr_number = ?3",
            params![state.as_str(), now_str(), pr_number],
        )
        .context("set_pr_state")?;
        Ok(())
    }

    pub fn get_pr_entry(&self, pr_number: i64) -> Result<Option<PrEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT issue_number, pr_number, state, opened_at, last_event_at \
             FROM pr_entries WHERE pr_number = ?1",
            params![pr_number],
            row_to_pr_entry,
        )
        .optional()
        .context("get_pr_entry")
    }

    /// Feeds the PR-review gate's pending-threshold check: `pending` and
    /// `changes_requested` are two strictly separate counts, never merged.
    pub fn list_pending_pr_numbers(&self, repository: &str) -> Result<Vec<i64>> {
        self.list_pr_numbers_in_state(repository, "pending")
    }

    /// Feeds the PR-review gate's changes-requested block.
    pub fn list_changes_requested_pr_numbers(&self, repository: &str) -> Result<Vec<i64>> {
        self.list_pr_numbers_in_state(repository, "changes_requested")
    }

    pub fn count_approved_pr_entries(&self, repository: &str) -> Result<u32> {
        Ok(self.list_pr_numbers_in_state(repository, "approved")?.len() as u32)
    }

    fn list_pr_numbers_in_state(&self, repository: &str, state: &str) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT pr_number FROM pr_entries \
             WHERE repository = ?1 AND state = ?2 \
             ORDER BY pr_number ASC",
        )?;
        let numbers = stmt
            .query_map(params![repository, state], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_pr_numbers_in_state")?;
        Ok(numbers)
    }

    // ── Worker Records ────────────────────────────────────────────────────

    pub fn heartbeat_worker(&self, worker_id: &str, current_issue: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT INTO worker_records (worker_id, last_seen, current_issue, registered_at) \
             VALUES (?1, ?2, ?3, ?2) \
             ON CONFLICT(worker_id) DO UPDATE SET last_seen = ?2, current_issue = ?3",
            params![worker_id, now, current_issue],
        )
        .context("heartbeat_worker")?;
        Ok(())
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT worker_id, last_seen, current_issue, registered_at \
             FROM worker_records ORDER BY worker_id ASC",
        )?;
        let workers = stmt
            .query_map([], row_to_worker_record)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_workers")?;
        Ok(workers)
    }

    pub fn prune_dead_workers(&self, timeout_seconds: i64) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = Utc::now() - chrono::Duration::seconds(timeout_seconds);
        let changed = conn
            .execute(
                "DELETE FROM worker_records WHERE last_seen < ?1",
                params![fmt_ts(cutoff)],
            )
            .context("prune_dead_workers")?;
        Ok(changed as u64)
    }

    // ── Workflow Records ──────────────────────────────────────────────────

    /// Archives a finished Workflow Record as a single row, replacing a
    /// continuous large-JSON-log anti-pattern with one write at termination.
    pub fn archive_workflow_record(&self, record: &WorkflowRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let status = record.status.map(|s| match s {
            WorkflowStatus::Approved => "approved",
            WorkflowStatus::Rejected => "rejected",
            WorkflowStatus::Failed => "failed",
        });
        conn.execute(
            "INSERT INTO workflow_records \
             (repository, issue_number, status, pr_url, total_cost_usd, total_duration_ms, \
              record_json, started_at, finished_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.repository,
                record.issue_number,
                status,
                record.pr_url,
                record.total_cost_usd,
                record.total_duration_ms as i64,
                serde_json::to_string(record).unwrap_or_default(),
                fmt_ts(record.started_at),
                record.finished_at.map(fmt_ts),
            ],
        )
        .context("archive_workflow_record")?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> Db {
        let mut db = Db::open(":memory:").expect("open in-memory db");
        db.migrate().expect("migrate");
        db
    }

    #[test]
    fn enqueue_and_assign_roundtrip() {
        let db = open_test_db();
        let id = db
            .enqueue_work_item("acme/widgets", 42, "Fix the thing", "body", &["bug".into()], "feature/issue-42", 5)
            .expect("enqueue");
        assert!(id > 0);

        let item = db.get_work_item(id).expect("get").expect("exists");
        assert_eq!(item.state, WorkItemState::Pending);
        assert_eq!(item.issue_number, 42);
        assert_eq!(item.labels, vec!["bug".to_string()]);

        let assigned = db.assign_next("worker-1").expect("assign").expect("an item");
        assert_eq!(assigned.id, id);
        assert_eq!(assigned.assigned_worker.as_deref(), Some("worker-1"));

        assert!(db.assign_next("worker-2").expect("assign").is_none());
    }

    #[test]
    fn duplicate_enqueue_is_a_noop() {
        let db = open_test_db();
        let first = db
            .enqueue_work_item("acme/widgets", 7, "t", "b", &[], "feature/issue-7", 5)
            .expect("enqueue");
        let second = db
            .enqueue_work_item("acme/widgets", 7, "t", "b", &[], "feature/issue-7", 5)
            .expect("enqueue");
        assert_eq!(first, second);
        assert_eq!(db.list_work_items_by_state(WorkItemState::Pending).unwrap().len(), 1);
    }

    #[test]
    fn fail_work_item_respects_max_attempts() {
        let db = open_test_db();
        let id = db
            .enqueue_work_item("acme/widgets", 1, "t", "b", &[], "feature/issue-1", 2)
            .expect("enqueue");
        db.assign_next("worker-1").unwrap();

        // attempt 1 of 2: still within budget, returns to pending.
        db.fail_work_item(id, true).unwrap();
        assert_eq!(db.get_work_item(id).unwrap().unwrap().state, WorkItemState::Pending);

        // attempt 2 of 2: exactly at max_attempts, still retried.
        db.assign_next("worker-1").unwrap();
        db.fail_work_item(id, true).unwrap();
        assert_eq!(db.get_work_item(id).unwrap().unwrap().state, WorkItemState::Pending);

        // attempt 3 exceeds max_attempts, terminally failed.
        db.assign_next("worker-1").unwrap();
        db.fail_work_item(id, true).unwrap();
        assert_eq!(db.get_work_item(id).unwrap().unwrap().state, WorkItemState::Failed);
    }

    #[test]
    fn transient_failure_does_not_increment_attempt() {
        let db = open_test_db();
        let id = db
            .enqueue_work_item("acme/widgets", 1, "t", "b", &[], "feature/issue-1", 1)
            .expect("enqueue");
        db.assign_next("worker-1").unwrap();
        db.fail_work_item(id, false).unwrap();
        let item = db.get_work_item(id).unwrap().unwrap();
        assert_eq!(item.state, WorkItemState::Pending);
        assert_eq!(item.attempt, 0);
    }

    #[test]
    fn pr_gate_counts_pending_and_changes_requested_separately() {
        let db = open_test_db();
        db.open_pr_entry("acme/widgets", 1, 100).unwrap();
        db.open_pr_entry("acme/widgets", 2, 101).unwrap();
        db.set_pr_state(101, PrState::ChangesRequested).unwrap();
        db.open_pr_entry("acme/widgets", 3, 102).unwrap();
        db.set_pr_state(102, PrState::Merged).unwrap();
        db.open_pr_entry("acme/widgets", 4, 103).unwrap();
        db.set_pr_state(103, PrState::Approved).unwrap();

        assert_eq!(db.list_pending_pr_numbers("acme/widgets").unwrap(), vec![100]);
        assert_eq!(db.list_changes_requested_pr_numbers("acme/widgets").unwrap(), vec![101]);
        assert_eq!(db.count_approved_pr_entries("acme/widgets").unwrap(), 1);
    }

    #[test]
    fn worker_heartbeat_upserts() {
        let db = open_test_db();
        db.heartbeat_worker("worker-1", None).unwrap();
        db.heartbeat_worker("worker-1", Some(42)).unwrap();
        let workers = db.list_workers().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].current_issue, Some(42));
    }
}
