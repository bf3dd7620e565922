//! Outbox rows for reliable external writes (§3, §4.4).

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use conductor_common::*;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::db::{ConductorDb, json_col, parse_dt};
use super::models::GithubWrite;

impl ConductorDb {
    /// Inserts a `github_write` row. Must be called inside the same transaction as the
    /// state change that caused it (§4.4) — callers use `ConductorDb::transaction`.
    pub fn insert_github_write(
        &self,
        run_id: &RunId,
        kind: &str,
        target_node_id: Option<&str>,
        idempotency_key: &str,
        payload: &Value,
    ) -> Result<GithubWrite> {
        let id = GithubWriteId::new();
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO github_writes (id, run_id, kind, target_node_id, idempotency_key, payload, status, retry_count, last_error, result_id, result_url, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, NULL, NULL, NULL, ?7, ?7, NULL)",
            params![id.as_str(), run_id.as_str(), kind, target_node_id, idempotency_key, json_col(payload), now],
        ).context("insert_github_write")?;
        self.get_github_write(&id)?.ok_or_else(|| anyhow!("github_write disappeared after insert"))
    }

    /// Rows ready for the `github_writes` worker to pick up, oldest-first so same-run
    /// writes stay ordered by insertion sequence (§4.4).
    pub fn list_pending_github_writes(&self, limit: usize) -> Result<Vec<GithubWrite>> {
        let mut stmt = self.conn().prepare(
            "SELECT * FROM github_writes WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_write)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_pending_github_writes")
    }

    pub fn get_github_write(&self, id: &GithubWriteId) -> Result<Option<GithubWrite>> {
        self.conn()
            .query_row("SELECT * FROM github_writes WHERE id = ?1", params![id.as_str()], Self::row_to_write)
            .optional()
            .context("get_github_write")
    }

    pub fn mark_write_in_flight(&self, id: &GithubWriteId) -> Result<()> {
        self.conn().execute(
            "UPDATE github_writes SET status = 'in_flight', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
            params![Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(())
    }

    pub fn mark_write_completed(&self, id: &GithubWriteId, result_id: &str, result_url: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "UPDATE github_writes SET status = 'completed', result_id = ?1, result_url = ?2, updated_at = ?3, completed_at = ?3 WHERE id = ?4",
            params![result_id, result_url, now, id.as_str()],
        )?;
        Ok(())
    }

    pub fn mark_write_failed(&self, id: &GithubWriteId, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "UPDATE github_writes SET status = 'failed', last_error = ?1, updated_at = ?2, completed_at = ?2 WHERE id = ?3",
            params![error, now, id.as_str()],
        )?;
        Ok(())
    }

    pub fn increment_write_retry_count(&self, id: &GithubWriteId, error: &str) -> Result<i64> {
        self.conn().execute(
            "UPDATE github_writes SET retry_count = retry_count + 1, last_error = ?1, status = 'pending', updated_at = ?2 WHERE id = ?3",
            params![error, Utc::now().to_rfc3339(), id.as_str()],
        )?;
        self.conn().query_row(
            "SELECT retry_count FROM github_writes WHERE id = ?1",
            params![id.as_str()],
            |r| r.get(0),
        ).context("increment_write_retry_count")
    }

    fn row_to_write(row: &Row) -> rusqlite::Result<GithubWrite> {
        let status: String = row.get("status")?;
        let payload: String = row.get("payload")?;
        Ok(GithubWrite {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            kind: row.get("kind")?,
            target_node_id: row.get("target_node_id")?,
            idempotency_key: row.get("idempotency_key")?,
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            status: status.parse().unwrap_or(GithubWriteStatus::Pending),
            retry_count: row.get("retry_count")?,
            last_error: row.get("last_error")?,
            result_id: row.get("result_id")?,
            result_url: row.get("result_url")?,
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
            completed_at: row
                .get::<_, Option<String>>("completed_at")?
                .and_then(|s| parse_dt(&s).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_progresses_pending_in_flight_completed() {
        let db = ConductorDb::open_in_memory().unwrap();
        let run_id = RunId::new();
        let write = db.insert_github_write(&run_id, "create_pr", None, "idem1", &Value::Null).unwrap();
        assert_eq!(write.status, GithubWriteStatus::Pending);
        db.mark_write_in_flight(&write.id).unwrap();
        let mid = db.get_github_write(&write.id).unwrap().unwrap();
        assert_eq!(mid.status, GithubWriteStatus::InFlight);
        db.mark_write_completed(&write.id, "pr_1", "https://example.com/pr/1").unwrap();
        let done = db.get_github_write(&write.id).unwrap().unwrap();
        assert_eq!(done.status, GithubWriteStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn list_pending_github_writes_excludes_in_flight_and_completed() {
        let db = ConductorDb::open_in_memory().unwrap();
        let run_id = RunId::new();
        let pending = db.insert_github_write(&run_id, "create_pr", None, "idem1", &Value::Null).unwrap();
        let in_flight = db.insert_github_write(&run_id, "post_comment", None, "idem2", &Value::Null).unwrap();
        db.mark_write_in_flight(&in_flight.id).unwrap();
        let due = db.list_pending_github_writes(10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, pending.id);
    }
}
