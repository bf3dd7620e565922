//! Queue rows backing the SQLite `QueueAdapter` (§3, §4.2).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::db::{ConductorDb, json_col, parse_dt};
use super::models::Job;

impl ConductorDb {
    /// `INSERT OR IGNORE` keyed on `(queue, job_id)` — the idempotency contract of
    /// `addJob` (§4.2: "a second add with the same id is a no-op"). Returns the row
    /// either way so the caller can tell new-vs-existing from insert count if needed.
    pub fn insert_job_if_new(&self, queue: &str, job_id: &str, payload: &Value) -> Result<Job> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO jobs (queue, job_id, payload, status, attempts, last_error, available_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, NULL, ?4, ?4, ?4)",
                params![queue, job_id, json_col(payload), now],
            )
            .context("insert_job_if_new")?;
        self.get_job(queue, job_id)?
            .ok_or_else(|| anyhow::anyhow!("job disappeared after insert"))
    }

    pub fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>> {
        self.conn()
            .query_row(
                "SELECT * FROM jobs WHERE queue = ?1 AND job_id = ?2",
                params![queue, job_id],
                Self::row_to_job,
            )
            .optional()
            .context("get_job")
    }

    /// Claims the oldest `pending` job for `queue` whose `available_at` has arrived,
    /// atomically marking it `processing`. Returns `None` if no job is ready.
    pub fn claim_next_job(&mut self, queue: &str) -> Result<Option<Job>> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|tx| {
            let candidate: Option<(String, String)> = tx
                .query_row(
                    "SELECT queue, job_id FROM jobs WHERE queue = ?1 AND status = 'pending' AND available_at <= ?2 ORDER BY created_at ASC LIMIT 1",
                    params![queue, now],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((queue, job_id)) = candidate else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE jobs SET status = 'processing', updated_at = ?1 WHERE queue = ?2 AND job_id = ?3",
                params![now, queue, job_id],
            )?;
            let job = tx
                .query_row(
                    "SELECT * FROM jobs WHERE queue = ?1 AND job_id = ?2",
                    params![queue, job_id],
                    Self::row_to_job,
                )
                .context("claim_next_job reread")?;
            Ok(Some(job))
        })
    }

    pub fn mark_job_completed(&self, queue: &str, job_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE jobs SET status = 'completed', updated_at = ?1 WHERE queue = ?2 AND job_id = ?3",
            params![Utc::now().to_rfc3339(), queue, job_id],
        )?;
        Ok(())
    }

    pub fn mark_job_failed(&self, queue: &str, job_id: &str, error: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE jobs SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE queue = ?3 AND job_id = ?4",
            params![error, Utc::now().to_rfc3339(), queue, job_id],
        )?;
        Ok(())
    }

    /// Re-queues a job after a handler-thrown error: increments `attempts`, records the
    /// error, and schedules the next attempt at `retry_at` (exponential backoff with
    /// jitter is computed by the caller per §4.2).
    pub fn reschedule_job(
        &self,
        queue: &str,
        job_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn().execute(
            "UPDATE jobs SET status = 'pending', attempts = attempts + 1, last_error = ?1, available_at = ?2, updated_at = ?3 WHERE queue = ?4 AND job_id = ?5",
            params![error, retry_at.to_rfc3339(), Utc::now().to_rfc3339(), queue, job_id],
        )?;
        self.conn()
            .query_row(
                "SELECT attempts FROM jobs WHERE queue = ?1 AND job_id = ?2",
                params![queue, job_id],
                |r| r.get(0),
            )
            .context("reschedule_job")
    }

    /// Removes up to `limit` jobs in `status` older than `grace` (§4.2 `clean`).
    pub fn clean_jobs(
        &self,
        queue: &str,
        status: &str,
        grace: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<String>> {
        let cutoff = (Utc::now() - grace).to_rfc3339();
        let mut stmt = self.conn().prepare(
            "SELECT job_id FROM jobs WHERE queue = ?1 AND status = ?2 AND updated_at < ?3 ORDER BY updated_at ASC LIMIT ?4",
        )?;
        let limit_i64 = limit as i64;
        let ids: Vec<String> = stmt
            .query_map(params![queue, status, cutoff, limit_i64], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for id in &ids {
            self.conn().execute(
                "DELETE FROM jobs WHERE queue = ?1 AND job_id = ?2",
                params![queue, id],
            )?;
        }
        Ok(ids)
    }

    fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
        let payload: String = row.get("payload")?;
        Ok(Job {
            queue: row.get("queue")?,
            job_id: row.get("job_id")?,
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
            available_at: parse_dt(&row.get::<_, String>("available_at")?).unwrap_or_default(),
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_job_is_idempotent_on_job_id() {
        let db = ConductorDb::open_in_memory().unwrap();
        let p1 = serde_json::json!({"a": 1});
        let p2 = serde_json::json!({"a": 2});
        let first = db.insert_job_if_new("webhooks", "d42", &p1).unwrap();
        let second = db.insert_job_if_new("webhooks", "d42", &p2).unwrap();
        assert_eq!(first.payload, second.payload);
        assert_eq!(first.payload, p1);
    }

    #[test]
    fn claim_next_job_respects_availability_and_fifo_order() {
        let mut db = ConductorDb::open_in_memory().unwrap();
        db.insert_job_if_new("runs", "j1", &Value::Null).unwrap();
        db.insert_job_if_new("runs", "j2", &Value::Null).unwrap();
        let claimed = db.claim_next_job("runs").unwrap().unwrap();
        assert_eq!(claimed.job_id, "j1");
        assert_eq!(claimed.status, "processing");
        let next = db.claim_next_job("runs").unwrap().unwrap();
        assert_eq!(next.job_id, "j2");
        assert!(db.claim_next_job("runs").unwrap().is_none());
    }

    #[test]
    fn rescheduled_job_is_not_claimable_until_retry_at() {
        let mut db = ConductorDb::open_in_memory().unwrap();
        db.insert_job_if_new("runs", "j1", &Value::Null).unwrap();
        db.claim_next_job("runs").unwrap().unwrap();
        let future = Utc::now() + chrono::Duration::hours(1);
        db.reschedule_job("runs", "j1", "boom", future).unwrap();
        assert!(db.claim_next_job("runs").unwrap().is_none());
    }
}
