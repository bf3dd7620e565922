//! Append-only event log with a global monotonic sequence (§3, §4.3).

use anyhow::{Context, Result};
use chrono::Utc;
use conductor_common::*;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::db::{ConductorDb, json_col, parse_dt};
use super::models::Event;

impl ConductorDb {
    /// Appends an event, or returns `Ok(None)` if `idempotency_key` already exists —
    /// the caller's `createEvent(...)` contract (§4.3): "returns the event or `null`".
    #[allow(clippy::too_many_arguments)]
    pub fn create_event(
        &self,
        project_id: &ProjectId,
        run_id: Option<&RunId>,
        event_type: &str,
        class: EventClass,
        payload: &Value,
        idempotency_key: &str,
        source: &str,
    ) -> Result<Option<Event>> {
        if self.find_event_by_idempotency_key(idempotency_key)?.is_some() {
            return Ok(None);
        }
        let id = EventId::new();
        let now = Utc::now().to_rfc3339();
        let sequence: i64 = self
            .conn()
            .query_row("SELECT COALESCE(MAX(sequence), 0) + 1 FROM events", [], |r| r.get(0))?;
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO events (id, sequence, project_id, run_id, event_type, class, payload, idempotency_key, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id.as_str(),
                sequence,
                project_id.as_str(),
                run_id.map(|r| r.as_str()),
                event_type,
                class.as_str(),
                json_col(payload),
                idempotency_key,
                source,
                now,
            ],
        ).context("create_event")?;
        if inserted == 0 {
            // Lost a race against a concurrent writer with the same idempotency key.
            return Ok(None);
        }
        if let Some(run_id) = run_id {
            self.bump_run_event_sequence(run_id, sequence)?;
        }
        Ok(self.get_event(&id)?)
    }

    pub fn get_event(&self, id: &EventId) -> Result<Option<Event>> {
        self.conn()
            .query_row("SELECT * FROM events WHERE id = ?1", params![id.as_str()], Self::row_to_event)
            .optional()
            .context("get_event")
    }

    pub fn find_event_by_idempotency_key(&self, key: &str) -> Result<Option<Event>> {
        self.conn()
            .query_row(
                "SELECT * FROM events WHERE idempotency_key = ?1",
                params![key],
                Self::row_to_event,
            )
            .optional()
            .context("find_event_by_idempotency_key")
    }

    /// Events with `sequence > since_sequence` for any of `project_ids`, ascending (§4.3).
    pub fn query_stream_events_for_replay(
        &self,
        since_sequence: i64,
        project_ids: &[ProjectId],
        limit: usize,
    ) -> Result<Vec<Event>> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = project_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT * FROM events WHERE sequence > ? AND project_id IN ({placeholders}) ORDER BY sequence ASC LIMIT ?"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let mut param_values: Vec<&dyn rusqlite::ToSql> = vec![&since_sequence];
        for p in project_ids {
            param_values.push(p);
        }
        let limit_i64 = limit as i64;
        param_values.push(&limit_i64);
        let rows = stmt.query_map(param_values.as_slice(), Self::row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("query_stream_events_for_replay")
    }

    pub fn count_events_after(&self, since_sequence: i64, project_ids: &[ProjectId]) -> Result<usize> {
        if project_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = project_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT COUNT(*) FROM events WHERE sequence > ? AND project_id IN ({placeholders})"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let mut param_values: Vec<&dyn rusqlite::ToSql> = vec![&since_sequence];
        for p in project_ids {
            param_values.push(p);
        }
        let count: i64 = stmt.query_row(param_values.as_slice(), |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Recent events enriched with the resolved project name and task title (§4.3).
    /// Project "name" has no dedicated column in this schema; the installation id
    /// stands in for it, matching the only project-identifying attribute in §3.
    pub fn query_recent_stream_events_enriched(
        &self,
        project_ids: &[ProjectId],
        limit: usize,
    ) -> Result<Vec<EnrichedEvent>> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = project_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT e.*, p.forge_installation_id as project_label, t.title as task_title
             FROM events e
             LEFT JOIN projects p ON p.id = e.project_id
             LEFT JOIN runs r ON r.id = e.run_id
             LEFT JOIN tasks t ON t.id = r.task_id
             WHERE e.project_id IN ({placeholders})
             ORDER BY e.sequence DESC LIMIT ?"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let mut param_values: Vec<&dyn rusqlite::ToSql> = project_ids.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        let limit_i64 = limit as i64;
        param_values.push(&limit_i64);
        let rows = stmt.query_map(param_values.as_slice(), |row| {
            Ok(EnrichedEvent {
                event: Self::row_to_event(row)?,
                project_label: row
                    .get::<_, Option<i64>>("project_label")?
                    .map(|id| id.to_string()),
                task_title: row.get("task_title")?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("query_recent_stream_events_enriched")
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
        let class: String = row.get("class")?;
        let payload: String = row.get("payload")?;
        Ok(Event {
            id: row.get("id")?,
            sequence: row.get("sequence")?,
            project_id: row.get("project_id")?,
            run_id: row.get::<_, Option<String>>("run_id")?.map(Into::into),
            event_type: row.get("event_type")?,
            class: class.parse().unwrap_or(EventClass::Decision),
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            idempotency_key: row.get("idempotency_key")?,
            source: row.get("source")?,
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EnrichedEvent {
    pub event: Event,
    pub project_label: Option<String>,
    pub task_title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_event_assigns_increasing_sequence() {
        let db = ConductorDb::open_in_memory().unwrap();
        let project_id = ProjectId::new();
        let e1 = db
            .create_event(&project_id, None, "task.created", EventClass::External, &Value::Null, "k1", "webhook")
            .unwrap()
            .unwrap();
        let e2 = db
            .create_event(&project_id, None, "task.created", EventClass::External, &Value::Null, "k2", "webhook")
            .unwrap()
            .unwrap();
        assert!(e2.sequence > e1.sequence);
    }

    #[test]
    fn repeated_idempotency_key_returns_none_and_does_not_append() {
        let db = ConductorDb::open_in_memory().unwrap();
        let project_id = ProjectId::new();
        let first = db
            .create_event(&project_id, None, "task.created", EventClass::External, &Value::Null, "dup", "webhook")
            .unwrap();
        assert!(first.is_some());
        let second = db
            .create_event(&project_id, None, "task.created", EventClass::External, &Value::Null, "dup", "webhook")
            .unwrap();
        assert!(second.is_none());
        let count: i64 = db.conn().query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn replay_respects_since_sequence_and_project_filter() {
        let db = ConductorDb::open_in_memory().unwrap();
        let p1 = ProjectId::new();
        let p2 = ProjectId::new();
        db.create_event(&p1, None, "a", EventClass::External, &Value::Null, "k1", "s").unwrap();
        db.create_event(&p2, None, "a", EventClass::External, &Value::Null, "k2", "s").unwrap();
        db.create_event(&p1, None, "a", EventClass::External, &Value::Null, "k3", "s").unwrap();
        let replayed = db.query_stream_events_for_replay(0, &[p1.clone()], 100).unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(replayed.iter().all(|e| e.project_id == p1));
        assert!(replayed[0].sequence < replayed[1].sequence);
    }
}
