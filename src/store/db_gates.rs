//! Gate definitions and evaluations (§4.8).

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use conductor_common::*;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::db::{ConductorDb, parse_dt};
use super::models::{GateDefinition, GateEvaluation};

impl ConductorDb {
    pub fn upsert_gate_definition(
        &self,
        id: &str,
        kind: GateKind,
        description: &str,
        default_config: &Value,
    ) -> Result<GateDefinition> {
        self.conn().execute(
            "INSERT INTO gate_definitions (id, kind, description, default_config) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, description = excluded.description, default_config = excluded.default_config",
            params![id, kind.as_str(), description, default_config.to_string()],
        ).context("upsert_gate_definition")?;
        self.get_gate_definition(id)?
            .ok_or_else(|| anyhow!("gate definition disappeared after upsert"))
    }

    pub fn get_gate_definition(&self, id: &str) -> Result<Option<GateDefinition>> {
        self.conn()
            .query_row(
                "SELECT * FROM gate_definitions WHERE id = ?1",
                params![id],
                Self::row_to_gate_definition,
            )
            .optional()
            .context("get_gate_definition")
    }

    pub fn list_gate_definitions(&self) -> Result<Vec<GateDefinition>> {
        let mut stmt = self.conn().prepare("SELECT * FROM gate_definitions ORDER BY id")?;
        let rows = stmt.query_map([], Self::row_to_gate_definition)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_gate_definitions")
    }

    fn row_to_gate_definition(row: &Row) -> rusqlite::Result<GateDefinition> {
        let kind: String = row.get("kind")?;
        let config: String = row.get("default_config")?;
        Ok(GateDefinition {
            id: row.get("id")?,
            kind: kind.parse().unwrap_or(GateKind::Automatic),
            description: row.get("description")?,
            default_config: serde_json::from_str(&config).unwrap_or(Value::Null),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_gate_evaluation(
        &self,
        run_id: &RunId,
        gate_id: &str,
        kind: GateKind,
        status: GateStatus,
        reason: Option<&str>,
        details: Option<&Value>,
        causation_event_id: &EventId,
        causation_sequence: i64,
        duration_ms: Option<i64>,
    ) -> Result<GateEvaluation> {
        let id = GateEvalId::new();
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO gate_evaluations (id, run_id, gate_id, kind, status, reason, details, causation_event_id, causation_sequence, duration_ms, evaluated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id.as_str(),
                run_id.as_str(),
                gate_id,
                kind.as_str(),
                status.as_str(),
                reason,
                details.map(|d| d.to_string()),
                causation_event_id.as_str(),
                causation_sequence,
                duration_ms,
                now,
            ],
        ).context("create_gate_evaluation")?;
        self.get_gate_evaluation(&id)?
            .ok_or_else(|| anyhow!("gate evaluation disappeared after insert"))
    }

    pub fn get_gate_evaluation(&self, id: &GateEvalId) -> Result<Option<GateEvaluation>> {
        self.conn()
            .query_row(
                "SELECT * FROM gate_evaluations WHERE id = ?1",
                params![id.as_str()],
                Self::row_to_gate_evaluation,
            )
            .optional()
            .context("get_gate_evaluation")
    }

    /// Latest evaluation for `(run, gate)`, ordered by the sequence of the causing event
    /// (§4.8 — "determined by causation event sequence", not insertion order).
    pub fn get_latest_gate_evaluation(
        &self,
        run_id: &RunId,
        gate_id: &str,
    ) -> Result<Option<GateEvaluation>> {
        self.conn()
            .query_row(
                "SELECT * FROM gate_evaluations WHERE run_id = ?1 AND gate_id = ?2 ORDER BY causation_sequence DESC LIMIT 1",
                params![run_id.as_str(), gate_id],
                Self::row_to_gate_evaluation,
            )
            .optional()
            .context("get_latest_gate_evaluation")
    }

    pub fn list_gate_ids_with_evaluations(&self, run_id: &RunId) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT DISTINCT gate_id FROM gate_evaluations WHERE run_id = ?1")?;
        let rows = stmt.query_map(params![run_id.as_str()], |r| r.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_gate_ids_with_evaluations")
    }

    fn row_to_gate_evaluation(row: &Row) -> rusqlite::Result<GateEvaluation> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let details: Option<String> = row.get("details")?;
        Ok(GateEvaluation {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            gate_id: row.get("gate_id")?,
            kind: kind.parse().unwrap_or(GateKind::Automatic),
            status: status.parse().unwrap_or(GateStatus::Pending),
            reason: row.get("reason")?,
            details: details.and_then(|s| serde_json::from_str(&s).ok()),
            causation_event_id: row.get("causation_event_id")?,
            causation_sequence: row.get("causation_sequence")?,
            duration_ms: row.get("duration_ms")?,
            evaluated_at: parse_dt(&row.get::<_, String>("evaluated_at")?).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_gate_evaluation_follows_causation_sequence_not_insertion_order() {
        let db = ConductorDb::open_in_memory().unwrap();
        let run_id = RunId::new();
        // Insert the later-sequence evaluation first to prove ordering is by
        // causation_sequence, not insertion order.
        db.create_gate_evaluation(&run_id, "tests_pass", GateKind::Automatic, GateStatus::Passed, None, None, &EventId::new(), 5, None).unwrap();
        db.create_gate_evaluation(&run_id, "tests_pass", GateKind::Automatic, GateStatus::Failed, None, None, &EventId::new(), 2, None).unwrap();
        let latest = db.get_latest_gate_evaluation(&run_id, "tests_pass").unwrap().unwrap();
        assert_eq!(latest.status, GateStatus::Passed);
        assert_eq!(latest.causation_sequence, 5);
    }
}
