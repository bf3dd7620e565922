//! Operator actions and policy overrides (§3, §4.9).

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use conductor_common::*;
use rusqlite::{OptionalExtension, Row, params};

use super::db::{ConductorDb, parse_dt};
use super::models::{OperatorAction, Override};

impl ConductorDb {
    /// Appends an audit row for an operator action. Callers record this *before* applying
    /// the phase transition it authorizes (§4.9 — audit precedes effect).
    #[allow(clippy::too_many_arguments)]
    pub fn record_operator_action(
        &self,
        run_id: &RunId,
        actor_id: &str,
        actor_type: ActorType,
        action_kind: &str,
        comment: Option<&str>,
        from_phase: Phase,
        to_phase: Option<Phase>,
    ) -> Result<OperatorAction> {
        let id = OperatorActionId::new();
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO operator_actions (id, run_id, actor_id, actor_type, action_kind, comment, from_phase, to_phase, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.as_str(),
                run_id.as_str(),
                actor_id,
                actor_type.as_str(),
                action_kind,
                comment,
                from_phase.as_str(),
                to_phase.map(|p| p.as_str()),
                now,
            ],
        ).context("record_operator_action")?;
        self.get_operator_action(&id)?
            .ok_or_else(|| anyhow!("operator action disappeared after insert"))
    }

    pub fn get_operator_action(&self, id: &OperatorActionId) -> Result<Option<OperatorAction>> {
        self.conn()
            .query_row(
                "SELECT * FROM operator_actions WHERE id = ?1",
                params![id.as_str()],
                Self::row_to_operator_action,
            )
            .optional()
            .context("get_operator_action")
    }

    pub fn list_operator_actions_for_run(&self, run_id: &RunId) -> Result<Vec<OperatorAction>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM operator_actions WHERE run_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![run_id.as_str()], Self::row_to_operator_action)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_operator_actions_for_run")
    }

    fn row_to_operator_action(row: &Row) -> rusqlite::Result<OperatorAction> {
        let from_phase: String = row.get("from_phase")?;
        let to_phase: Option<String> = row.get("to_phase")?;
        Ok(OperatorAction {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            actor_id: row.get("actor_id")?,
            actor_type: row.get::<_, String>("actor_type")?.parse().unwrap_or(ActorType::Human),
            action_kind: row.get("action_kind")?,
            comment: row.get("comment")?,
            from_phase: from_phase.parse().unwrap_or(Phase::Pending),
            to_phase: to_phase.and_then(|s| s.parse().ok()),
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_override(
        &self,
        run_id: &RunId,
        kind: &str,
        scope: OverrideScope,
        constraint_kind: &str,
        constraint_value: &str,
        constraint_hash: &str,
        policy_set_id: &str,
        operator_id: &str,
        justification: &str,
    ) -> Result<Override> {
        let id = OverrideId::new();
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO overrides (id, run_id, kind, scope, constraint_kind, constraint_value, constraint_hash, policy_set_id, operator_id, justification, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id.as_str(),
                run_id.as_str(),
                kind,
                scope.as_str(),
                constraint_kind,
                constraint_value,
                constraint_hash,
                policy_set_id,
                operator_id,
                justification,
                now,
            ],
        ).context("create_override")?;
        self.get_override(&id)?.ok_or_else(|| anyhow!("override disappeared after insert"))
    }

    pub fn get_override(&self, id: &OverrideId) -> Result<Option<Override>> {
        self.conn()
            .query_row("SELECT * FROM overrides WHERE id = ?1", params![id.as_str()], Self::row_to_override)
            .optional()
            .context("get_override")
    }

    /// Overrides still in force for a run whose `constraint_hash` matches the constraint
    /// a gate is about to re-check (§4.9 — overrides are scoped and hash-bound, not blanket).
    pub fn find_active_override(
        &self,
        run_id: &RunId,
        constraint_kind: &str,
        constraint_hash: &str,
    ) -> Result<Option<Override>> {
        self.conn()
            .query_row(
                "SELECT * FROM overrides WHERE run_id = ?1 AND constraint_kind = ?2 AND constraint_hash = ?3 ORDER BY created_at DESC LIMIT 1",
                params![run_id.as_str(), constraint_kind, constraint_hash],
                Self::row_to_override,
            )
            .optional()
            .context("find_active_override")
    }

    fn row_to_override(row: &Row) -> rusqlite::Result<Override> {
        Ok(Override {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            kind: row.get("kind")?,
            scope: row.get::<_, String>("scope")?.parse().unwrap_or(OverrideScope::ThisRun),
            constraint_kind: row.get("constraint_kind")?,
            constraint_value: row.get("constraint_value")?,
            constraint_hash: row.get("constraint_hash")?,
            policy_set_id: row.get("policy_set_id")?,
            operator_id: row.get("operator_id")?,
            justification: row.get("justification")?,
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_lookup_is_scoped_to_matching_hash() {
        let db = ConductorDb::open_in_memory().unwrap();
        let run_id = RunId::new();
        db.create_override(&run_id, "skip_gate", OverrideScope::ThisRun, "tests_pass", "v1", "hash_a", "ps_1", "op_1", "flaky test").unwrap();
        assert!(db.find_active_override(&run_id, "tests_pass", "hash_a").unwrap().is_some());
        assert!(db.find_active_override(&run_id, "tests_pass", "hash_b").unwrap().is_none());
    }

    #[test]
    fn actions_list_preserves_insertion_order() {
        let db = ConductorDb::open_in_memory().unwrap();
        let run_id = RunId::new();
        db.record_operator_action(&run_id, "user_1", ActorType::Human, "approve", None, Phase::AwaitingPlanApproval, Some(Phase::Planning)).unwrap();
        db.record_operator_action(&run_id, "user_1", ActorType::Human, "retry", None, Phase::Blocked, Some(Phase::Executing)).unwrap();
        let actions = db.list_operator_actions_for_run(&run_id).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_kind, "approve");
    }
}
