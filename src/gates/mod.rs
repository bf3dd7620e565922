//! Gate definitions, evaluations, and derived state (§4.8).
//!
//! Persistence lives in `crate::store::db_gates`; this module is the business layer —
//! seeding built-in definitions, deriving per-run gate state, and the one operation that
//! couples gates to the run state machine. Per the one-directional dependency called out
//! in the design notes, this module depends on `crate::runs`; `crate::runs` never depends
//! back on `crate::gates`.

use std::collections::HashMap;

use conductor_common::{EventClass, EventId, GateKind, GateStatus, Phase, RunId};
use serde_json::{Value, json};

use crate::errors::ConductorError;
use crate::runs::{self, TransitionArgs};
use crate::store::StoreHandle;
use crate::store::models::{Event, Run};

/// Seeds the four built-in gate definitions idempotently (§4.8). Safe to call on every
/// process start — `upsert_gate_definition` is an `INSERT ... ON CONFLICT DO UPDATE`.
pub async fn ensure_built_in_gate_definitions(store: &StoreHandle) -> Result<(), ConductorError> {
    store
        .call(|db| {
            db.upsert_gate_definition(
                "plan_approval",
                GateKind::Human,
                "A human must approve the plan before implementation begins",
                &json!({"required": true, "timeout_hours": 72, "reminder_hours": 24}),
            )?;
            db.upsert_gate_definition(
                "tests_pass",
                GateKind::Automatic,
                "The test suite must pass before a run can move to review",
                &json!({"max_retries": 3, "timeout_minutes": 15, "allow_skip": false}),
            )?;
            db.upsert_gate_definition(
                "code_review",
                GateKind::Automatic,
                "Automated code review must complete before a run can be marked done",
                &json!({"max_rounds": 3, "allow_accept_with_issues": true}),
            )?;
            db.upsert_gate_definition(
                "merge_wait",
                GateKind::Human,
                "A human must confirm the pull request is ready to merge",
                &json!({}),
            )?;
            Ok(())
        })
        .await
        .map_err(runs::downcast_conductor_error)?;
    Ok(())
}

/// Appends a gate evaluation row (§4.8 `createGateEvaluation`).
#[allow(clippy::too_many_arguments)]
pub async fn record_gate_evaluation(
    store: &StoreHandle,
    run_id: &RunId,
    gate_id: &'static str,
    kind: GateKind,
    status: GateStatus,
    reason: Option<String>,
    details: Option<Value>,
    causation_event_id: EventId,
    causation_sequence: i64,
    duration_ms: Option<i64>,
) -> Result<(), ConductorError> {
    let run_id = run_id.clone();
    store
        .call(move |db| {
            db.create_gate_evaluation(
                &run_id,
                gate_id,
                kind,
                status,
                reason.as_deref(),
                details.as_ref(),
                &causation_event_id,
                causation_sequence,
                duration_ms,
            )?;
            Ok(())
        })
        .await
        .map_err(runs::downcast_conductor_error)?;
    Ok(())
}

/// `deriveGateState` (§4.8): a gate with no evaluation is absent from the map.
pub async fn derive_gate_state(
    store: &StoreHandle,
    run_id: &RunId,
) -> Result<HashMap<String, GateStatus>, ConductorError> {
    let run_id = run_id.clone();
    store
        .call(move |db| {
            let gate_ids = db.list_gate_ids_with_evaluations(&run_id)?;
            let mut state = HashMap::with_capacity(gate_ids.len());
            for gate_id in gate_ids {
                if let Some(eval) = db.get_latest_gate_evaluation(&run_id, &gate_id)? {
                    state.insert(gate_id, eval.status);
                }
            }
            Ok(state)
        })
        .await
        .map_err(runs::downcast_conductor_error)
}

/// Runs in `awaiting_plan_approval` or `blocked`, oldest-waiting-first (§4.8).
pub async fn get_runs_awaiting_gates(
    store: &StoreHandle,
    project_id: &conductor_common::ProjectId,
) -> Result<Vec<Run>, ConductorError> {
    let project_id = project_id.clone();
    store
        .call(move |db| db.list_runs_in_phases(&project_id, &[Phase::AwaitingPlanApproval, Phase::Blocked]))
        .await
        .map_err(runs::downcast_conductor_error)
}

/// Result of the required-gate check half of `evaluateGatesAndTransition` (§4.8).
#[derive(Debug, Clone)]
pub struct GateCheckResult {
    pub all_passed: bool,
    pub blocked_by: Option<String>,
}

/// Atomic gate-check-then-transition (§4.8, §4.9). Checks every gate in `required_gates`
/// is `passed`; only if all pass does it transition the run. The check and the
/// transition run inside the *same* `store.call`, not two sequential calls — `derive_gate_state`
/// and `runs::transition_phase` each acquire the store's connection independently, and
/// calling them back-to-back would let a concurrent gate evaluation land in the gap
/// between the check and the transition. Folding both into one closure means the whole
/// operation holds the connection for its entire duration, closing that gap. Returns the
/// gate check result and, on success, the updated run plus the `run.phase_changed` event
/// so the caller can publish it on `EventBus`.
pub async fn evaluate_gates_and_transition(
    store: &StoreHandle,
    run_id: &RunId,
    required_gates: &[&'static str],
    to_phase: Phase,
    args: TransitionArgs<'_>,
) -> Result<(GateCheckResult, Option<(Run, Event)>), ConductorError> {
    let run_id_owned = run_id.clone();
    let required_gates = required_gates.to_vec();
    let step = args.step.map(str::to_owned);
    let triggered_by = args.triggered_by.unwrap_or("system").to_owned();
    let reason = args.reason.map(str::to_owned);
    let result = args.result.map(str::to_owned);
    let blocked_reason = args.blocked_reason.map(str::to_owned);
    let blocked_context = args.blocked_context;

    store
        .call(move |db| {
            let gate_ids = db.list_gate_ids_with_evaluations(&run_id_owned)?;
            let mut state = HashMap::with_capacity(gate_ids.len());
            for gate_id in gate_ids {
                if let Some(eval) = db.get_latest_gate_evaluation(&run_id_owned, &gate_id)? {
                    state.insert(gate_id, eval.status);
                }
            }
            for gate_id in &required_gates {
                let passed = matches!(state.get(*gate_id), Some(GateStatus::Passed));
                if !passed {
                    return Ok((
                        GateCheckResult { all_passed: false, blocked_by: Some((*gate_id).to_string()) },
                        None,
                    ));
                }
            }

            let run = db
                .get_run(&run_id_owned)?
                .ok_or_else(|| anyhow::anyhow!(ConductorError::not_found(format!("run {run_id_owned}"))))?;

            if conductor_common::TERMINAL_PHASES.contains(&run.phase) {
                return Err(anyhow::anyhow!(ConductorError::conflict(format!(
                    "run {run_id_owned} is already in terminal phase {}",
                    run.phase
                ))));
            }

            let allowed = conductor_common::allowed_transitions(run.phase);
            if !allowed.contains(&to_phase) {
                return Err(anyhow::anyhow!(ConductorError::conflict(format!(
                    "invalid transition for run {run_id_owned}: {} -> {to_phase}",
                    run.phase
                ))));
            }

            let completed = conductor_common::TERMINAL_PHASES.contains(&to_phase);
            let blocked_context_col = if to_phase == Phase::Blocked { blocked_context.as_ref() } else { None };
            let blocked_reason_col = if to_phase == Phase::Blocked { blocked_reason.as_deref() } else { None };

            let updated = db.update_run_phase(
                &run_id_owned,
                to_phase,
                step.as_deref(),
                result.as_deref(),
                reason.as_deref(),
                blocked_reason_col,
                blocked_context_col,
                completed,
            )?;

            let payload = serde_json::json!({
                "runId": run_id_owned.as_str(),
                "fromPhase": run.phase.as_str(),
                "toPhase": to_phase.as_str(),
                "triggeredBy": triggered_by,
                "reason": reason,
            });
            let idempotency_key =
                format!("run.phase_changed:{run_id_owned}:{}:{}", run.last_event_sequence + 1, to_phase.as_str());
            let event = db
                .create_event(
                    &updated.project_id,
                    Some(&run_id_owned),
                    "run.phase_changed",
                    EventClass::Decision,
                    &payload,
                    &idempotency_key,
                    "runs",
                )?
                .ok_or_else(|| anyhow::anyhow!("run.phase_changed event unexpectedly deduplicated"))?;

            Ok((GateCheckResult { all_passed: true, blocked_by: None }, Some((updated, event))))
        })
        .await
        .map_err(runs::downcast_conductor_error)
}

/// Required-gate-per-phase-exit table consulted by `evaluate_gates_and_transition`'s
/// callers (§4.8). Kept as plain functions rather than a lookup map since each exit has
/// its own transition target and blocked-context shape (§4.9).
pub mod required_gates {
    pub const APPROVE_PLAN: &[&str] = &["plan_approval"];
    pub const EXECUTING_TO_REVIEW: &[&str] = &["tests_pass"];
    pub const REVIEW_TO_COMPLETED: &[&str] = &["code_review", "merge_wait"];
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::{ActorType, EventClass};

    async fn seed_run_awaiting_approval(store: &StoreHandle) -> RunId {
        store
            .call(|db| {
                let user = db.upsert_user_by_forge_id(1, "octocat", "t")?;
                let project = db.create_project(&user.id, 1, 2, "main", (20000, 20010))?;
                let repo = db.create_repo(&project.id, 3, "node", "octocat", "hello", "main")?;
                let task = db.upsert_task(&project.id, &repo.id, 10, "node_1", "fix bug", "body", "open", &[])?;
                let run = db.create_run(&task, "main")?;
                db.update_run_phase(&run.id, Phase::Planning, None, None, None, None, None, false)?;
                let updated =
                    db.update_run_phase(&run.id, Phase::AwaitingPlanApproval, None, None, None, None, None, false)?;
                Ok(updated.id)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn built_in_definitions_are_seeded_idempotently() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        ensure_built_in_gate_definitions(&store).await.unwrap();
        ensure_built_in_gate_definitions(&store).await.unwrap();
        let defs = store.call(|db| db.list_gate_definitions()).await.unwrap();
        assert_eq!(defs.len(), 4);
    }

    #[tokio::test]
    async fn transition_is_blocked_when_required_gate_is_not_passed() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let run_id = seed_run_awaiting_approval(&store).await;
        let (result, updated) = evaluate_gates_and_transition(
            &store,
            &run_id,
            required_gates::APPROVE_PLAN,
            Phase::Executing,
            TransitionArgs::default(),
        )
        .await
        .unwrap();
        assert!(!result.all_passed);
        assert_eq!(result.blocked_by.as_deref(), Some("plan_approval"));
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn transition_proceeds_once_required_gate_passes() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let run_id = seed_run_awaiting_approval(&store).await;
        let event = store
            .call({
                let run_id = run_id.clone();
                move |db| {
                    let project_id = db.get_run(&run_id)?.unwrap().project_id;
                    Ok(db
                        .create_event(&project_id, Some(&run_id), "gate.evaluated", EventClass::Gate, &Value::Null, "k1", "gates")?
                        .unwrap())
                }
            })
            .await
            .unwrap();
        record_gate_evaluation(
            &store,
            &run_id,
            "plan_approval",
            GateKind::Human,
            GateStatus::Passed,
            None,
            None,
            event.id,
            event.sequence,
            None,
        )
        .await
        .unwrap();

        let (result, updated) = evaluate_gates_and_transition(
            &store,
            &run_id,
            required_gates::APPROVE_PLAN,
            Phase::Executing,
            TransitionArgs { triggered_by: Some("user_1"), ..Default::default() },
        )
        .await
        .unwrap();
        assert!(result.all_passed);
        assert_eq!(updated.unwrap().0.phase, Phase::Executing);
    }

    #[tokio::test]
    async fn runs_awaiting_gates_includes_blocked_and_awaiting_approval() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let run_id = seed_run_awaiting_approval(&store).await;
        let project_id = store.call({
            let run_id = run_id.clone();
            move |db| Ok(db.get_run(&run_id)?.unwrap().project_id)
        }).await.unwrap();
        let awaiting = get_runs_awaiting_gates(&store, &project_id).await.unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].id, run_id);
        let _ = ActorType::Human;
    }
}
