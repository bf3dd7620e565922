//! Run phase state machine (§4.7).

use conductor_common::{EventClass, Phase, RunId, allowed_transitions};
use serde_json::Value;

use crate::errors::ConductorError;
use crate::store::StoreHandle;
use crate::store::models::{Event, Run};

/// Reasons a run may enter `blocked` (§4.7). Kept as `&'static str` rather than a
/// `conductor_common` string enum — callers compose these with cause-specific context
/// that does not belong in a shared domain crate.
pub mod blocked_reason {
    pub const GATE_FAILED: &str = "gate_failed";
    pub const POLICY_EXCEPTION_REQUIRED: &str = "policy_exception_required";
    pub const RETRY_LIMIT_EXCEEDED: &str = "retry_limit_exceeded";
    pub const ENQUEUE_FAILED: &str = "enqueue_failed";
    pub const AGENT_ERROR: &str = "agent_error";
}

#[derive(Debug, Clone, Default)]
pub struct TransitionArgs<'a> {
    pub step: Option<&'a str>,
    pub triggered_by: Option<&'a str>,
    pub reason: Option<&'a str>,
    pub result: Option<&'a str>,
    pub blocked_reason: Option<&'a str>,
    pub blocked_context: Option<Value>,
}

/// Applies a phase transition, atomically appending the `run.phase_changed` event in
/// the same transaction (§4.7). Fails closed: `InvalidTransition`/`RunNotFound`/
/// `AlreadyTerminal` all surface as `ConductorError::Conflict`/`NotFound`. Returns the
/// updated run alongside the event the transition recorded, so callers can fan it out
/// on `EventBus` after the transaction commits (§4.3).
pub async fn transition_phase(
    store: &StoreHandle,
    run_id: &RunId,
    to_phase: Phase,
    args: TransitionArgs<'_>,
) -> Result<(Run, Event), ConductorError> {
    let run_id = run_id.clone();
    let step = args.step.map(str::to_owned);
    let triggered_by = args.triggered_by.unwrap_or("system").to_owned();
    let reason = args.reason.map(str::to_owned);
    let result = args.result.map(str::to_owned);
    let blocked_reason = args.blocked_reason.map(str::to_owned);
    let blocked_context = args.blocked_context;

    store
        .call(move |db| {
            let run = db
                .get_run(&run_id)?
                .ok_or_else(|| anyhow::anyhow!(ConductorError::not_found(format!("run {run_id}"))))?;

            if conductor_common::TERMINAL_PHASES.contains(&run.phase) {
                return Err(anyhow::anyhow!(ConductorError::conflict(format!(
                    "run {run_id} is already in terminal phase {}",
                    run.phase
                ))));
            }

            let allowed = allowed_transitions(run.phase);
            if !allowed.contains(&to_phase) {
                return Err(anyhow::anyhow!(ConductorError::conflict(format!(
                    "invalid transition for run {run_id}: {} -> {to_phase}",
                    run.phase
                ))));
            }

            let completed = conductor_common::TERMINAL_PHASES.contains(&to_phase);
            let blocked_context_col = if to_phase == Phase::Blocked { blocked_context.as_ref() } else { None };
            let blocked_reason_col = if to_phase == Phase::Blocked { blocked_reason.as_deref() } else { None };

            let updated = db.update_run_phase(
                &run_id,
                to_phase,
                step.as_deref(),
                result.as_deref(),
                reason.as_deref(),
                blocked_reason_col,
                blocked_context_col,
                completed,
            )?;

            let payload = serde_json::json!({
                "runId": run_id.as_str(),
                "fromPhase": run.phase.as_str(),
                "toPhase": to_phase.as_str(),
                "triggeredBy": triggered_by,
                "reason": reason,
            });
            let idempotency_key = format!("run.phase_changed:{run_id}:{}:{}", run.last_event_sequence + 1, to_phase.as_str());
            let event = db
                .create_event(
                    &updated.project_id,
                    Some(&run_id),
                    "run.phase_changed",
                    EventClass::Decision,
                    &payload,
                    &idempotency_key,
                    "runs",
                )?
                .ok_or_else(|| anyhow::anyhow!("run.phase_changed event unexpectedly deduplicated"))?;

            Ok((updated, event))
        })
        .await
        .map_err(downcast_conductor_error)
}

/// `store.call`'s closure returns `anyhow::Result`; callers that want to fail with a
/// specific `ConductorError` wrap it with `anyhow::anyhow!(ConductorError::...)` and
/// this helper recovers the typed error on the way out, defaulting to `Internal`.
pub(crate) fn downcast_conductor_error(err: anyhow::Error) -> ConductorError {
    match err.downcast::<ConductorError>() {
        Ok(typed) => typed,
        Err(err) => ConductorError::Internal(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::Phase;

    async fn seed_run(store: &StoreHandle) -> (RunId, conductor_common::ProjectId) {
        store
            .call(|db| {
                let user = db.upsert_user_by_forge_id(1, "octocat", "t")?;
                let project = db.create_project(&user.id, 1, 2, "main", (20000, 20010))?;
                let repo = db.create_repo(&project.id, 3, "node", "octocat", "hello", "main")?;
                let task = db.upsert_task(&project.id, &repo.id, 10, "node_1", "fix bug", "body", "open", &[])?;
                let run = db.create_run(&task, "main")?;
                Ok((run.id, project.id))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn valid_transition_updates_phase_and_emits_event() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let (run_id, _project_id) = seed_run(&store).await;
        let (updated, event) = transition_phase(&store, &run_id, Phase::Planning, TransitionArgs::default())
            .await
            .unwrap();
        assert_eq!(updated.phase, Phase::Planning);
        assert_eq!(event.event_type, "run.phase_changed");
        assert_eq!(event.run_id.as_ref(), Some(&run_id));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let (run_id, _) = seed_run(&store).await;
        // A fresh run starts `pending`; it cannot jump straight to `awaiting_review`
        // without passing through `planning`/`executing` first.
        let result = transition_phase(&store, &run_id, Phase::AwaitingReview, TransitionArgs::default()).await;
        assert!(matches!(result, Err(ConductorError::Conflict(_))));
    }

    #[tokio::test]
    async fn pending_may_transition_straight_to_completed_on_early_failure() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let (run_id, _) = seed_run(&store).await;
        let (updated, _event) = transition_phase(&store, &run_id, Phase::Completed, TransitionArgs::default())
            .await
            .unwrap();
        assert_eq!(updated.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn transition_out_of_terminal_phase_fails() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let (run_id, _) = seed_run(&store).await;
        transition_phase(&store, &run_id, Phase::Cancelled, TransitionArgs::default()).await.unwrap();
        let result = transition_phase(&store, &run_id, Phase::Planning, TransitionArgs::default()).await;
        assert!(matches!(result, Err(ConductorError::Conflict(_))));
    }

    #[tokio::test]
    async fn unknown_run_returns_not_found() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let result = transition_phase(&store, &RunId::new(), Phase::Planning, TransitionArgs::default()).await;
        assert!(matches!(result, Err(ConductorError::NotFound(_))));
    }
}
