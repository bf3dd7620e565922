//! Operator-action dispatcher (§4.9): approve_plan, revise_plan, reject_run, retry,
//! grant_policy_exception, deny_policy_exception, cancel. Each precondition, gate
//! check, and audit-ordering rule follows the per-action contract in the design doc.

use conductor_common::{ActorType, OverrideScope, Phase, RunId};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::errors::ConductorError;
use crate::events::EventBus;
use crate::gates::{self, required_gates};
use crate::queue::QueueAdapter;
use crate::runs::{self, TransitionArgs, blocked_reason, downcast_conductor_error};
use crate::store::StoreHandle;
use crate::store::models::Run;

const MAX_PLAN_REVISIONS: i64 = 3;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ApprovePlan,
    RevisePlan,
    RejectRun,
    Retry,
    GrantPolicyException,
    DenyPolicyException,
    Cancel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionRequest {
    pub action: ActionKind,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub justification: Option<String>,
    #[serde(default)]
    pub scope: Option<OverrideScope>,
}

/// `POST /runs/{runId}/actions` (§6, §4.9). `actor_id` is the authenticated caller.
pub async fn dispatch(
    store: &StoreHandle,
    queue: &dyn QueueAdapter,
    events: &EventBus,
    run_id: &RunId,
    actor_id: &str,
    req: ActionRequest,
) -> Result<Run, ConductorError> {
    match req.action {
        ActionKind::ApprovePlan => approve_plan(store, events, run_id, actor_id).await,
        ActionKind::RevisePlan => revise_plan(store, events, run_id, actor_id, req.comment).await,
        ActionKind::RejectRun => reject_run(store, queue, events, run_id, actor_id, req.comment).await,
        ActionKind::Retry => retry(store, queue, run_id, actor_id).await,
        ActionKind::GrantPolicyException => {
            grant_policy_exception(store, events, run_id, actor_id, req.justification, req.scope).await
        }
        ActionKind::DenyPolicyException => deny_policy_exception(store, queue, events, run_id, actor_id, req.comment).await,
        ActionKind::Cancel => cancel(store, queue, run_id, actor_id).await,
    }
}

async fn get_run(store: &StoreHandle, run_id: &RunId) -> Result<Run, ConductorError> {
    let run_id = run_id.clone();
    store
        .call(move |db| db.get_run(&run_id)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found(format!("run {run_id}")))))
        .await
        .map_err(downcast_conductor_error)
}

fn require_phase(run: &Run, expected: Phase) -> Result<(), ConductorError> {
    if run.phase != expected {
        return Err(ConductorError::conflict(format!(
            "run {} is in phase {}, expected {expected}",
            run.id, run.phase
        )));
    }
    Ok(())
}

fn require_comment(comment: &Option<String>, action: &str) -> Result<String, ConductorError> {
    match comment.as_ref().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        Some(c) => Ok(c.to_string()),
        None => Err(ConductorError::validation(format!("{action} requires a comment"))),
    }
}

async fn record_action(
    store: &StoreHandle,
    run_id: &RunId,
    actor_id: &str,
    action_kind: &'static str,
    comment: Option<String>,
    from_phase: Phase,
    to_phase: Option<Phase>,
) -> Result<(), ConductorError> {
    let run_id = run_id.clone();
    let actor_id = actor_id.to_string();
    store
        .call(move |db| {
            db.record_operator_action(&run_id, &actor_id, ActorType::Human, action_kind, comment.as_deref(), from_phase, to_phase)?;
            Ok(())
        })
        .await
        .map_err(downcast_conductor_error)
}

/// Gate-checked transition out of `awaiting_plan_approval` (§4.9 scenario S2).
async fn approve_plan(store: &StoreHandle, events: &EventBus, run_id: &RunId, actor_id: &str) -> Result<Run, ConductorError> {
    let run = get_run(store, run_id).await?;
    require_phase(&run, Phase::AwaitingPlanApproval)?;

    let (check, outcome) = gates::evaluate_gates_and_transition(
        store,
        run_id,
        required_gates::APPROVE_PLAN,
        Phase::Executing,
        TransitionArgs { step: Some("implementer_apply_changes"), triggered_by: Some(actor_id), ..Default::default() },
    )
    .await?;

    let Some((updated, event)) = outcome else {
        let gate = check.blocked_by.unwrap_or_default();
        return Err(ConductorError::conflict(format!("Gate '{gate}' is not passed — cannot approve")));
    };
    events.publish(event).await;

    record_action(store, run_id, actor_id, "approve_plan", None, Phase::AwaitingPlanApproval, Some(Phase::Executing)).await?;

    let run_id = run_id.clone();
    let payload = json!({"action": "mirror_approval_decision", "decision": "approved"});
    store
        .call(move |db| {
            db.insert_github_write(&run_id, "mirror_approval_decision", None, &format!("mirror_approval:{run_id}:approved"), &payload)?;
            Ok(())
        })
        .await
        .map_err(downcast_conductor_error)?;

    Ok(updated)
}

/// `revise_plan` (§4.9): blocks for `retry_limit_exceeded` at three revisions.
async fn revise_plan(
    store: &StoreHandle,
    events: &EventBus,
    run_id: &RunId,
    actor_id: &str,
    comment: Option<String>,
) -> Result<Run, ConductorError> {
    let comment = require_comment(&comment, "revise_plan")?;
    let run = get_run(store, run_id).await?;
    require_phase(&run, Phase::AwaitingPlanApproval)?;

    record_action(store, run_id, actor_id, "revise_plan", Some(comment), Phase::AwaitingPlanApproval, None).await?;

    let run_id_clone = run_id.clone();
    let revisions = store
        .call(move |db| db.increment_plan_revisions(&run_id_clone))
        .await
        .map_err(downcast_conductor_error)?;

    if revisions >= MAX_PLAN_REVISIONS {
        let (updated, event) = runs::transition_phase(
            store,
            run_id,
            Phase::Blocked,
            TransitionArgs {
                triggered_by: Some(actor_id),
                blocked_reason: Some(blocked_reason::RETRY_LIMIT_EXCEEDED),
                blocked_context: Some(json!({"prior_phase": Phase::AwaitingPlanApproval.as_str(), "revisions": revisions})),
                ..Default::default()
            },
        )
        .await?;
        events.publish(event).await;
        return Ok(updated);
    }

    let (updated, event) = runs::transition_phase(
        store,
        run_id,
        Phase::Planning,
        TransitionArgs { step: Some("planner_create_plan"), triggered_by: Some(actor_id), ..Default::default() },
    )
    .await?;
    events.publish(event).await;
    Ok(updated)
}

/// `reject_run` (§4.9): transitions to `cancelled` and schedules worktree cleanup.
async fn reject_run(
    store: &StoreHandle,
    queue: &dyn QueueAdapter,
    events: &EventBus,
    run_id: &RunId,
    actor_id: &str,
    comment: Option<String>,
) -> Result<Run, ConductorError> {
    let comment = require_comment(&comment, "reject_run")?;
    let run = get_run(store, run_id).await?;
    require_phase(&run, Phase::AwaitingPlanApproval)?;

    record_action(store, run_id, actor_id, "reject_run", Some(comment), Phase::AwaitingPlanApproval, Some(Phase::Cancelled)).await?;

    let (updated, event) = runs::transition_phase(
        store,
        run_id,
        Phase::Cancelled,
        TransitionArgs { triggered_by: Some(actor_id), result: Some("cancelled"), ..Default::default() },
    )
    .await?;
    events.publish(event).await;

    enqueue_worktree_cleanup(queue, run_id).await?;
    Ok(updated)
}

/// `retry` (§4.9): enqueue-before-audit, the one action where the audit row is only
/// written once the job is safely queued.
async fn retry(store: &StoreHandle, queue: &dyn QueueAdapter, run_id: &RunId, actor_id: &str) -> Result<Run, ConductorError> {
    let run = get_run(store, run_id).await?;
    require_phase(&run, Phase::Blocked)?;

    let job_id = format!("run-retry-{run_id}-{}", run.updated_at.timestamp());
    queue
        .add_job("runs", &job_id, json!({"runId": run_id.as_str(), "action": "resume", "triggeredBy": actor_id}))
        .await
        .map_err(ConductorError::Internal)?;

    record_action(store, run_id, actor_id, "retry", None, Phase::Blocked, None).await?;
    Ok(run)
}

/// `grant_policy_exception` (§4.9): records the override and clears the blocked state
/// in one transaction, returning the run to the phase it was blocked from.
async fn grant_policy_exception(
    store: &StoreHandle,
    events: &EventBus,
    run_id: &RunId,
    actor_id: &str,
    justification: Option<String>,
    scope: Option<OverrideScope>,
) -> Result<Run, ConductorError> {
    let justification = match justification.as_ref().map(|j| j.trim()).filter(|j| !j.is_empty()) {
        Some(j) => j.to_string(),
        None => return Err(ConductorError::validation("grant_policy_exception requires a justification")),
    };
    let scope = scope.unwrap_or(OverrideScope::ThisRun);

    let run = get_run(store, run_id).await?;
    require_phase(&run, Phase::Blocked)?;
    if run.blocked_reason.as_deref() != Some(blocked_reason::POLICY_EXCEPTION_REQUIRED) {
        return Err(ConductorError::conflict(format!(
            "run {run_id} is not blocked on a policy exception"
        )));
    }

    let context = run.blocked_context.clone().unwrap_or(Value::Null);
    let prior_phase = context
        .get("prior_phase")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Phase>().ok())
        .ok_or_else(|| ConductorError::validation("blocked_context missing prior_phase"))?;
    let policy_id = context
        .get("policy_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ConductorError::validation("blocked_context missing policy_id"))?
        .to_string();
    let constraint_kind = context
        .get("constraint_kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ConductorError::validation("blocked_context missing constraint_kind"))?
        .to_string();
    let constraint_value = context.get("constraint_value").and_then(Value::as_str).unwrap_or_default().to_string();
    let constraint_hash = context.get("constraint_hash").and_then(Value::as_str).unwrap_or_default().to_string();

    record_action(store, run_id, actor_id, "grant_policy_exception", None, Phase::Blocked, Some(prior_phase)).await?;

    let run_id_owned = run_id.clone();
    let actor_id_owned = actor_id.to_string();
    store
        .call(move |db| {
            db.create_override(
                &run_id_owned,
                "policy_exception",
                scope,
                &constraint_kind,
                &constraint_value,
                &constraint_hash,
                &policy_id,
                &actor_id_owned,
                &justification,
            )?;
            Ok(())
        })
        .await
        .map_err(downcast_conductor_error)?;

    let (updated, event) = runs::transition_phase(
        store,
        run_id,
        prior_phase,
        TransitionArgs { triggered_by: Some(actor_id), ..Default::default() },
    )
    .await?;
    events.publish(event).await;

    let run_id_for_outbox = run_id.clone();
    let payload = json!({"action": "mirror_policy_exception_grant"});
    store
        .call(move |db| {
            db.insert_github_write(
                &run_id_for_outbox,
                "mirror_policy_exception_grant",
                None,
                &format!("mirror_policy_grant:{run_id_for_outbox}"),
                &payload,
            )?;
            Ok(())
        })
        .await
        .map_err(downcast_conductor_error)?;

    Ok(updated)
}

/// `deny_policy_exception` (§4.9): same preconditions as granting, but cancels the run.
async fn deny_policy_exception(
    store: &StoreHandle,
    queue: &dyn QueueAdapter,
    events: &EventBus,
    run_id: &RunId,
    actor_id: &str,
    comment: Option<String>,
) -> Result<Run, ConductorError> {
    let comment = require_comment(&comment, "deny_policy_exception")?;
    let run = get_run(store, run_id).await?;
    require_phase(&run, Phase::Blocked)?;
    if run.blocked_reason.as_deref() != Some(blocked_reason::POLICY_EXCEPTION_REQUIRED) {
        return Err(ConductorError::conflict(format!(
            "run {run_id} is not blocked on a policy exception"
        )));
    }

    record_action(store, run_id, actor_id, "deny_policy_exception", Some(comment), Phase::Blocked, Some(Phase::Cancelled)).await?;

    let (updated, event) = runs::transition_phase(
        store,
        run_id,
        Phase::Cancelled,
        TransitionArgs { triggered_by: Some(actor_id), result: Some("cancelled"), ..Default::default() },
    )
    .await?;
    events.publish(event).await;

    enqueue_worktree_cleanup(queue, run_id).await?;
    Ok(updated)
}

/// `cancel` (§4.9): enqueue-before-audit. The worker owns the actual transition and
/// cleanup once it dequeues the job; this only records intent.
async fn cancel(store: &StoreHandle, queue: &dyn QueueAdapter, run_id: &RunId, actor_id: &str) -> Result<Run, ConductorError> {
    let run = get_run(store, run_id).await?;
    if run.phase.is_terminal() {
        return Err(ConductorError::conflict(format!("run {run_id} is already in a terminal phase")));
    }

    let job_id = format!("run-cancel-{run_id}");
    queue
        .add_job("runs", &job_id, json!({"runId": run_id.as_str(), "action": "cancel", "triggeredBy": actor_id}))
        .await
        .map_err(ConductorError::Internal)?;

    record_action(store, run_id, actor_id, "cancel", None, run.phase, None).await?;
    Ok(run)
}

async fn enqueue_worktree_cleanup(queue: &dyn QueueAdapter, run_id: &RunId) -> Result<(), ConductorError> {
    queue
        .add_job("cleanup", &format!("cleanup:worktree:{run_id}"), json!({"type": "worktree", "targetId": run_id.as_str()}))
        .await
        .map_err(ConductorError::Internal)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SqliteQueue;
    use conductor_common::GateStatus;

    async fn seed_run_awaiting_approval(store: &StoreHandle) -> RunId {
        store
            .call(|db| {
                let user = db.upsert_user_by_forge_id(1, "octocat", "t")?;
                let project = db.create_project(&user.id, 1, 2, "main", (20000, 20010))?;
                let repo = db.create_repo(&project.id, 3, "node", "octocat", "hello", "main")?;
                let task = db.upsert_task(&project.id, &repo.id, 10, "node_1", "fix bug", "body", "open", &[])?;
                let run = db.create_run(&task, "main")?;
                db.update_run_phase(&run.id, Phase::Planning, None, None, None, None, None, false)?;
                let updated = db.update_run_phase(&run.id, Phase::AwaitingPlanApproval, None, None, None, None, None, false)?;
                Ok(updated.id)
            })
            .await
            .unwrap()
    }

    async fn pass_plan_approval_gate(store: &StoreHandle, run_id: &RunId) {
        store
            .call({
                let run_id = run_id.clone();
                move |db| {
                    let project_id = db.get_run(&run_id)?.unwrap().project_id;
                    let event = db
                        .create_event(&project_id, Some(&run_id), "gate.evaluated", conductor_common::EventClass::Gate, &Value::Null, "gate-k1", "gates")?
                        .unwrap();
                    db.create_gate_evaluation(&run_id, "plan_approval", conductor_common::GateKind::Human, GateStatus::Passed, None, None, &event.id, event.sequence, None)?;
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn approve_plan_fails_with_409_when_gate_not_passed() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let run_id = seed_run_awaiting_approval(&store).await;
        let result = approve_plan(&store, &events, &run_id, "user_1").await;
        match result {
            Err(ConductorError::Conflict(msg)) => assert!(msg.contains("plan_approval")),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn approve_plan_transitions_and_records_outbox_write_once_gate_passes() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let run_id = seed_run_awaiting_approval(&store).await;
        pass_plan_approval_gate(&store, &run_id).await;
        let run = approve_plan(&store, &events, &run_id, "user_1").await.unwrap();
        assert_eq!(run.phase, Phase::Executing);
        let actions = store.call({
            let run_id = run_id.clone();
            move |db| db.list_operator_actions_for_run(&run_id)
        }).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_kind, "approve_plan");
    }

    #[tokio::test]
    async fn revise_plan_blocks_after_three_revisions() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let run_id = seed_run_awaiting_approval(&store).await;

        for _ in 0..2 {
            let run = revise_plan(&store, &events, &run_id, "user_1", Some("try again".into())).await.unwrap();
            assert_eq!(run.phase, Phase::Planning);
            store
                .call({
                    let run_id = run_id.clone();
                    move |db| db.update_run_phase(&run_id, Phase::AwaitingPlanApproval, None, None, None, None, None, false)
                })
                .await
                .unwrap();
        }
        let run = revise_plan(&store, &events, &run_id, "user_1", Some("one more".into())).await.unwrap();
        assert_eq!(run.phase, Phase::Blocked);
        assert_eq!(run.blocked_reason.as_deref(), Some(blocked_reason::RETRY_LIMIT_EXCEEDED));
    }

    #[tokio::test]
    async fn revise_plan_requires_a_comment() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let run_id = seed_run_awaiting_approval(&store).await;
        let result = revise_plan(&store, &events, &run_id, "user_1", None).await;
        assert!(matches!(result, Err(ConductorError::Validation(_))));
    }

    #[tokio::test]
    async fn cancel_enqueues_before_recording_the_audit_row() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let queue = SqliteQueue::new(store.clone());
        let run_id = seed_run_awaiting_approval(&store).await;
        cancel(&store, &queue, &run_id, "user_1").await.unwrap();
        let job = store.call({
            let run_id = run_id.clone();
            move |db| db.get_job("runs", &format!("run-cancel-{run_id}"))
        }).await.unwrap();
        assert!(job.is_some());
        let actions = store.call({
            let run_id = run_id.clone();
            move |db| db.list_operator_actions_for_run(&run_id)
        }).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_kind, "cancel");
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_runs() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let queue = SqliteQueue::new(store.clone());
        let run_id = seed_run_awaiting_approval(&store).await;
        store
            .call({
                let run_id = run_id.clone();
                move |db| db.update_run_phase(&run_id, Phase::Cancelled, None, None, None, None, None, true)
            })
            .await
            .unwrap();
        let result = cancel(&store, &queue, &run_id, "user_1").await;
        assert!(matches!(result, Err(ConductorError::Conflict(_))));
    }

    #[tokio::test]
    async fn grant_policy_exception_requires_policy_blocked_reason() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let run_id = seed_run_awaiting_approval(&store).await;
        store
            .call({
                let run_id = run_id.clone();
                move |db| {
                    db.update_run_phase(
                        &run_id,
                        Phase::Blocked,
                        None,
                        None,
                        None,
                        Some(blocked_reason::GATE_FAILED),
                        None,
                        false,
                    )
                }
            })
            .await
            .unwrap();
        let result = grant_policy_exception(&store, &events, &run_id, "user_1", Some("justified".into()), None).await;
        assert!(matches!(result, Err(ConductorError::Conflict(_))));
    }

    #[tokio::test]
    async fn grant_policy_exception_clears_block_and_restores_prior_phase() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let run_id = seed_run_awaiting_approval(&store).await;
        store
            .call({
                let run_id = run_id.clone();
                move |db| {
                    db.update_run_phase(
                        &run_id,
                        Phase::Blocked,
                        None,
                        None,
                        None,
                        Some(blocked_reason::POLICY_EXCEPTION_REQUIRED),
                        Some(&json!({
                            "prior_phase": "executing",
                            "policy_id": "policy_1",
                            "constraint_kind": "max_file_changes",
                            "constraint_value": "50",
                            "constraint_hash": "hash_a",
                        })),
                        false,
                    )
                }
            })
            .await
            .unwrap();
        let run = grant_policy_exception(&store, &events, &run_id, "user_1", Some("one-off, approved by lead".into()), None)
            .await
            .unwrap();
        assert_eq!(run.phase, Phase::Executing);
        let active = store
            .call({
                let run_id = run_id.clone();
                move |db| db.find_active_override(&run_id, "max_file_changes", "hash_a")
            })
            .await
            .unwrap();
        assert!(active.is_some());
    }
}
