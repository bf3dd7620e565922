//! Worker loop consuming all five job queues (§4.11).
//!
//! One process, five `QueueAdapter::create_worker` consumers, one `WorkerContext`
//! shared (cloned, all fields are cheap handles) across every handler closure —
//! mirroring the teacher's single `Arc<AppState>` threaded through its job handlers.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use conductor_common::{AgentInvocationId, AgentInvocationStatus, GithubWriteId, Phase, RunId};
use serde_json::Value;

use crate::config::Config;
use crate::errors::ConductorError;
use crate::events::EventBus;
use crate::forge::{CreatePrRequest, ForgeClient};
use crate::queue::{JobHandler, QueueAdapter, WorkerHandle};
use crate::runs::{self, TransitionArgs};
use crate::store::StoreHandle;
use crate::webhook;
use crate::worktree;

const CLEANUP_CONCURRENCY: usize = 1;
const OLD_JOBS_COMPLETED_GRACE_DAYS: i64 = 7;
const OLD_JOBS_FAILED_GRACE_DAYS: i64 = 30;
const OLD_JOBS_LIMIT: usize = 500;

#[derive(Clone)]
struct WorkerContext {
    store: StoreHandle,
    queue: Arc<dyn QueueAdapter>,
    events: EventBus,
    forge: Arc<dyn ForgeClient>,
    config: Config,
}

/// The five running consumers. `stop` drains each in turn, matching `QueueAdapter::close`
/// contract's "waits for in-flight jobs" (§4.2, §4.11).
pub struct WorkerGroup {
    handles: Vec<WorkerHandle>,
}

impl WorkerGroup {
    pub async fn stop(self) {
        for handle in self.handles {
            handle.stop().await;
        }
    }
}

/// Registers the five `createWorker` consumers (§4.11 worker startup sequence — the
/// caller is expected to have already run `ensure_built_in_gate_definitions`,
/// `run_janitor`, and `recover_stuck_deliveries` before calling this).
pub fn start(
    store: StoreHandle,
    queue: Arc<dyn QueueAdapter>,
    events: EventBus,
    forge: Arc<dyn ForgeClient>,
    config: Config,
) -> WorkerGroup {
    let ctx = WorkerContext { store, queue: queue.clone(), events, forge, config: config.clone() };
    let concurrency = config.worker_concurrency;

    let handles = vec![
        queue.create_worker("webhooks", concurrency, webhooks_handler(ctx.clone())),
        queue.create_worker("runs", concurrency, runs_handler(ctx.clone())),
        queue.create_worker("agents", concurrency, agents_handler(ctx.clone())),
        queue.create_worker("cleanup", CLEANUP_CONCURRENCY, cleanup_handler(ctx.clone())),
        queue.create_worker("github_writes", concurrency, github_writes_handler(ctx)),
    ];
    WorkerGroup { handles }
}

fn webhooks_handler(ctx: WorkerContext) -> JobHandler {
    Arc::new(move |payload: Value| {
        let ctx = ctx.clone();
        Box::pin(async move { webhook::normalize_and_apply(&ctx.store, &ctx.events, payload).await })
    })
}

fn runs_handler(ctx: WorkerContext) -> JobHandler {
    Arc::new(move |payload: Value| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let run_id = RunId::from(
                payload.get("runId").and_then(Value::as_str).ok_or_else(|| ConductorError::validation("runs job missing runId"))?,
            );
            let action = payload.get("action").and_then(Value::as_str).unwrap_or_default();
            let triggered_by = payload.get("triggeredBy").and_then(Value::as_str).map(str::to_owned);
            match action {
                "start" => handle_run_start(&ctx, run_id).await,
                "cancel" => handle_run_cancel(&ctx, run_id, triggered_by).await,
                "timeout" => handle_run_timeout(&ctx, run_id).await,
                "resume" => {
                    tracing::info!(%run_id, "resume action is a stub in this revision; ignoring");
                    Ok(())
                }
                other => {
                    tracing::warn!(%run_id, action = other, "unknown runs job action; ignoring");
                    Ok(())
                }
            }
        })
    })
}

async fn current_phase(ctx: &WorkerContext, run_id: &RunId) -> Result<Phase, ConductorError> {
    let run_id = run_id.clone();
    ctx.store
        .call(move |db| db.get_run(&run_id)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found(format!("run {run_id}")))))
        .await
        .map(|run| run.phase)
        .map_err(runs::downcast_conductor_error)
}

/// `start` (§4.11): idempotent on an existing active worktree, clones/fetches the repo,
/// checks out a worktree, and advances `pending -> planning`. Any failure along the way
/// is terminal for the run — `markRunFailed` sets `completed`/`failure`, it is not retried.
async fn handle_run_start(ctx: &WorkerContext, run_id: RunId) -> Result<(), ConductorError> {
    let phase = current_phase(ctx, &run_id).await?;
    if phase.is_terminal() {
        return Ok(());
    }
    if worktree::get_worktree_for_run(&ctx.store, &run_id).await?.is_some() {
        if phase == Phase::Pending {
            advance_pending_to_planning(ctx, &run_id).await?;
        }
        return Ok(());
    }

    if let Err(err) = run_start_inner(ctx, &run_id).await {
        tracing::warn!(%run_id, error = %err, "run start failed; marking run failed");
        mark_run_failed(ctx, &run_id, &err.to_string()).await?;
    }
    Ok(())
}

async fn run_start_inner(ctx: &WorkerContext, run_id: &RunId) -> Result<(), ConductorError> {
    let run_id_for_fetch = run_id.clone();
    let run = ctx
        .store
        .call(move |db| db.get_run(&run_id_for_fetch)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found("run"))))
        .await
        .map_err(runs::downcast_conductor_error)?;
    let project_id = run.project_id.clone();
    let repo_id = run.repo_id.clone();
    let project = ctx
        .store
        .call(move |db| db.get_project(&project_id)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found("project"))))
        .await
        .map_err(runs::downcast_conductor_error)?;
    let repo_id_for_fetch = repo_id.clone();
    let repo = ctx
        .store
        .call(move |db| db.get_repo(&repo_id_for_fetch)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found("repo"))))
        .await
        .map_err(runs::downcast_conductor_error)?;

    let app_id = ctx.config.github_app_id.clone().ok_or_else(|| ConductorError::PermanentExternal("GITHUB_APP_ID is not configured".into()))?;
    let private_key = ctx
        .config
        .github_private_key
        .clone()
        .ok_or_else(|| ConductorError::PermanentExternal("GITHUB_PRIVATE_KEY is not configured".into()))?;
    let installation_token = ctx
        .forge
        .fetch_installation_token(&app_id, &private_key, project.forge_installation_id)
        .await?;

    let bare_path = worktree::bare_repo_path(&ctx.config.repo_store_dir, &repo.owner, &repo.name);
    worktree::clone_or_fetch_repo(
        ctx.config.repo_store_dir.clone(),
        repo.owner.clone(),
        repo.name.clone(),
        installation_token,
    )
    .await?;

    let base_commit = worktree::resolve_branch_head(bare_path.clone(), run.base_branch.clone()).await?;
    let branch_name = format!("conductor/{}", run.id);
    let worktree_path: PathBuf = ctx.config.repo_store_dir.join(project.id.as_str()).join(repo.id.as_str()).join(run.id.as_str());

    worktree::create_worktree(
        &ctx.store,
        bare_path,
        worktree_path,
        run.id.clone(),
        run.project_id.clone(),
        run.repo_id.clone(),
        branch_name.clone(),
        base_commit.clone(),
        1,
    )
    .await?;

    {
        let run_id = run.id.clone();
        let branch_name = branch_name.clone();
        let base_commit = base_commit.clone();
        ctx.store
            .call(move |db| db.set_run_branch_and_commit(&run_id, &branch_name, &base_commit))
            .await
            .map_err(runs::downcast_conductor_error)?;
    }

    advance_pending_to_planning(ctx, run_id).await
}

async fn advance_pending_to_planning(ctx: &WorkerContext, run_id: &RunId) -> Result<(), ConductorError> {
    let (_updated, event) = runs::transition_phase(
        &ctx.store,
        run_id,
        Phase::Planning,
        TransitionArgs { step: Some("planner_create_plan"), triggered_by: Some("worker"), ..Default::default() },
    )
    .await?;
    ctx.events.publish(event).await;
    Ok(())
}

/// Sets a run terminal with `result = failure` via whatever transition the current
/// phase permits; a run already in a terminal phase is left untouched.
async fn mark_run_failed(ctx: &WorkerContext, run_id: &RunId, reason: &str) -> Result<(), ConductorError> {
    let phase = current_phase(ctx, run_id).await?;
    if phase.is_terminal() {
        return Ok(());
    }
    let target = if conductor_common::allowed_transitions(phase).contains(&Phase::Completed) {
        Phase::Completed
    } else {
        Phase::Blocked
    };
    let (_updated, event) = runs::transition_phase(
        &ctx.store,
        run_id,
        target,
        TransitionArgs {
            triggered_by: Some("worker"),
            result: Some("failure"),
            reason: Some(reason),
            blocked_reason: if target == Phase::Blocked { Some(crate::runs::blocked_reason::AGENT_ERROR) } else { None },
            ..Default::default()
        },
    )
    .await?;
    ctx.events.publish(event).await;
    Ok(())
}

async fn handle_run_cancel(ctx: &WorkerContext, run_id: RunId, triggered_by: Option<String>) -> Result<(), ConductorError> {
    let phase = current_phase(ctx, &run_id).await?;
    if phase.is_terminal() {
        return Ok(());
    }
    let (_updated, event) = runs::transition_phase(
        &ctx.store,
        &run_id,
        Phase::Cancelled,
        TransitionArgs { triggered_by: triggered_by.as_deref().or(Some("worker")), result: Some("cancelled"), ..Default::default() },
    )
    .await?;
    ctx.events.publish(event).await;
    let _ = worktree::cleanup_worktree(&ctx.store, &run_id).await;
    Ok(())
}

async fn handle_run_timeout(ctx: &WorkerContext, run_id: RunId) -> Result<(), ConductorError> {
    let phase = current_phase(ctx, &run_id).await?;
    if phase.is_terminal() {
        return Ok(());
    }
    let (_updated, event) = runs::transition_phase(
        &ctx.store,
        &run_id,
        Phase::Completed,
        TransitionArgs { triggered_by: Some("worker"), result: Some("failure"), reason: Some("Run timed out"), ..Default::default() },
    )
    .await?;
    ctx.events.publish(event).await;
    let _ = worktree::cleanup_worktree(&ctx.store, &run_id).await;
    Ok(())
}

/// `agents` handler (§4.11): out of scope beyond persisting invocation lifecycle and
/// monotonic turn index. Actual agent execution is a documented stub (see DESIGN.md).
fn agents_handler(ctx: WorkerContext) -> JobHandler {
    Arc::new(move |payload: Value| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let run_id = RunId::from(
                payload.get("runId").and_then(Value::as_str).ok_or_else(|| ConductorError::validation("agents job missing runId"))?,
            );
            let agent = payload.get("agent").and_then(Value::as_str).unwrap_or("claude").to_string();
            let invocation_id = payload.get("invocationId").and_then(Value::as_str).map(AgentInvocationId::from);

            let invocation_id = match invocation_id {
                Some(id) => id,
                None => {
                    let agent = agent.clone();
                    let run_id = run_id.clone();
                    ctx.store
                        .call(move |db| db.create_agent_invocation(&run_id, &agent))
                        .await
                        .map_err(runs::downcast_conductor_error)?
                        .id
                }
            };

            let id = invocation_id.clone();
            ctx.store.call(move |db| db.advance_agent_turn(&id)).await.map_err(runs::downcast_conductor_error)?;

            // Invoking the agent process itself depends on the out-of-scope agent
            // runtime (§1); this marks the turn complete so the run state machine is
            // never left waiting on a collaborator this crate does not own.
            let id = invocation_id;
            ctx.store
                .call(move |db| db.set_agent_invocation_status(&id, AgentInvocationStatus::Completed))
                .await
                .map_err(runs::downcast_conductor_error)?;
            Ok(())
        })
    })
}

fn cleanup_handler(ctx: WorkerContext) -> JobHandler {
    Arc::new(move |payload: Value| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
            match kind {
                "worktree" => {
                    let run_id = RunId::from(
                        payload.get("targetId").and_then(Value::as_str).ok_or_else(|| ConductorError::validation("cleanup job missing targetId"))?,
                    );
                    worktree::cleanup_worktree(&ctx.store, &run_id).await?;
                    Ok(())
                }
                "expired_leases" => reap_expired_agent_invocations(&ctx).await,
                "old_jobs" => drain_old_jobs(&ctx).await,
                other => {
                    tracing::warn!(kind = other, "unknown cleanup job type; ignoring");
                    Ok(())
                }
            }
        })
    })
}

/// `agent_invocations` stuck `running` past a lease window are marked `timed_out`
/// (§4.11 `expired_leases`); the threshold mirrors the queue's own backoff ceiling.
async fn reap_expired_agent_invocations(ctx: &WorkerContext) -> Result<(), ConductorError> {
    let max_age = Duration::minutes(30);
    let expired = ctx.store.call(move |db| db.list_expired_agent_invocations(max_age)).await.map_err(runs::downcast_conductor_error)?;
    for invocation in expired {
        let id = invocation.id.clone();
        ctx.store
            .call(move |db| db.set_agent_invocation_status(&id, AgentInvocationStatus::TimedOut))
            .await
            .map_err(runs::downcast_conductor_error)?;
    }
    Ok(())
}

/// Drains completed/failed rows past their grace period from every queue (§4.2, §4.11).
/// `clean` returns at most `OLD_JOBS_LIMIT` ids per call, so each queue/status pair is
/// looped until a batch comes back smaller than the limit — a backlog larger than one
/// batch must not leave a remainder behind.
async fn drain_old_jobs(ctx: &WorkerContext) -> Result<(), ConductorError> {
    for queue_name in conductor_common::QueueName::ALL {
        loop {
            let removed = ctx
                .queue
                .clean(queue_name.as_str(), Duration::days(OLD_JOBS_COMPLETED_GRACE_DAYS), OLD_JOBS_LIMIT, "completed")
                .await
                .map_err(ConductorError::Internal)?;
            if removed.len() < OLD_JOBS_LIMIT {
                break;
            }
        }
        loop {
            let removed = ctx
                .queue
                .clean(queue_name.as_str(), Duration::days(OLD_JOBS_FAILED_GRACE_DAYS), OLD_JOBS_LIMIT, "failed")
                .await
                .map_err(ConductorError::Internal)?;
            if removed.len() < OLD_JOBS_LIMIT {
                break;
            }
        }
    }
    Ok(())
}

/// Outbox consumer (§4.4): acquires an installation token, executes the write against
/// the forge, and classifies the result. Transient failures throw so the queue retries
/// with backoff; permanent failures mark the write `failed` and return `Ok` — the job
/// itself must not be retried once application state already reflects the outcome.
fn github_writes_handler(ctx: WorkerContext) -> JobHandler {
    Arc::new(move |payload: Value| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let write_id = GithubWriteId::from(
                payload
                    .get("githubWriteId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ConductorError::validation("github_writes job missing githubWriteId"))?,
            );
            process_github_write(&ctx, write_id).await
        })
    })
}

async fn process_github_write(ctx: &WorkerContext, write_id: GithubWriteId) -> Result<(), ConductorError> {
    let write = {
        let write_id = write_id.clone();
        ctx.store
            .call(move |db| db.get_github_write(&write_id)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found("github_write"))))
            .await
            .map_err(runs::downcast_conductor_error)?
    };
    if !matches!(write.status, conductor_common::GithubWriteStatus::Pending) {
        return Ok(());
    }

    let run_id = write.run_id.clone();
    let run = ctx
        .store
        .call(move |db| db.get_run(&run_id)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found("run"))))
        .await
        .map_err(runs::downcast_conductor_error)?;
    let project_id = run.project_id.clone();
    let project = ctx
        .store
        .call(move |db| db.get_project(&project_id)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found("project"))))
        .await
        .map_err(runs::downcast_conductor_error)?;
    let repo_id = run.repo_id.clone();
    let repo = ctx
        .store
        .call(move |db| db.get_repo(&repo_id)?.ok_or_else(|| anyhow::anyhow!(ConductorError::not_found("repo"))))
        .await
        .map_err(runs::downcast_conductor_error)?;

    {
        let id = write_id.clone();
        ctx.store.call(move |db| db.mark_write_in_flight(&id)).await.map_err(runs::downcast_conductor_error)?;
    }

    let outcome = execute_write(ctx, &project, &repo, &run, &write).await;
    match outcome {
        Ok((result_id, result_url)) => {
            let id = write_id;
            ctx.store
                .call(move |db| db.mark_write_completed(&id, &result_id, &result_url))
                .await
                .map_err(runs::downcast_conductor_error)?;
            Ok(())
        }
        Err(ConductorError::TransientExternal(msg)) => {
            let id = write_id;
            ctx.store.call(move |db| db.increment_write_retry_count(&id, &msg)).await.map_err(runs::downcast_conductor_error)?;
            Err(ConductorError::TransientExternal(msg))
        }
        Err(err) => {
            let id = write_id;
            let message = err.to_string();
            ctx.store.call(move |db| db.mark_write_failed(&id, &message)).await.map_err(runs::downcast_conductor_error)?;
            Ok(())
        }
    }
}

async fn execute_write(
    ctx: &WorkerContext,
    project: &crate::store::models::Project,
    repo: &crate::store::models::Repo,
    run: &crate::store::models::Run,
    write: &crate::store::models::GithubWrite,
) -> Result<(String, String), ConductorError> {
    let app_id = ctx.config.github_app_id.clone().ok_or_else(|| ConductorError::PermanentExternal("GITHUB_APP_ID is not configured".into()))?;
    let private_key = ctx
        .config
        .github_private_key
        .clone()
        .ok_or_else(|| ConductorError::PermanentExternal("GITHUB_PRIVATE_KEY is not configured".into()))?;
    let token = ctx.forge.fetch_installation_token(&app_id, &private_key, project.forge_installation_id).await?;

    match write.kind.as_str() {
        "create_pr" => {
            let title = write.payload.get("title").and_then(Value::as_str).unwrap_or("Conductor run");
            let body = write.payload.get("body").and_then(Value::as_str).unwrap_or("");
            let head = run.branch.as_deref().ok_or_else(|| ConductorError::PermanentExternal("run has no branch to open a PR from".into()))?;
            let result = ctx
                .forge
                .create_pr(&token, &repo.owner, &repo.name, CreatePrRequest { title, body, head, base: &run.base_branch })
                .await?;
            Ok((result.id, result.url))
        }
        "post_comment" | "mirror_approval_decision" | "mirror_policy_exception_grant" => {
            let issue_number = write.payload.get("issueNumber").and_then(Value::as_i64).unwrap_or_default();
            let body = write
                .payload
                .get("body")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| write.kind.replace('_', " "));
            let result = ctx.forge.post_comment(&token, &repo.owner, &repo.name, issue_number, &body).await?;
            Ok((result.id, result.url))
        }
        other => Err(ConductorError::PermanentExternal(format!("unknown github_write kind '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::fake::FakeForgeClient;
    use crate::queue::SqliteQueue;
    use conductor_common::Phase;
    use std::time::Duration as StdDuration;

    fn test_config() -> Config {
        // SAFETY: test-only, single-threaded test process.
        unsafe {
            std::env::set_var("DATABASE_PATH", ":memory:");
        }
        Config::from_env().unwrap()
    }

    async fn seed_blocked_run(store: &StoreHandle) -> RunId {
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

    #[tokio::test]
    async fn cancel_job_transitions_run_and_is_idempotent_on_replay() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let ctx = WorkerContext {
            store: store.clone(),
            queue: Arc::new(SqliteQueue::new(store.clone())),
            events: EventBus::new(),
            forge: Arc::new(FakeForgeClient::new()),
            config: test_config(),
        };
        let run_id = seed_blocked_run(&store).await;
        handle_run_cancel(&ctx, run_id.clone(), Some("user_1".into())).await.unwrap();
        let run = store.call({ let run_id = run_id.clone(); move |db| db.get_run(&run_id) }).await.unwrap().unwrap();
        assert_eq!(run.phase, Phase::Cancelled);

        // A second delivery of the same job must not error even though the run is terminal.
        handle_run_cancel(&ctx, run_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn timeout_job_marks_run_completed_with_failure_result() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let ctx = WorkerContext {
            store: store.clone(),
            queue: Arc::new(SqliteQueue::new(store.clone())),
            events: EventBus::new(),
            forge: Arc::new(FakeForgeClient::new()),
            config: test_config(),
        };
        let run_id = seed_blocked_run(&store).await;
        handle_run_timeout(&ctx, run_id.clone()).await.unwrap();
        let run = store.call({ let run_id = run_id.clone(); move |db| db.get_run(&run_id) }).await.unwrap().unwrap();
        assert_eq!(run.phase, Phase::Completed);
        assert_eq!(run.result.as_deref(), Some("failure"));
    }

    #[tokio::test]
    async fn unknown_runs_action_is_ignored_not_errored() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let queue = SqliteQueue::new(store.clone());
        let handler = runs_handler(WorkerContext {
            store: store.clone(),
            queue: Arc::new(SqliteQueue::new(store.clone())),
            events: EventBus::new(),
            forge: Arc::new(FakeForgeClient::new()),
            config: test_config(),
        });
        let run_id = seed_blocked_run(&store).await;
        let worker = queue.create_worker("runs", 1, handler);
        queue
            .add_job("runs", "j1", serde_json::json!({"runId": run_id.as_str(), "action": "resume"}))
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        worker.stop().await;
        let run = store.call({ let run_id = run_id.clone(); move |db| db.get_run(&run_id) }).await.unwrap().unwrap();
        assert_eq!(run.phase, Phase::AwaitingPlanApproval);
    }

    #[tokio::test]
    async fn github_write_without_app_credentials_fails_permanently_not_retryably() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let ctx = WorkerContext {
            store: store.clone(),
            queue: Arc::new(SqliteQueue::new(store.clone())),
            events: EventBus::new(),
            forge: Arc::new(FakeForgeClient::new()),
            config: test_config(),
        };
        let run_id = seed_blocked_run(&store).await;
        let write_id = store
            .call({
                let run_id = run_id.clone();
                move |db| db.insert_github_write(&run_id, "post_comment", None, "idem1", &serde_json::json!({"body": "hi"}))
            })
            .await
            .unwrap()
            .id;
        let result = process_github_write(&ctx, write_id.clone()).await;
        assert!(result.is_ok(), "missing credentials must fail the write, not the job: {result:?}");
        let write = store.call({ let write_id = write_id.clone(); move |db| db.get_github_write(&write_id) }).await.unwrap().unwrap();
        assert_eq!(write.status, conductor_common::GithubWriteStatus::Failed);
    }
}
