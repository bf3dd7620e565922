//! Entity structs for every row the store persists (§3 of the design doc).

use chrono::{DateTime, Utc};
use conductor_common::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub forge_user_id: i64,
    pub forge_login: String,
    pub status: String,
    /// Encrypted at rest when `DATABASE_ENCRYPTION_KEY` is configured; see `crate::config`.
    pub encrypted_access_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub user_id: UserId,
    pub forge_org_id: i64,
    pub forge_installation_id: i64,
    pub default_branch: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub project_id: ProjectId,
    pub forge_repo_id: i64,
    pub forge_node_id: String,
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub profile_id: Option<String>,
    pub status: RepoStatus,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub repo_id: RepoId,
    pub forge_issue_number: i64,
    pub forge_node_id: String,
    pub title: String,
    pub body: String,
    pub state: String,
    pub labels: Vec<String>,
    pub active_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub repo_id: RepoId,
    pub run_number: i64,
    pub branch: Option<String>,
    pub head_commit: Option<String>,
    pub base_branch: String,
    pub phase: Phase,
    pub step: Option<Step>,
    pub status: String,
    pub result: Option<String>,
    pub result_reason: Option<String>,
    pub plan_revisions: i64,
    pub blocked_reason: Option<String>,
    pub blocked_context: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_event_sequence: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDefinition {
    pub id: String,
    pub kind: GateKind,
    pub description: String,
    pub default_config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub id: GateEvalId,
    pub run_id: RunId,
    pub gate_id: String,
    pub kind: GateKind,
    pub status: GateStatus,
    pub reason: Option<String>,
    pub details: Option<Value>,
    pub causation_event_id: EventId,
    pub causation_sequence: i64,
    pub duration_ms: Option<i64>,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAction {
    pub id: OperatorActionId,
    pub run_id: RunId,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub action_kind: String,
    pub comment: Option<String>,
    pub from_phase: Phase,
    pub to_phase: Option<Phase>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    pub id: OverrideId,
    pub run_id: RunId,
    pub kind: String,
    pub scope: OverrideScope,
    pub constraint_kind: String,
    pub constraint_value: String,
    pub constraint_hash: String,
    pub policy_set_id: String,
    pub operator_id: String,
    pub justification: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub id: WorktreeId,
    pub run_id: RunId,
    pub project_id: ProjectId,
    pub repo_id: RepoId,
    pub path: String,
    pub branch_name: String,
    pub base_commit: String,
    pub allocated_ports: Vec<u16>,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub sequence: i64,
    pub project_id: ProjectId,
    pub run_id: Option<RunId>,
    pub event_type: String,
    pub class: EventClass,
    pub payload: Value,
    pub idempotency_key: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: WebhookDeliveryId,
    pub event_type: String,
    pub action: Option<String>,
    pub repository_node_id: Option<String>,
    pub sender_node_id: Option<String>,
    pub payload_summary: Value,
    pub payload_hash: String,
    pub signature_valid: bool,
    pub status: WebhookDeliveryStatus,
    pub job_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub ignore_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubWrite {
    pub id: GithubWriteId,
    pub run_id: RunId,
    pub kind: String,
    pub target_node_id: Option<String>,
    pub idempotency_key: String,
    pub payload: Value,
    pub status: GithubWriteStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub result_id: Option<String>,
    pub result_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInstallation {
    pub id: PendingInstallationId,
    pub user_id: UserId,
    pub forge_installation_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub id: AgentInvocationId,
    pub run_id: RunId,
    pub agent: String,
    pub status: AgentInvocationStatus,
    pub turn_index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A queued unit of work (§3, §4.2). `status` is one of `pending`, `processing`,
/// `completed`, `failed` — kept as a plain string since queue status is local to the
/// queue adapter, not a cross-crate domain concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub queue: String,
    pub job_id: String,
    pub payload: Value,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
