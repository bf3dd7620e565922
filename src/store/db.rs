//! Synchronous SQLite access for every persistent entity (§3, §4.1).
//!
//! Mirrors the shape of a typical embedded-SQLite store: one `Connection`,
//! migrations run via `execute_batch` on open, and one `impl` block per
//! entity family with CRUD methods that take/return the plain domain
//! structs from `super::models`. Everything here is synchronous; the async
//! seam lives in `super::handle::StoreHandle`.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use conductor_common::*;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use super::models::*;

pub struct ConductorDb {
    conn: Connection,
}

impl ConductorDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open database")?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    forge_user_id INTEGER NOT NULL UNIQUE,
                    forge_login TEXT NOT NULL,
                    status TEXT NOT NULL,
                    encrypted_access_token TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    forge_org_id INTEGER NOT NULL,
                    forge_installation_id INTEGER NOT NULL,
                    default_branch TEXT NOT NULL,
                    port_range_start INTEGER NOT NULL,
                    port_range_end INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(user_id, forge_installation_id)
                );

                CREATE TABLE IF NOT EXISTS repos (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    forge_repo_id INTEGER NOT NULL,
                    forge_node_id TEXT NOT NULL,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    default_branch TEXT NOT NULL,
                    profile_id TEXT,
                    status TEXT NOT NULL,
                    last_fetched_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_repos_project ON repos(project_id);

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    repo_id TEXT NOT NULL REFERENCES repos(id),
                    forge_issue_number INTEGER NOT NULL,
                    forge_node_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL,
                    state TEXT NOT NULL,
                    labels TEXT NOT NULL,
                    active_run_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_repo ON tasks(repo_id);

                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES tasks(id),
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    repo_id TEXT NOT NULL REFERENCES repos(id),
                    run_number INTEGER NOT NULL,
                    branch TEXT,
                    head_commit TEXT,
                    base_branch TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    step TEXT,
                    status TEXT NOT NULL,
                    result TEXT,
                    result_reason TEXT,
                    plan_revisions INTEGER NOT NULL DEFAULT 0,
                    blocked_reason TEXT,
                    blocked_context TEXT,
                    started_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT,
                    last_event_sequence INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);
                CREATE INDEX IF NOT EXISTS idx_runs_project_phase ON runs(project_id, phase);

                CREATE TABLE IF NOT EXISTS gate_definitions (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    description TEXT NOT NULL,
                    default_config TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS gate_evaluations (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    gate_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL,
                    reason TEXT,
                    details TEXT,
                    causation_event_id TEXT NOT NULL,
                    causation_sequence INTEGER NOT NULL,
                    duration_ms INTEGER,
                    evaluated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_gate_eval_run_gate ON gate_evaluations(run_id, gate_id, causation_sequence);

                CREATE TABLE IF NOT EXISTS operator_actions (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    actor_id TEXT NOT NULL,
                    actor_type TEXT NOT NULL,
                    action_kind TEXT NOT NULL,
                    comment TEXT,
                    from_phase TEXT NOT NULL,
                    to_phase TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_operator_actions_run ON operator_actions(run_id);

                CREATE TABLE IF NOT EXISTS overrides (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    kind TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    constraint_kind TEXT NOT NULL,
                    constraint_value TEXT NOT NULL,
                    constraint_hash TEXT NOT NULL,
                    policy_set_id TEXT NOT NULL,
                    operator_id TEXT NOT NULL,
                    justification TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS worktrees (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    repo_id TEXT NOT NULL REFERENCES repos(id),
                    path TEXT NOT NULL,
                    branch_name TEXT NOT NULL,
                    base_commit TEXT NOT NULL,
                    allocated_ports TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_worktrees_run ON worktrees(run_id, status);

                CREATE TABLE IF NOT EXISTS port_holders (
                    project_id TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    worktree_id TEXT NOT NULL,
                    PRIMARY KEY (project_id, port)
                );

                CREATE TABLE IF NOT EXISTS events (
                    id TEXT PRIMARY KEY,
                    sequence INTEGER NOT NULL UNIQUE,
                    project_id TEXT NOT NULL,
                    run_id TEXT,
                    event_type TEXT NOT NULL,
                    class TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    idempotency_key TEXT NOT NULL UNIQUE,
                    source TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_project_sequence ON events(project_id, sequence);

                CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id TEXT PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    action TEXT,
                    repository_node_id TEXT,
                    sender_node_id TEXT,
                    payload_summary TEXT NOT NULL,
                    payload_hash TEXT NOT NULL,
                    signature_valid INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    job_id TEXT,
                    received_at TEXT NOT NULL,
                    processed_at TEXT,
                    error TEXT,
                    ignore_reason TEXT
                );

                CREATE TABLE IF NOT EXISTS github_writes (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    kind TEXT NOT NULL,
                    target_node_id TEXT,
                    idempotency_key TEXT NOT NULL UNIQUE,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    result_id TEXT,
                    result_url TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_github_writes_status ON github_writes(status, created_at);

                CREATE TABLE IF NOT EXISTS pending_installations (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    forge_installation_id INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_invocations (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    agent TEXT NOT NULL,
                    status TEXT NOT NULL,
                    turn_index INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    token_hash TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    queue TEXT NOT NULL,
                    job_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    available_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (queue, job_id)
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs(queue, status, available_at);
                "#,
            )
            .context("failed to run migrations")?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Runs `f` inside a single SQLite transaction, committing on `Ok` and rolling back
    /// on `Err` (§4.1 — "within transaction, all reads and writes are atomic and
    /// isolated against other transactions").
    pub fn transaction<T>(&mut self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let tx = self.conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

pub(crate) fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

pub(crate) fn json_col(v: &Value) -> String {
    v.to_string()
}

// ---------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------

impl ConductorDb {
    pub fn upsert_user_by_forge_id(
        &self,
        forge_user_id: i64,
        forge_login: &str,
        encrypted_access_token: &str,
    ) -> Result<User> {
        let now = Utc::now();
        if let Some(existing) = self.get_user_by_forge_id(forge_user_id)? {
            self.conn.execute(
                "UPDATE users SET forge_login = ?1, encrypted_access_token = ?2, updated_at = ?3 WHERE id = ?4",
                params![forge_login, encrypted_access_token, now.to_rfc3339(), existing.id.as_str()],
            )?;
            return self
                .get_user(&existing.id)?
                .ok_or_else(|| anyhow!("user disappeared after update"));
        }
        let id = UserId::new();
        self.conn.execute(
            "INSERT INTO users (id, forge_user_id, forge_login, status, encrypted_access_token, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
            params![id.as_str(), forge_user_id, forge_login, encrypted_access_token, now.to_rfc3339()],
        )?;
        self.get_user(&id)?.ok_or_else(|| anyhow!("user disappeared after insert"))
    }

    pub fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        self.conn
            .query_row("SELECT * FROM users WHERE id = ?1", params![id.as_str()], Self::row_to_user)
            .optional()
            .context("get_user")
    }

    pub fn get_user_by_forge_id(&self, forge_user_id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT * FROM users WHERE forge_user_id = ?1",
                params![forge_user_id],
                Self::row_to_user,
            )
            .optional()
            .context("get_user_by_forge_id")
    }

    fn row_to_user(row: &Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get("id")?,
            forge_user_id: row.get("forge_user_id")?,
            forge_login: row.get("forge_login")?,
            status: row.get("status")?,
            encrypted_access_token: row.get("encrypted_access_token")?,
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------

impl ConductorDb {
    pub fn create_project(
        &self,
        user_id: &UserId,
        forge_org_id: i64,
        forge_installation_id: i64,
        default_branch: &str,
        port_range: (u16, u16),
    ) -> Result<Project> {
        let id = ProjectId::new();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO projects (id, user_id, forge_org_id, forge_installation_id, default_branch, port_range_start, port_range_end, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![id.as_str(), user_id.as_str(), forge_org_id, forge_installation_id, default_branch, port_range.0, port_range.1, now],
        ).context("create_project")?;
        self.get_project(&id)?.ok_or_else(|| anyhow!("project disappeared after insert"))
    }

    pub fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        self.conn
            .query_row("SELECT * FROM projects WHERE id = ?1", params![id.as_str()], Self::row_to_project)
            .optional()
            .context("get_project")
    }

    pub fn find_project_for_installation(
        &self,
        forge_installation_id: i64,
    ) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT * FROM projects WHERE forge_installation_id = ?1",
                params![forge_installation_id],
                Self::row_to_project,
            )
            .optional()
            .context("find_project_for_installation")
    }

    /// Projects owned by a user, for scoping SSE subscriptions and action authorization
    /// to what the caller may see (§4.12, §7 "NotFound... not accessible to caller").
    pub fn list_projects_for_user(&self, user_id: &UserId) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM projects WHERE user_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![user_id.as_str()], Self::row_to_project)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_projects_for_user")
    }

    fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
        Ok(Project {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            forge_org_id: row.get("forge_org_id")?,
            forge_installation_id: row.get("forge_installation_id")?,
            default_branch: row.get("default_branch")?,
            port_range_start: row.get("port_range_start")?,
            port_range_end: row.get("port_range_end")?,
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------
// Repos
// ---------------------------------------------------------------------

impl ConductorDb {
    #[allow(clippy::too_many_arguments)]
    pub fn create_repo(
        &self,
        project_id: &ProjectId,
        forge_repo_id: i64,
        forge_node_id: &str,
        owner: &str,
        name: &str,
        default_branch: &str,
    ) -> Result<Repo> {
        let id = RepoId::new();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO repos (id, project_id, forge_repo_id, forge_node_id, owner, name, default_branch, profile_id, status, last_fetched_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 'active', NULL, ?8, ?8)",
            params![id.as_str(), project_id.as_str(), forge_repo_id, forge_node_id, owner, name, default_branch, now],
        ).context("create_repo")?;
        self.get_repo(&id)?.ok_or_else(|| anyhow!("repo disappeared after insert"))
    }

    pub fn get_repo(&self, id: &RepoId) -> Result<Option<Repo>> {
        self.conn
            .query_row("SELECT * FROM repos WHERE id = ?1", params![id.as_str()], Self::row_to_repo)
            .optional()
            .context("get_repo")
    }

    pub fn find_repo_by_node_id(&self, forge_node_id: &str) -> Result<Option<Repo>> {
        self.conn
            .query_row(
                "SELECT * FROM repos WHERE forge_node_id = ?1",
                params![forge_node_id],
                Self::row_to_repo,
            )
            .optional()
            .context("find_repo_by_node_id")
    }

    pub fn mark_repo_fetched(&self, id: &RepoId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE repos SET last_fetched_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id.as_str()],
        )?;
        Ok(())
    }

    fn row_to_repo(row: &Row) -> rusqlite::Result<Repo> {
        let status: String = row.get("status")?;
        Ok(Repo {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            forge_repo_id: row.get("forge_repo_id")?,
            forge_node_id: row.get("forge_node_id")?,
            owner: row.get("owner")?,
            name: row.get("name")?,
            default_branch: row.get("default_branch")?,
            profile_id: row.get("profile_id")?,
            status: status.parse().unwrap_or(RepoStatus::Active),
            last_fetched_at: row
                .get::<_, Option<String>>("last_fetched_at")?
                .and_then(|s| parse_dt(&s).ok()),
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------

impl ConductorDb {
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_task(
        &self,
        project_id: &ProjectId,
        repo_id: &RepoId,
        forge_issue_number: i64,
        forge_node_id: &str,
        title: &str,
        body: &str,
        state: &str,
        labels: &[String],
    ) -> Result<Task> {
        if let Some(existing) = self.find_task_by_node_id(forge_node_id)? {
            let now = Utc::now().to_rfc3339();
            self.conn.execute(
                "UPDATE tasks SET title = ?1, body = ?2, state = ?3, labels = ?4, updated_at = ?5 WHERE id = ?6",
                params![title, body, state, json_col(&serde_json::json!(labels)), now, existing.id.as_str()],
            )?;
            return self.get_task(&existing.id)?.ok_or_else(|| anyhow!("task disappeared"));
        }
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO tasks (id, project_id, repo_id, forge_issue_number, forge_node_id, title, body, state, labels, active_run_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, ?10)",
            params![id.as_str(), project_id.as_str(), repo_id.as_str(), forge_issue_number, forge_node_id, title, body, state, json_col(&serde_json::json!(labels)), now],
        ).context("create_task")?;
        self.get_task(&id)?.ok_or_else(|| anyhow!("task disappeared after insert"))
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id.as_str()], Self::row_to_task)
            .optional()
            .context("get_task")
    }

    pub fn find_task_by_node_id(&self, forge_node_id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                "SELECT * FROM tasks WHERE forge_node_id = ?1",
                params![forge_node_id],
                Self::row_to_task,
            )
            .optional()
            .context("find_task_by_node_id")
    }

    pub fn set_task_active_run(&self, id: &TaskId, run_id: Option<&RunId>) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET active_run_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![run_id.map(|r| r.as_str()), Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(())
    }

    fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
        let labels: String = row.get("labels")?;
        Ok(Task {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            repo_id: row.get("repo_id")?,
            forge_issue_number: row.get("forge_issue_number")?,
            forge_node_id: row.get("forge_node_id")?,
            title: row.get("title")?,
            body: row.get("body")?,
            state: row.get("state")?,
            labels: serde_json::from_str(&labels).unwrap_or_default(),
            active_run_id: row.get::<_, Option<String>>("active_run_id")?.map(Into::into),
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------

impl ConductorDb {
    pub fn create_run(&self, task: &Task, base_branch: &str) -> Result<Run> {
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();
        let run_number: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs WHERE task_id = ?1",
            params![task.id.as_str()],
            |r| r.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO runs (id, task_id, project_id, repo_id, run_number, branch, head_commit, base_branch, phase, step, status, result, result_reason, plan_revisions, blocked_reason, blocked_context, started_at, updated_at, completed_at, last_event_sequence)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, 'pending', NULL, 'active', NULL, NULL, 0, NULL, NULL, ?7, ?7, NULL, 0)",
            params![id.as_str(), task.id.as_str(), task.project_id.as_str(), task.repo_id.as_str(), run_number, base_branch, now],
        ).context("create_run")?;
        self.get_run(&id)?.ok_or_else(|| anyhow!("run disappeared after insert"))
    }

    pub fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        self.conn
            .query_row("SELECT * FROM runs WHERE id = ?1", params![id.as_str()], Self::row_to_run)
            .optional()
            .context("get_run")
    }

    pub fn list_runs_in_phases(&self, project_id: &ProjectId, phases: &[Phase]) -> Result<Vec<Run>> {
        let mut out = Vec::new();
        for phase in phases {
            let mut stmt = self.conn.prepare(
                "SELECT * FROM runs WHERE project_id = ?1 AND phase = ?2 ORDER BY updated_at ASC",
            )?;
            let rows = stmt.query_map(params![project_id.as_str(), phase.as_str()], Self::row_to_run)?;
            for row in rows {
                out.push(row?);
            }
        }
        out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(out)
    }

    /// Low-level row update used only by `crate::runs::transition_phase`, which is the sole
    /// caller permitted to mutate `phase`/`step`/blocked fields (§4.7).
    #[allow(clippy::too_many_arguments)]
    pub fn update_run_phase(
        &self,
        id: &RunId,
        phase: Phase,
        step: Option<&str>,
        result: Option<&str>,
        result_reason: Option<&str>,
        blocked_reason: Option<&str>,
        blocked_context: Option<&Value>,
        completed: bool,
    ) -> Result<Run> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE runs SET phase = ?1, step = ?2, result = ?3, result_reason = ?4, blocked_reason = ?5, blocked_context = ?6, updated_at = ?7, completed_at = CASE WHEN ?8 THEN ?7 ELSE completed_at END WHERE id = ?9",
            params![
                phase.as_str(),
                step,
                result,
                result_reason,
                blocked_reason,
                blocked_context.map(json_col),
                now,
                completed,
                id.as_str(),
            ],
        ).context("update_run_phase")?;
        self.get_run(id)?.ok_or_else(|| anyhow!("run disappeared during update"))
    }

    pub fn increment_plan_revisions(&self, id: &RunId) -> Result<i64> {
        self.conn.execute(
            "UPDATE runs SET plan_revisions = plan_revisions + 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.as_str()],
        )?;
        self.conn.query_row(
            "SELECT plan_revisions FROM runs WHERE id = ?1",
            params![id.as_str()],
            |r| r.get(0),
        ).context("increment_plan_revisions")
    }

    pub fn bump_run_event_sequence(&self, id: &RunId, sequence: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET last_event_sequence = ?1 WHERE id = ?2 AND last_event_sequence < ?1",
            params![sequence, id.as_str()],
        )?;
        Ok(())
    }

    pub fn set_run_branch_and_commit(&self, id: &RunId, branch: &str, head_commit: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET branch = ?1, head_commit = ?2, updated_at = ?3 WHERE id = ?4",
            params![branch, head_commit, Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(())
    }

    fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
        let phase: String = row.get("phase")?;
        let blocked_context: Option<String> = row.get("blocked_context")?;
        Ok(Run {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            project_id: row.get("project_id")?,
            repo_id: row.get("repo_id")?,
            run_number: row.get("run_number")?,
            branch: row.get("branch")?,
            head_commit: row.get("head_commit")?,
            base_branch: row.get("base_branch")?,
            phase: phase.parse().unwrap_or(Phase::Pending),
            step: row.get("step")?,
            status: row.get("status")?,
            result: row.get("result")?,
            result_reason: row.get("result_reason")?,
            plan_revisions: row.get("plan_revisions")?,
            blocked_reason: row.get("blocked_reason")?,
            blocked_context: blocked_context.and_then(|s| serde_json::from_str(&s).ok()),
            started_at: parse_dt(&row.get::<_, String>("started_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
            completed_at: row
                .get::<_, Option<String>>("completed_at")?
                .and_then(|s| parse_dt(&s).ok()),
            last_event_sequence: row.get("last_event_sequence")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_task(db: &ConductorDb) -> Task {
        let user = db.upsert_user_by_forge_id(1, "octocat", "enc-token").unwrap();
        let project = db
            .create_project(&user.id, 10, 20, "main", (20000, 20100))
            .unwrap();
        let repo = db
            .create_repo(&project.id, 30, "node_repo", "octocat", "hello", "main")
            .unwrap();
        db.upsert_task(
            &project.id,
            &repo.id,
            1,
            "node_issue_1",
            "Fix bug",
            "body",
            "open",
            &["bug".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn migrate_is_idempotent() {
        let db = ConductorDb::open_in_memory().unwrap();
        db.migrate().unwrap();
    }

    #[test]
    fn user_upsert_is_idempotent_on_forge_id() {
        let db = ConductorDb::open_in_memory().unwrap();
        let a = db.upsert_user_by_forge_id(1, "octocat", "t1").unwrap();
        let b = db.upsert_user_by_forge_id(1, "octocat2", "t2").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.forge_login, "octocat2");
    }

    #[test]
    fn list_projects_for_user_excludes_other_users_projects() {
        let db = ConductorDb::open_in_memory().unwrap();
        let alice = db.upsert_user_by_forge_id(1, "alice", "t1").unwrap();
        let bob = db.upsert_user_by_forge_id(2, "bob", "t2").unwrap();
        db.create_project(&alice.id, 10, 20, "main", (20000, 20010)).unwrap();
        db.create_project(&alice.id, 11, 21, "main", (20011, 20020)).unwrap();
        db.create_project(&bob.id, 12, 22, "main", (20021, 20030)).unwrap();
        let alice_projects = db.list_projects_for_user(&alice.id).unwrap();
        assert_eq!(alice_projects.len(), 2);
        assert!(alice_projects.iter().all(|p| p.user_id == alice.id));
    }

    #[test]
    fn create_run_assigns_increasing_run_numbers() {
        let db = ConductorDb::open_in_memory().unwrap();
        let task = seed_task(&db);
        let r1 = db.create_run(&task, "main").unwrap();
        let r2 = db.create_run(&task, "main").unwrap();
        assert_eq!(r1.run_number, 1);
        assert_eq!(r2.run_number, 2);
        assert_eq!(r1.phase, Phase::Pending);
    }

    #[test]
    fn update_run_phase_persists_blocked_context() {
        let db = ConductorDb::open_in_memory().unwrap();
        let task = seed_task(&db);
        let run = db.create_run(&task, "main").unwrap();
        let ctx = serde_json::json!({"prior_phase": "planning"});
        let updated = db
            .update_run_phase(&run.id, Phase::Blocked, None, None, None, Some("gate_failed"), Some(&ctx), false)
            .unwrap();
        assert_eq!(updated.phase, Phase::Blocked);
        assert_eq!(updated.blocked_reason.as_deref(), Some("gate_failed"));
        assert_eq!(updated.blocked_context.unwrap()["prior_phase"], "planning");
    }

    #[test]
    fn list_runs_in_phases_orders_oldest_first() {
        let db = ConductorDb::open_in_memory().unwrap();
        let task = seed_task(&db);
        let r1 = db.create_run(&task, "main").unwrap();
        let r2 = db.create_run(&task, "main").unwrap();
        db.update_run_phase(&r1.id, Phase::Planning, None, None, None, None, None, false).unwrap();
        db.update_run_phase(&r1.id, Phase::AwaitingPlanApproval, None, None, None, None, None, false).unwrap();
        db.update_run_phase(&r2.id, Phase::Planning, None, None, None, None, None, false).unwrap();
        db.update_run_phase(&r2.id, Phase::AwaitingPlanApproval, None, None, None, None, None, false).unwrap();
        let awaiting = db
            .list_runs_in_phases(&task.project_id, &[Phase::AwaitingPlanApproval])
            .unwrap();
        assert_eq!(awaiting.len(), 2);
        assert_eq!(awaiting[0].id, r1.id);
    }
}
