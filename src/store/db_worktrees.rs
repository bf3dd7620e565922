//! Worktree rows and per-project port allocation (§3, §4.10, §5).

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use conductor_common::*;
use rusqlite::{OptionalExtension, Row, params};

use super::db::{ConductorDb, parse_dt};
use super::models::Worktree;

impl ConductorDb {
    /// Allocates `count` free ports from the project's `[start, end]` range and inserts
    /// the `worktree` row `active`, all in one transaction (§5 — "allocation is in a
    /// transaction that selects the first free port and inserts into a port-holder
    /// table"). Fails if the run already has an active worktree.
    pub fn create_worktree(
        &mut self,
        run_id: &RunId,
        project_id: &ProjectId,
        repo_id: &RepoId,
        path: &str,
        branch_name: &str,
        base_commit: &str,
        port_count: usize,
    ) -> Result<Worktree> {
        let (start, end): (u16, u16) = self.conn().query_row(
            "SELECT port_range_start, port_range_end FROM projects WHERE id = ?1",
            params![project_id.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        ).context("project not found for port allocation")?;

        let tx = self.conn_mut().transaction()?;
        if tx.query_row(
            "SELECT 1 FROM worktrees WHERE run_id = ?1 AND status = 'active'",
            params![run_id.as_str()],
            |_| Ok(()),
        ).optional()?.is_some() {
            bail!("run {} already has an active worktree", run_id);
        }

        let mut held: Vec<u16> = tx
            .prepare("SELECT port FROM port_holders WHERE project_id = ?1")?
            .query_map(params![project_id.as_str()], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        held.sort_unstable();

        let id = WorktreeId::new();
        let mut allocated = Vec::with_capacity(port_count);
        let mut candidate = start;
        while allocated.len() < port_count {
            if candidate > end {
                bail!("no free ports remain in range [{start}, {end}] for project {project_id}");
            }
            if !held.contains(&candidate) {
                tx.execute(
                    "INSERT INTO port_holders (project_id, port, worktree_id) VALUES (?1, ?2, ?3)",
                    params![project_id.as_str(), candidate, id.as_str()],
                )?;
                allocated.push(candidate);
            }
            candidate += 1;
        }

        let now = Utc::now().to_rfc3339();
        let ports_json = serde_json::to_string(&allocated)?;
        tx.execute(
            "INSERT INTO worktrees (id, run_id, project_id, repo_id, path, branch_name, base_commit, allocated_ports, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?9)",
            params![id.as_str(), run_id.as_str(), project_id.as_str(), repo_id.as_str(), path, branch_name, base_commit, ports_json, now],
        )?;
        tx.commit()?;

        self.get_worktree(&id)?.ok_or_else(|| anyhow!("worktree disappeared after insert"))
    }

    pub fn get_worktree(&self, id: &WorktreeId) -> Result<Option<Worktree>> {
        self.conn()
            .query_row("SELECT * FROM worktrees WHERE id = ?1", params![id.as_str()], Self::row_to_worktree)
            .optional()
            .context("get_worktree")
    }

    pub fn get_active_worktree_for_run(&self, run_id: &RunId) -> Result<Option<Worktree>> {
        self.conn()
            .query_row(
                "SELECT * FROM worktrees WHERE run_id = ?1 AND status = 'active'",
                params![run_id.as_str()],
                Self::row_to_worktree,
            )
            .optional()
            .context("get_active_worktree_for_run")
    }

    pub fn list_active_worktrees(&self) -> Result<Vec<Worktree>> {
        let mut stmt = self.conn().prepare("SELECT * FROM worktrees WHERE status = 'active'")?;
        let rows = stmt.query_map([], Self::row_to_worktree)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_active_worktrees")
    }

    /// Marks the worktree `cleaned` and releases its ports, in one transaction.
    /// Idempotent: a no-op (`Ok(false)`) if no active worktree exists for the run.
    pub fn mark_worktree_cleaned(&mut self, run_id: &RunId) -> Result<bool> {
        let Some(wt) = self.get_active_worktree_for_run(run_id)? else {
            return Ok(false);
        };
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "UPDATE worktrees SET status = 'cleaned', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), wt.id.as_str()],
        )?;
        tx.execute("DELETE FROM port_holders WHERE worktree_id = ?1", params![wt.id.as_str()])?;
        tx.commit()?;
        Ok(true)
    }

    pub fn mark_worktree_orphaned(&self, id: &WorktreeId) -> Result<()> {
        self.conn().execute(
            "UPDATE worktrees SET status = 'orphaned', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.as_str()],
        )?;
        self.conn().execute("DELETE FROM port_holders WHERE worktree_id = ?1", params![id.as_str()])?;
        Ok(())
    }

    /// Releases ports held by worktrees that are no longer active — the janitor's
    /// third reconciliation step (§4.10c).
    pub fn release_ports_for_inactive_worktrees(&self) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM port_holders WHERE worktree_id IN (SELECT id FROM worktrees WHERE status != 'active')",
            [],
        )?)
    }

    fn row_to_worktree(row: &Row) -> rusqlite::Result<Worktree> {
        let status: String = row.get("status")?;
        let ports: String = row.get("allocated_ports")?;
        Ok(Worktree {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            project_id: row.get("project_id")?,
            repo_id: row.get("repo_id")?,
            path: row.get("path")?,
            branch_name: row.get("branch_name")?,
            base_commit: row.get("base_commit")?,
            allocated_ports: serde_json::from_str(&ports).unwrap_or_default(),
            status: status.parse().unwrap_or(WorktreeStatus::Active),
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_project(db: &ConductorDb) -> (ProjectId, RepoId) {
        let user = db.upsert_user_by_forge_id(1, "octocat", "t").unwrap();
        let project = db.create_project(&user.id, 1, 2, "main", (20000, 20002)).unwrap();
        let repo = db.create_repo(&project.id, 3, "node", "octocat", "hello", "main").unwrap();
        (project.id, repo.id)
    }

    #[test]
    fn second_active_worktree_for_same_run_fails() {
        let mut db = ConductorDb::open_in_memory().unwrap();
        let (project_id, repo_id) = seed_project(&db);
        let run_id = RunId::new();
        db.create_worktree(&run_id, &project_id, &repo_id, "/tmp/a", "br", "sha", 1).unwrap();
        let second = db.create_worktree(&run_id, &project_id, &repo_id, "/tmp/b", "br2", "sha", 1);
        assert!(second.is_err());
    }

    #[test]
    fn port_allocation_exhausts_range() {
        let mut db = ConductorDb::open_in_memory().unwrap();
        let (project_id, repo_id) = seed_project(&db);
        // range has exactly 3 ports [20000, 20002]
        let wt1 = db.create_worktree(&RunId::new(), &project_id, &repo_id, "/a", "b1", "s", 2).unwrap();
        assert_eq!(wt1.allocated_ports, vec![20000, 20001]);
        let wt2 = db.create_worktree(&RunId::new(), &project_id, &repo_id, "/b", "b2", "s", 1).unwrap();
        assert_eq!(wt2.allocated_ports, vec![20002]);
        let err = db.create_worktree(&RunId::new(), &project_id, &repo_id, "/c", "b3", "s", 1);
        assert!(err.is_err());
    }

    #[test]
    fn cleanup_is_idempotent_and_releases_ports() {
        let mut db = ConductorDb::open_in_memory().unwrap();
        let (project_id, repo_id) = seed_project(&db);
        let run_id = RunId::new();
        db.create_worktree(&run_id, &project_id, &repo_id, "/a", "b", "s", 1).unwrap();
        assert!(db.mark_worktree_cleaned(&run_id).unwrap());
        assert!(!db.mark_worktree_cleaned(&run_id).unwrap());
        let held: i64 = db.conn().query_row("SELECT COUNT(*) FROM port_holders WHERE project_id = ?1", params![project_id.as_str()], |r| r.get(0)).unwrap();
        assert_eq!(held, 0);
    }
}
