//! Pending installations, agent invocations, and sessions (§3, §4.6, §4.13).

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use conductor_common::*;
use rusqlite::{OptionalExtension, Row, params};

use super::db::{ConductorDb, parse_dt};
use super::models::{AgentInvocation, PendingInstallation, Session};

impl ConductorDb {
    /// Records an installation webhook that arrived before the owning user completed
    /// OAuth login (§4.13 — "installation events may race the login callback").
    pub fn create_pending_installation(
        &self,
        user_id: &UserId,
        forge_installation_id: i64,
    ) -> Result<PendingInstallation> {
        let id = PendingInstallationId::new();
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO pending_installations (id, user_id, forge_installation_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.as_str(), user_id.as_str(), forge_installation_id, now],
        ).context("create_pending_installation")?;
        self.get_pending_installation(&id)?
            .ok_or_else(|| anyhow!("pending installation disappeared after insert"))
    }

    pub fn get_pending_installation(&self, id: &PendingInstallationId) -> Result<Option<PendingInstallation>> {
        self.conn()
            .query_row(
                "SELECT * FROM pending_installations WHERE id = ?1",
                params![id.as_str()],
                Self::row_to_pending_installation,
            )
            .optional()
            .context("get_pending_installation")
    }

    pub fn find_pending_installations_for_user(&self, user_id: &UserId) -> Result<Vec<PendingInstallation>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM pending_installations WHERE user_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![user_id.as_str()], Self::row_to_pending_installation)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("find_pending_installations_for_user")
    }

    pub fn delete_pending_installation(&self, id: &PendingInstallationId) -> Result<()> {
        self.conn()
            .execute("DELETE FROM pending_installations WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn row_to_pending_installation(row: &Row) -> rusqlite::Result<PendingInstallation> {
        Ok(PendingInstallation {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            forge_installation_id: row.get("forge_installation_id")?,
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
        })
    }
}

impl ConductorDb {
    pub fn create_agent_invocation(&self, run_id: &RunId, agent: &str) -> Result<AgentInvocation> {
        let id = AgentInvocationId::new();
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO agent_invocations (id, run_id, agent, status, turn_index, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'running', 0, ?4, ?4)",
            params![id.as_str(), run_id.as_str(), agent, now],
        ).context("create_agent_invocation")?;
        self.get_agent_invocation(&id)?
            .ok_or_else(|| anyhow!("agent invocation disappeared after insert"))
    }

    pub fn get_agent_invocation(&self, id: &AgentInvocationId) -> Result<Option<AgentInvocation>> {
        self.conn()
            .query_row(
                "SELECT * FROM agent_invocations WHERE id = ?1",
                params![id.as_str()],
                Self::row_to_agent_invocation,
            )
            .optional()
            .context("get_agent_invocation")
    }

    pub fn advance_agent_turn(&self, id: &AgentInvocationId) -> Result<i64> {
        self.conn().execute(
            "UPDATE agent_invocations SET turn_index = turn_index + 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.as_str()],
        )?;
        self.conn().query_row(
            "SELECT turn_index FROM agent_invocations WHERE id = ?1",
            params![id.as_str()],
            |r| r.get(0),
        ).context("advance_agent_turn")
    }

    pub fn set_agent_invocation_status(&self, id: &AgentInvocationId, status: AgentInvocationStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE agent_invocations SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(())
    }

    /// Invocations still `running` with no activity for longer than `max_age` — the
    /// worker's expired-lease cleanup sweep (§4.11).
    pub fn list_expired_agent_invocations(&self, max_age: Duration) -> Result<Vec<AgentInvocation>> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let mut stmt = self.conn().prepare(
            "SELECT * FROM agent_invocations WHERE status = 'running' AND updated_at < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], Self::row_to_agent_invocation)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_expired_agent_invocations")
    }

    fn row_to_agent_invocation(row: &Row) -> rusqlite::Result<AgentInvocation> {
        Ok(AgentInvocation {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            agent: row.get("agent")?,
            status: row.get::<_, String>("status")?.parse().unwrap_or(AgentInvocationStatus::Running),
            turn_index: row.get("turn_index")?,
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_dt(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
        })
    }
}

impl ConductorDb {
    pub fn create_session(&self, user_id: &UserId, token_hash: &str, ttl: Duration) -> Result<Session> {
        let id = SessionId::new();
        let now = Utc::now();
        let expires_at = now + ttl;
        self.conn().execute(
            "INSERT INTO sessions (id, user_id, token_hash, created_at, expires_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.as_str(), user_id.as_str(), token_hash, now.to_rfc3339(), expires_at.to_rfc3339()],
        ).context("create_session")?;
        self.get_session(&id)?.ok_or_else(|| anyhow!("session disappeared after insert"))
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        self.conn()
            .query_row("SELECT * FROM sessions WHERE id = ?1", params![id.as_str()], Self::row_to_session)
            .optional()
            .context("get_session")
    }

    pub fn find_session_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>> {
        self.conn()
            .query_row(
                "SELECT * FROM sessions WHERE token_hash = ?1",
                params![token_hash],
                Self::row_to_session,
            )
            .optional()
            .context("find_session_by_token_hash")
    }

    pub fn delete_session(&self, id: &SessionId) -> Result<()> {
        self.conn().execute("DELETE FROM sessions WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    pub fn delete_expired_sessions(&self) -> Result<usize> {
        Ok(self
            .conn()
            .execute("DELETE FROM sessions WHERE expires_at < ?1", params![Utc::now().to_rfc3339()])?)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            token_hash: row.get("token_hash")?,
            created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            expires_at: parse_dt(&row.get::<_, String>("expires_at")?).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_sessions_are_purged() {
        let db = ConductorDb::open_in_memory().unwrap();
        let user = db.upsert_user_by_forge_id(1, "octocat", "t").unwrap();
        let expired = db.create_session(&user.id, "hash1", Duration::seconds(-1)).unwrap();
        let live = db.create_session(&user.id, "hash2", Duration::days(1)).unwrap();
        let purged = db.delete_expired_sessions().unwrap();
        assert_eq!(purged, 1);
        assert!(db.get_session(&expired.id).unwrap().is_none());
        assert!(db.get_session(&live.id).unwrap().is_some());
    }

    #[test]
    fn agent_turn_advances_monotonically() {
        let db = ConductorDb::open_in_memory().unwrap();
        let run_id = RunId::new();
        let invocation = db.create_agent_invocation(&run_id, "claude").unwrap();
        assert_eq!(invocation.turn_index, 0);
        let t1 = db.advance_agent_turn(&invocation.id).unwrap();
        let t2 = db.advance_agent_turn(&invocation.id).unwrap();
        assert_eq!((t1, t2), (1, 2));
    }
}
