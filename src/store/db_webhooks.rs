//! Raw webhook ingress records (§3, §4.5).

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::db::{ConductorDb, json_col, parse_dt};
use super::models::WebhookDelivery;
use conductor_common::{WebhookDeliveryId, WebhookDeliveryStatus};

/// Outcome of attempting to persist a delivery (§4.5 step 7).
pub enum InsertDeliveryOutcome {
    Inserted(WebhookDelivery),
    Duplicate(WebhookDelivery),
}

impl ConductorDb {
    #[allow(clippy::too_many_arguments)]
    pub fn insert_webhook_delivery_if_new(
        &self,
        id: &WebhookDeliveryId,
        event_type: &str,
        action: Option<&str>,
        repository_node_id: Option<&str>,
        sender_node_id: Option<&str>,
        payload_summary: &Value,
        payload_hash: &str,
        signature_valid: bool,
    ) -> Result<InsertDeliveryOutcome> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO webhook_deliveries (id, event_type, action, repository_node_id, sender_node_id, payload_summary, payload_hash, signature_valid, status, job_id, received_at, processed_at, error, ignore_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'received', NULL, ?9, NULL, NULL, NULL)",
            params![
                id.as_str(),
                event_type,
                action,
                repository_node_id,
                sender_node_id,
                json_col(payload_summary),
                payload_hash,
                signature_valid,
                now,
            ],
        ).context("insert_webhook_delivery_if_new")?;
        let row = self
            .get_webhook_delivery(id)?
            .ok_or_else(|| anyhow!("webhook delivery disappeared after insert"))?;
        if inserted == 0 {
            Ok(InsertDeliveryOutcome::Duplicate(row))
        } else {
            Ok(InsertDeliveryOutcome::Inserted(row))
        }
    }

    pub fn get_webhook_delivery(&self, id: &WebhookDeliveryId) -> Result<Option<WebhookDelivery>> {
        self.conn()
            .query_row(
                "SELECT * FROM webhook_deliveries WHERE id = ?1",
                params![id.as_str()],
                Self::row_to_delivery,
            )
            .optional()
            .context("get_webhook_delivery")
    }

    pub fn mark_delivery_failed(&self, id: &WebhookDeliveryId, error: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE webhook_deliveries SET status = 'failed', error = ?1, processed_at = ?2 WHERE id = ?3",
            params![error, Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(())
    }

    pub fn mark_delivery_ignored(&self, id: &WebhookDeliveryId, reason: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE webhook_deliveries SET status = 'ignored', ignore_reason = ?1, processed_at = ?2 WHERE id = ?3",
            params![reason, Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(())
    }

    pub fn mark_delivery_processing(&self, id: &WebhookDeliveryId, job_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE webhook_deliveries SET status = 'processing', job_id = ?1 WHERE id = ?2",
            params![job_id, id.as_str()],
        )?;
        Ok(())
    }

    pub fn mark_delivery_processed(&self, id: &WebhookDeliveryId) -> Result<()> {
        self.conn().execute(
            "UPDATE webhook_deliveries SET status = 'processed', processed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.as_str()],
        )?;
        Ok(())
    }

    /// Deliveries still `received` with no queue job — the recovery sweep's input set
    /// (SPEC_FULL.md §4.5, "a process crash... leaves the row in received state").
    pub fn list_stuck_received_deliveries(&self) -> Result<Vec<WebhookDelivery>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM webhook_deliveries WHERE status = 'received'")?;
        let rows = stmt.query_map([], Self::row_to_delivery)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("list_stuck_received_deliveries")
    }

    fn row_to_delivery(row: &Row) -> rusqlite::Result<WebhookDelivery> {
        let status: String = row.get("status")?;
        let summary: String = row.get("payload_summary")?;
        Ok(WebhookDelivery {
            id: row.get("id")?,
            event_type: row.get("event_type")?,
            action: row.get("action")?,
            repository_node_id: row.get("repository_node_id")?,
            sender_node_id: row.get("sender_node_id")?,
            payload_summary: serde_json::from_str(&summary).unwrap_or(Value::Null),
            payload_hash: row.get("payload_hash")?,
            signature_valid: row.get("signature_valid")?,
            status: status.parse().unwrap_or(WebhookDeliveryStatus::Received),
            job_id: row.get("job_id")?,
            received_at: parse_dt(&row.get::<_, String>("received_at")?).unwrap_or_default(),
            processed_at: row
                .get::<_, Option<String>>("processed_at")?
                .and_then(|s| parse_dt(&s).ok()),
            error: row.get("error")?,
            ignore_reason: row.get("ignore_reason")?,
        })
    }
}
