//! Webhook receiver and normalizer (§4.5, §4.6).
//!
//! The HTTP-facing handler lives here rather than in `crate::http` so the ten-step
//! ordered contract (verify, persist, ignore-check, enqueue) stays next to the row it
//! mutates; `crate::http` only wires the route to `handle_webhook`.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use conductor_common::{EventClass, WebhookDeliveryId};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::ConductorError;
use crate::http::AppState;
use crate::queue::QueueAdapter;
use crate::runs::downcast_conductor_error;
use crate::store::StoreHandle;
use crate::store::db_webhooks::InsertDeliveryOutcome;
use crate::store::models::WebhookDelivery;

/// Event types accepted but never acted on (§4.5 step 9).
const IGNORED_EVENT_TYPES: &[&str] = &["ping", "installation", "installation_repositories"];

/// `POST /webhooks/<forge>` (§4.5, §6). Order matters: a duplicate delivery is
/// reported 200 even with a bad signature, because step 7 (persist) runs before
/// step 8 (signature check) — the row exists either way and is kept for audit.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(_forge): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ConductorError> {
    let delivery_id = header_str(&headers, "x-delivery-id")
        .ok_or_else(|| ConductorError::validation("missing X-Delivery-Id header"))?;
    let event_type = header_str(&headers, "x-event-type")
        .ok_or_else(|| ConductorError::validation("missing X-Event-Type header"))?;
    let signature = header_str(&headers, "x-signature");

    let signature_valid = match &state.config.github_webhook_secret {
        Some(secret) => verify_signature(secret, &body, signature.as_deref()),
        None => !state.config.environment.is_production(),
    };

    let payload: Value =
        serde_json::from_slice(&body).map_err(|_| ConductorError::validation("invalid JSON payload"))?;

    let summary = extract_payload_summary(&event_type, &payload);
    let payload_hash = hex_encode(&Sha256::digest(&body));
    let repository_node_id = payload.pointer("/repository/node_id").and_then(Value::as_str).map(str::to_owned);
    let sender_node_id = payload.pointer("/sender/node_id").and_then(Value::as_str).map(str::to_owned);
    let action = payload.get("action").and_then(Value::as_str).map(str::to_owned);

    let id = WebhookDeliveryId::from(delivery_id.as_str());
    let outcome = state
        .store
        .call({
            let id = id.clone();
            let event_type = event_type.clone();
            let action = action.clone();
            let repository_node_id = repository_node_id.clone();
            let sender_node_id = sender_node_id.clone();
            let summary = summary.clone();
            let payload_hash = payload_hash.clone();
            move |db| {
                db.insert_webhook_delivery_if_new(
                    &id,
                    &event_type,
                    action.as_deref(),
                    repository_node_id.as_deref(),
                    sender_node_id.as_deref(),
                    &summary,
                    &payload_hash,
                    signature_valid,
                )
            }
        })
        .await
        .map_err(ConductorError::Internal)?;

    let delivery = match outcome {
        InsertDeliveryOutcome::Duplicate(_) => {
            return Ok((StatusCode::OK, Json(json!({"received": true, "duplicate": true}))));
        }
        InsertDeliveryOutcome::Inserted(delivery) => delivery,
    };

    if !signature_valid && state.config.requires_webhook_signature() {
        mark_failed(&state.store, &delivery.id, "invalid signature").await?;
        return Err(ConductorError::AuthenticationRequired);
    }

    if IGNORED_EVENT_TYPES.contains(&event_type.as_str()) {
        state
            .store
            .call({
                let id = delivery.id.clone();
                move |db| db.mark_delivery_ignored(&id, "ignored event type")
            })
            .await
            .map_err(ConductorError::Internal)?;
        return Ok((StatusCode::OK, Json(json!({"received": true, "ignored": true}))));
    }

    let job_payload = job_payload_for(&delivery);
    match state.queue.add_job("webhooks", delivery.id.as_str(), job_payload).await {
        Ok(_) => {
            state
                .store
                .call({
                    let id = delivery.id.clone();
                    let job_id = delivery.id.as_str().to_string();
                    move |db| db.mark_delivery_processing(&id, &job_id)
                })
                .await
                .map_err(ConductorError::Internal)?;
            Ok((StatusCode::OK, Json(json!({"received": true}))))
        }
        Err(err) => {
            mark_failed(&state.store, &delivery.id, &err.to_string()).await?;
            Err(ConductorError::Internal(anyhow::anyhow!("failed to enqueue webhook job: {err}")))
        }
    }
}

async fn mark_failed(store: &StoreHandle, id: &WebhookDeliveryId, error: &str) -> Result<(), ConductorError> {
    let id = id.clone();
    let error = error.to_string();
    store.call(move |db| db.mark_delivery_failed(&id, &error)).await.map_err(ConductorError::Internal)
}

fn job_payload_for(delivery: &WebhookDelivery) -> Value {
    json!({
        "deliveryId": delivery.id.as_str(),
        "eventType": delivery.event_type,
        "action": delivery.action,
        "repositoryNodeId": delivery.repository_node_id,
        "payloadSummary": delivery.payload_summary,
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
}

/// Constant-time HMAC-SHA-256 check against an `sha256=<hex>` header value (§4.5 step 3).
fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else { return false };
    let Some(hex_sig) = header.strip_prefix("sha256=") else { return false };
    let Ok(expected) = decode_hex(hex_sig) else { return false };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    if computed.len() != expected.len() {
        return false;
    }
    computed.as_slice().ct_eq(&expected).into()
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ())).collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Extracts only the fields orchestration needs from a raw forge payload (§4.5 step 5).
/// Raw payloads are never persisted past this point.
fn extract_payload_summary(event_type: &str, payload: &Value) -> Value {
    let mut summary = json!({
        "repository": payload.get("repository").map(|r| json!({
            "nodeId": r.get("node_id"),
            "fullName": r.get("full_name"),
        })),
        "sender": payload.get("sender").map(|s| json!({
            "nodeId": s.get("node_id"),
            "login": s.get("login"),
        })),
        "action": payload.get("action"),
    });
    match event_type {
        "issues" => {
            if let Some(issue) = payload.get("issue") {
                summary["issue"] = json!({
                    "number": issue.get("number"),
                    "nodeId": issue.get("node_id"),
                    "title": issue.get("title"),
                    "state": issue.get("state"),
                });
            }
        }
        "issue_comment" => {
            if let Some(issue) = payload.get("issue") {
                summary["issue"] = json!({"number": issue.get("number"), "nodeId": issue.get("node_id")});
            }
            if let Some(comment) = payload.get("comment") {
                summary["comment"] = json!({"nodeId": comment.get("node_id"), "body": comment.get("body")});
            }
        }
        "pull_request" => {
            if let Some(pr) = payload.get("pull_request") {
                summary["pullRequest"] = json!({
                    "number": pr.get("number"),
                    "nodeId": pr.get("node_id"),
                    "headSha": pr.pointer("/head/sha"),
                    "merged": pr.get("merged"),
                });
            }
        }
        "check_suite" | "check_run" => {
            if let Some(check) = payload.get(event_type) {
                summary["check"] = json!({"status": check.get("status"), "conclusion": check.get("conclusion")});
            }
        }
        _ => {}
    }
    summary
}

/// `webhooks` job handler (§4.6). Resolves the project by repository node id, maps the
/// event/action pair to an internal event type, and marks the delivery terminal.
pub async fn normalize_and_apply(
    store: &StoreHandle,
    events: &crate::events::EventBus,
    job: Value,
) -> Result<(), ConductorError> {
    let delivery_id = job
        .get("deliveryId")
        .and_then(Value::as_str)
        .ok_or_else(|| ConductorError::validation("webhook job missing deliveryId"))?
        .to_string();
    let event_type = job.get("eventType").and_then(Value::as_str).unwrap_or_default().to_string();
    let action = job.get("action").and_then(Value::as_str).map(str::to_owned);
    let repository_node_id = job.get("repositoryNodeId").and_then(Value::as_str).map(str::to_owned);
    let payload_summary = job.get("payloadSummary").cloned().unwrap_or(Value::Null);

    let id = WebhookDeliveryId::from(delivery_id.as_str());

    let Some(repository_node_id) = repository_node_id else {
        mark_ignored(store, &id, "missing repository node id").await?;
        return Ok(());
    };

    let Some(event_kind) = map_event(&event_type, action.as_deref()) else {
        mark_ignored(store, &id, "unrecognized event/action").await?;
        return Ok(());
    };

    let repo = store
        .call({
            let repository_node_id = repository_node_id.clone();
            move |db| db.find_repo_by_node_id(&repository_node_id)
        })
        .await
        .map_err(downcast_conductor_error)?;
    let Some(repo) = repo else {
        mark_ignored(store, &id, "no project for repository").await?;
        return Ok(());
    };

    let idempotency_key = format!("webhook:{delivery_id}");
    let created = store
        .call({
            let project_id = repo.project_id.clone();
            let payload_summary = payload_summary.clone();
            let idempotency_key = idempotency_key.clone();
            move |db| db.create_event(&project_id, None, event_kind, EventClass::External, &payload_summary, &idempotency_key, "webhook")
        })
        .await
        .map_err(downcast_conductor_error)?;

    if let Some(event) = created {
        events.publish(event).await;
    }

    store
        .call({
            let id = id.clone();
            move |db| db.mark_delivery_processed(&id)
        })
        .await
        .map_err(downcast_conductor_error)?;
    Ok(())
}

async fn mark_ignored(store: &StoreHandle, id: &WebhookDeliveryId, reason: &str) -> Result<(), ConductorError> {
    let id = id.clone();
    let reason = reason.to_string();
    store.call(move |db| db.mark_delivery_ignored(&id, &reason)).await.map_err(downcast_conductor_error)
}

/// Recognized event/action → internal event type (§4.6). Everything else is `ignored`.
fn map_event(event_type: &str, action: Option<&str>) -> Option<&'static str> {
    match (event_type, action) {
        ("issues", Some("opened")) => Some("task.created"),
        ("issues", Some("closed")) => Some("task.closed"),
        ("issue_comment", Some("created")) => Some("task.commented"),
        ("pull_request", Some("opened" | "synchronize" | "closed")) => Some("run.pr_updated"),
        ("check_suite", Some("completed")) | ("check_run", Some("completed")) => Some("run.checks_completed"),
        _ => None,
    }
}

/// Re-enqueues deliveries a crash left `received` with no queue job (§4.5 recovery sweep).
/// Safe to call on every worker start: `add_job` is idempotent on `(queue, job_id)`.
pub async fn recover_stuck_deliveries(
    store: &StoreHandle,
    queue: &dyn QueueAdapter,
) -> Result<usize, ConductorError> {
    let stuck = store.call(|db| db.list_stuck_received_deliveries()).await.map_err(downcast_conductor_error)?;
    let count = stuck.len();
    for delivery in stuck {
        let payload = job_payload_for(&delivery);
        queue
            .add_job("webhooks", delivery.id.as_str(), payload)
            .await
            .map_err(ConductorError::Internal)?;
        state_mark_processing(store, &delivery.id).await?;
    }
    if count > 0 {
        tracing::info!(recovered = count, "recovered stuck webhook deliveries");
    }
    Ok(count)
}

async fn state_mark_processing(store: &StoreHandle, id: &WebhookDeliveryId) -> Result<(), ConductorError> {
    let id = id.clone();
    let job_id = id.as_str().to_string();
    store.call(move |db| db.mark_delivery_processing(&id, &job_id)).await.map_err(downcast_conductor_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_must_use_sha256_prefix() {
        assert!(!verify_signature("secret", b"body", Some("md5=abcd")));
    }

    #[test]
    fn valid_signature_verifies() {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(b"hello");
        let hex = hex_encode(&mac.finalize().into_bytes());
        let header = format!("sha256={hex}");
        assert!(verify_signature("secret", b"hello", Some(&header)));
    }

    #[test]
    fn tampered_body_fails_signature_check() {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(b"hello");
        let hex = hex_encode(&mac.finalize().into_bytes());
        let header = format!("sha256={hex}");
        assert!(!verify_signature("secret", b"goodbye", Some(&header)));
    }

    #[test]
    fn map_event_covers_the_known_table() {
        assert_eq!(map_event("issues", Some("opened")), Some("task.created"));
        assert_eq!(map_event("issues", Some("closed")), Some("task.closed"));
        assert_eq!(map_event("issue_comment", Some("created")), Some("task.commented"));
        assert_eq!(map_event("pull_request", Some("synchronize")), Some("run.pr_updated"));
        assert_eq!(map_event("check_run", Some("completed")), Some("run.checks_completed"));
        assert_eq!(map_event("issues", Some("labeled")), None);
    }

    #[tokio::test]
    async fn normalize_marks_ignored_when_repo_unknown() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let events = crate::events::EventBus::new();
        let job = json!({
            "deliveryId": "d1",
            "eventType": "issues",
            "action": "opened",
            "repositoryNodeId": "node_does_not_exist",
            "payloadSummary": Value::Null,
        });
        normalize_and_apply(&store, &events, job).await.unwrap();
        let delivery = store
            .call(|db| db.get_webhook_delivery(&WebhookDeliveryId::from("d1")))
            .await
            .unwrap();
        assert!(delivery.is_none());
    }

    #[tokio::test]
    async fn normalize_creates_event_for_known_repo() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let events = crate::events::EventBus::new();
        let project_id = store
            .call(|db| {
                let user = db.upsert_user_by_forge_id(1, "octocat", "t")?;
                let project = db.create_project(&user.id, 1, 2, "main", (20000, 20010))?;
                db.create_repo(&project.id, 3, "repo_node_1", "octocat", "hello", "main")?;
                Ok(project.id)
            })
            .await
            .unwrap();
        let job = json!({
            "deliveryId": "d2",
            "eventType": "issues",
            "action": "opened",
            "repositoryNodeId": "repo_node_1",
            "payloadSummary": json!({"issue": {"number": 1}}),
        });
        normalize_and_apply(&store, &events, job).await.unwrap();
        let events_in_project =
            store.call(move |db| db.query_stream_events_for_replay(0, &[project_id], 10)).await.unwrap();
        assert_eq!(events_in_project.len(), 1);
        assert_eq!(events_in_project[0].event_type, "task.created");
    }
}
