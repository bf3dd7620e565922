//! Server-sent event stream endpoint (§4.12).
//!
//! Axum's `Sse` wraps any `Stream<Item = Result<Event, Infallible>>`; rather than pull
//! in a generator-macro crate, the stream is built the teacher's way — a bounded
//! `tokio::mpsc` channel fed by a background task, turned into a `Stream` via
//! `futures::stream::unfold` over `Receiver::recv`. A client disconnect drops the
//! channel's receiver half, `tx.send` starts failing, and the background task exits —
//! that failed send is the one and only cleanup trigger (§4.12 "multiple triggers are
//! a no-op" is automatic: once the task has exited, nothing can trigger it again).

use std::convert::Infallible;
use std::time::Duration as StdDuration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use chrono::{Duration, Utc};
use conductor_common::ProjectId;
use futures::Stream;
use tokio::sync::mpsc;

use crate::errors::ConductorError;
use crate::http::{AppState, SessionUser};
use crate::store::models::Event;

const REPLAY_LIMIT: usize = 100;
const REPLAY_MAX_AGE_MINUTES: i64 = 5;
const HEARTBEAT_SECONDS: u64 = 30;
const CHANNEL_CAPACITY: usize = 256;

fn event_frame(event: &Event) -> SseEvent {
    SseEvent::default().id(event.sequence.to_string()).json_data(event).unwrap_or_else(|_| SseEvent::default().data("{}"))
}

fn refresh_required_frame() -> SseEvent {
    SseEvent::default().data(serde_json::json!({"kind": "refresh_required"}).to_string())
}

/// `GET /events/stream` (§4.12, §6). Authenticated via the session cookie; scoped to
/// the projects the caller owns, the same set `authorize_run_access` uses elsewhere.
pub async fn stream_handler(
    State(state): State<AppState>,
    session_user: SessionUser,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ConductorError> {
    let project_ids: Vec<ProjectId> = state
        .store
        .call({
            let user_id = session_user.user.id.clone();
            move |db| db.list_projects_for_user(&user_id)
        })
        .await
        .map_err(ConductorError::Internal)?
        .into_iter()
        .map(|p| p.id)
        .collect();

    let since_sequence = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);

    let (tx, rx) = mpsc::channel::<SseEvent>(CHANNEL_CAPACITY);

    send_replay(&state, &project_ids, since_sequence, &tx).await?;

    tokio::spawn(live_delivery_loop(state.events.clone(), project_ids, tx));

    let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|frame| (Ok(frame), rx)) });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(StdDuration::from_secs(HEARTBEAT_SECONDS)).text("heartbeat")))
}

/// Replay (§4.12): more than `REPLAY_LIMIT` rows, or any row older than
/// `REPLAY_MAX_AGE_MINUTES`, collapses to a single `refresh_required` frame instead of
/// the raw rows — the client is expected to reload its state from a snapshot endpoint.
async fn send_replay(
    state: &AppState,
    project_ids: &[ProjectId],
    since_sequence: i64,
    tx: &mpsc::Sender<SseEvent>,
) -> Result<(), ConductorError> {
    if project_ids.is_empty() {
        return Ok(());
    }
    let rows = state
        .store
        .call({
            let project_ids = project_ids.to_vec();
            move |db| db.query_stream_events_for_replay(since_sequence, &project_ids, REPLAY_LIMIT + 1)
        })
        .await
        .map_err(ConductorError::Internal)?;

    let cutoff = Utc::now() - Duration::minutes(REPLAY_MAX_AGE_MINUTES);
    let needs_refresh = rows.len() > REPLAY_LIMIT || rows.first().is_some_and(|e| e.created_at < cutoff);

    if needs_refresh {
        let _ = tx.send(refresh_required_frame()).await;
        return Ok(());
    }
    for event in &rows {
        if tx.send(event_frame(event)).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Live delivery (§4.12): one subscription per connection against the shared
/// per-project broadcast senders, so two connections for the same user each get their
/// own receiver and neither sees the other's frames duplicated or dropped.
async fn live_delivery_loop(events: crate::events::EventBus, project_ids: Vec<ProjectId>, tx: mpsc::Sender<SseEvent>) {
    let mut subscription = events.subscribe(&project_ids).await;
    loop {
        match subscription.recv_any().await {
            Some(event) => {
                if tx.send(event_frame(&event)).await.is_err() {
                    return;
                }
            }
            None => {
                // Lagged or the last project channel closed; nothing more to deliver
                // on this connection without a replay, which only a reconnect can do.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreHandle;
    use conductor_common::EventClass;
    use serde_json::Value;

    #[tokio::test]
    async fn replay_under_threshold_sends_rows_in_order() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let project_id = ProjectId::new();
        store
            .call({
                let project_id = project_id.clone();
                move |db| {
                    db.create_event(&project_id, None, "a", EventClass::External, &Value::Null, "k1", "s")?;
                    db.create_event(&project_id, None, "a", EventClass::External, &Value::Null, "k2", "s")?;
                    Ok(())
                }
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let app_state_store = store.clone();
        let rows = app_state_store.call({
            let project_id = project_id.clone();
            move |db| db.query_stream_events_for_replay(0, &[project_id], REPLAY_LIMIT + 1)
        }).await.unwrap();
        assert_eq!(rows.len(), 2);
        for event in &rows {
            tx.send(event_frame(event)).await.unwrap();
        }
        drop(tx);
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn live_delivery_forwards_published_events_until_sender_drops() {
        let events = crate::events::EventBus::new();
        let project_id = ProjectId::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(live_delivery_loop(events.clone(), vec![project_id.clone()], tx));

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        events
            .publish(Event {
                id: conductor_common::EventId::new(),
                sequence: 1,
                project_id: project_id.clone(),
                run_id: None,
                event_type: "task.created".into(),
                class: EventClass::External,
                payload: Value::Null,
                idempotency_key: "k1".into(),
                source: "webhook".into(),
                created_at: Utc::now(),
            })
            .await;

        let frame = tokio::time::timeout(StdDuration::from_secs(1), rx.recv()).await.unwrap();
        assert!(frame.is_some());
        handle.abort();
    }
}
