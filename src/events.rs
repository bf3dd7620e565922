//! Event log fan-out for SSE delivery (§4.3).
//!
//! Persistence (append-only, global sequence) lives in `crate::store::db_events`; this
//! module is the pub/sub half — a `tokio::sync::broadcast` channel per project id held
//! in a registry behind a `RwLock`, generalizing the teacher's single
//! `broadcast::Sender<String>` fan-out in `ws.rs`/`server.rs` to per-project channels.

use std::collections::HashMap;
use std::sync::Arc;

use conductor_common::ProjectId;
use tokio::sync::{RwLock, broadcast};

use crate::store::models::Event;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<ProjectId, broadcast::Sender<Event>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { channels: Arc::new(RwLock::new(HashMap::new())) }
    }

    async fn sender_for(&self, project_id: &ProjectId) -> broadcast::Sender<Event> {
        if let Some(tx) = self.channels.read().await.get(project_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(project_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Called by C1 transactions after commit (§4.3: "the pub/sub notification happens
    /// after the transaction commits"). A project with no subscribers silently drops
    /// the event — `broadcast::Sender::send` failing with no receivers is not an error.
    pub async fn publish(&self, event: Event) {
        let tx = self.sender_for(&event.project_id).await;
        let _ = tx.send(event);
    }

    /// Subscribes to a fixed set of project channels. The returned receiver set is
    /// shared per process for identical channel sets in the sense that each channel's
    /// underlying `Sender` is reused — subscribing twice to the same project does not
    /// create two independent broadcast topics, only two receivers on the same one, so
    /// no duplicate upstream delivery is introduced (§4.3).
    pub async fn subscribe(&self, project_ids: &[ProjectId]) -> ProjectSubscription {
        let mut receivers = Vec::with_capacity(project_ids.len());
        for project_id in project_ids {
            receivers.push(self.sender_for(project_id).await.subscribe());
        }
        ProjectSubscription { receivers }
    }
}

/// A live subscription across one or more project channels. `recv_any` races all
/// receivers and returns whichever event arrives first, in publish order per channel.
pub struct ProjectSubscription {
    receivers: Vec<broadcast::Receiver<Event>>,
}

impl ProjectSubscription {
    pub async fn recv_any(&mut self) -> Option<Event> {
        if self.receivers.is_empty() {
            // No channels to wait on; block forever rather than busy-loop or return.
            std::future::pending::<()>().await;
            return None;
        }
        let futures = self.receivers.iter_mut().map(|rx| Box::pin(rx.recv()));
        let (result, _index, _rest) = futures::future::select_all(futures).await;
        match result {
            Ok(event) => Some(event),
            // A slow consumer that lagged behind the broadcast buffer; the SSE layer
            // treats this the same as "too far behind" and issues a refresh (§4.12).
            Err(broadcast::error::RecvError::Lagged(_)) => None,
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::{EventClass, EventId};
    use serde_json::Value;

    fn sample_event(project_id: &ProjectId, sequence: i64) -> Event {
        Event {
            id: EventId::new(),
            sequence,
            project_id: project_id.clone(),
            run_id: None,
            event_type: "task.created".into(),
            class: EventClass::External,
            payload: Value::Null,
            idempotency_key: format!("k{sequence}"),
            source: "webhook".into(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event_for_its_project() {
        let bus = EventBus::new();
        let project_id = ProjectId::new();
        let mut sub = bus.subscribe(&[project_id.clone()]).await;
        bus.publish(sample_event(&project_id, 1)).await;
        let received = sub.recv_any().await.unwrap();
        assert_eq!(received.sequence, 1);
    }

    #[tokio::test]
    async fn subscriber_does_not_see_events_for_other_projects() {
        let bus = EventBus::new();
        let project_a = ProjectId::new();
        let project_b = ProjectId::new();
        let mut sub = bus.subscribe(&[project_a.clone()]).await;
        bus.publish(sample_event(&project_b, 1)).await;
        bus.publish(sample_event(&project_a, 2)).await;
        let received = sub.recv_any().await.unwrap();
        assert_eq!(received.project_id, project_a);
        assert_eq!(received.sequence, 2);
    }

    #[tokio::test]
    async fn two_subscribers_to_same_project_both_receive_the_event() {
        let bus = EventBus::new();
        let project_id = ProjectId::new();
        let mut sub1 = bus.subscribe(&[project_id.clone()]).await;
        let mut sub2 = bus.subscribe(&[project_id.clone()]).await;
        bus.publish(sample_event(&project_id, 1)).await;
        assert_eq!(sub1.recv_any().await.unwrap().sequence, 1);
        assert_eq!(sub2.recv_any().await.unwrap().sequence, 1);
    }
}
