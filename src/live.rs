//! In-process fan-out of change notifications to connected admin browsers.
//!
//! Events only tell the dashboard which data to refetch. A browser that is not
//! connected when an event fires never sees it, and a slow one may skip some.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveEventKind {
    NewConsultation,
    NewAssessment,
    FlaggedResponse,
    FollowUpChanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveEvent {
    pub id: Uuid,
    pub kind: LiveEventKind,
    pub entity_id: Uuid,
    pub patient_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl LiveEvent {
    pub fn new(kind: LiveEventKind, entity_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entity_id,
            patient_id: None,
            occurred_at: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn for_patient(mut self, patient_id: Uuid) -> Self {
        self.patient_id = Some(patient_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Clone)]
pub struct LiveHub {
    tx: broadcast::Sender<LiveEvent>,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many connections the event was queued for (0 when nobody listens).
    pub fn publish(&self, event: LiveEvent) -> usize {
        let kind = event.kind;
        match self.tx.send(event) {
            Ok(n) => {
                tracing::debug!(?kind, receivers = n, "live event published");
                n
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn publishing_without_listeners_is_a_no_op() {
        let hub = LiveHub::new(4);
        let n = hub.publish(LiveEvent::new(LiveEventKind::NewConsultation, Uuid::new_v4()));
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_event() {
        let hub = LiveHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.connection_count(), 2);

        let patient = Uuid::new_v4();
        let assessment = Uuid::new_v4();
        let sent = hub.publish(
            LiveEvent::new(LiveEventKind::NewAssessment, assessment).for_patient(patient),
        );
        assert_eq!(sent, 2);

        for rx in [&mut a, &mut b] {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.kind, LiveEventKind::NewAssessment);
            assert_eq!(ev.entity_id, assessment);
            assert_eq!(ev.patient_id, Some(patient));
        }
    }

    #[tokio::test]
    async fn slow_receivers_lag_instead_of_blocking() {
        let hub = LiveHub::new(2);
        let mut rx = hub.subscribe();
        for _ in 0..5 {
            hub.publish(LiveEvent::new(LiveEventKind::FlaggedResponse, Uuid::new_v4()));
        }
        match rx.recv().await {
            Err(RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn events_serialize_with_snake_case_kind() {
        let ev = LiveEvent::new(LiveEventKind::FollowUpChanged, Uuid::nil())
            .with_payload(serde_json::json!({ "status": "completed" }));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["kind"], "follow_up_changed");
        assert_eq!(v["payload"]["status"], "completed");
        assert!(v["patient_id"].is_null());
    }
}
