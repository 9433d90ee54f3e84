//! Real-time sync events over a broadcast channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use syncpipe_common::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::models::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A batch reached the sink and its checkpoint advanced
    BatchCommitted {
        job_id: Uuid,
        source_id: String,
        batch_id: Uuid,
        sequence: u32,
        rows: u64,
        checkpoint_value: Option<Value>,
        committed_at: DateTime<Utc>,
    },
    RunCompleted {
        job_id: Uuid,
        execution_id: Uuid,
        status: ExecutionStatus,
        rows_synced: u64,
        completed_at: DateTime<Utc>,
    },
}

/// Fan-out of [`SyncEvent`]s; slow subscribers lag, they never block a run
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(SyncEvent::RunCompleted {
            job_id: Uuid::nil(),
            execution_id: Uuid::nil(),
            status: ExecutionStatus::Succeeded,
            rows_synced: 0,
            completed_at: Utc::now(),
        });

        let mut rx = bus.subscribe();
        let event = SyncEvent::BatchCommitted {
            job_id: Uuid::nil(),
            source_id: "crm".into(),
            batch_id: Uuid::new_v4(),
            sequence: 0,
            rows: 3,
            checkpoint_value: Some(Value::Int(3)),
            committed_at: Utc::now(),
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(SyncEvent::RunCompleted {
            job_id: Uuid::nil(),
            execution_id: Uuid::nil(),
            status: ExecutionStatus::Failed,
            rows_synced: 0,
            completed_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(json["event"], "run_completed");
        assert_eq!(json["status"], "failed");
    }
}
