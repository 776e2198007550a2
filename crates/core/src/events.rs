//! In-process event bus. Every subsystem event goes out on a broadcast
//! channel for observers (CLI streaming, tests); audit-worthy events are
//! additionally mirrored into the `audit_logs` table.

use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::debug;

use spica_shared::{SpicaEvent, SpicaEventData};

use crate::db::{spawn_audit_log, AuditLogEntry};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SpicaEvent>,
    pool: SqlitePool,
}

impl EventBus {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender, pool }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SpicaEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Lagging subscribers are the subscriber's problem;
    /// audit mirroring is fire-and-forget.
    pub fn emit(&self, data: SpicaEventData) {
        let event = SpicaEvent::new(data);
        debug!(kind = event.data.kind(), trace_id = %event.trace_id, "Event emitted");

        if event.data.is_audit_worthy() {
            spawn_audit_log(
                self.pool.clone(),
                AuditLogEntry {
                    timestamp: event.timestamp,
                    event_type: event.data.kind().to_string(),
                    target_id: None,
                    result: "OK".to_string(),
                    reason: String::new(),
                    metadata: serde_json::to_value(&event.data).ok(),
                    trace_id: Some(event.trace_id.to_string()),
                },
            );
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = SpicaEventData>) {
        for data in events {
            self.emit(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use sqlx::sqlite::SqlitePoolOptions;
    use spica_shared::SpicaId;

    async fn setup() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_db(&pool, "sqlite::memory:").await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(setup().await);
        let mut rx = bus.subscribe();
        bus.emit(SpicaEventData::InstanceSpawned {
            instance_id: SpicaId::new(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.data.kind(), "INSTANCE_SPAWNED");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(setup().await);
        bus.emit(SpicaEventData::PhaseTransition {
            from: "Evolving".to_string(),
            to: "Yielding".to_string(),
        });
    }
}
