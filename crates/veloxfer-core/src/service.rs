//! Event service - transfer progress pub/sub
//!
//! The monitor publishes events through this bus so subscribers (bot
//! frontends, dashboards, test harnesses) run outside the monitor's
//! critical section. Channels are unbounded, so publishing never waits
//! on a slow consumer.

use crate::types::{SpeedData, TransferStats};
use std::collections::HashMap;
use std::sync::Mutex;

/// Messages published by the engine
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A transfer was registered
    Started {
        transfer_id: String,
        user_id: String,
        file_name: String,
        file_size: u64,
        /// Oracle seed, bytes per second
        predicted_speed: Option<f64>,
    },
    /// Progress snapshot for a running transfer
    Progress(SpeedData),
    /// A transfer finished successfully
    Completed(TransferStats),
    /// A transfer finished with an error
    Failed {
        transfer_id: String,
        reason: String,
        kind: String,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferEvent::Started { transfer_id, .. } => transfer_id,
            TransferEvent::Progress(data) => &data.transfer_id,
            TransferEvent::Completed(stats) => &stats.transfer_id,
            TransferEvent::Failed { transfer_id, .. } => transfer_id,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed(_) | TransferEvent::Failed { .. }
        )
    }
}

/// Publish/subscribe channel for transfer events
#[derive(Default)]
pub struct EventBus {
    global: Mutex<Vec<async_channel::Sender<TransferEvent>>>,
    per_transfer: Mutex<HashMap<String, Vec<async_channel::Sender<TransferEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event the engine publishes
    pub fn subscribe(&self) -> async_channel::Receiver<TransferEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.global.lock().unwrap().push(tx);
        rx
    }

    /// Subscribe to events for one transfer. The subscription is dropped
    /// after the transfer's terminal event is delivered.
    pub fn subscribe_transfer(&self, transfer_id: &str) -> async_channel::Receiver<TransferEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.per_transfer
            .lock()
            .unwrap()
            .entry(transfer_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver an event to all matching subscribers. Sync and non-blocking;
    /// safe to call right after releasing a registry lock.
    pub fn publish(&self, event: TransferEvent) {
        {
            let mut global = self.global.lock().unwrap();
            global.retain(|tx| tx.try_send(event.clone()).is_ok());
        }

        let id = event.transfer_id().to_string();
        let mut per_transfer = self.per_transfer.lock().unwrap();
        if let Some(subs) = per_transfer.get_mut(&id) {
            subs.retain(|tx| tx.try_send(event.clone()).is_ok());
            if subs.is_empty() || event.is_terminal() {
                per_transfer.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.global.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(id: &str, bytes: u64) -> TransferEvent {
        TransferEvent::Progress(SpeedData {
            timestamp: 0.0,
            bytes_transferred: bytes,
            total_bytes: 100,
            speed: 10.0,
            progress_percent: bytes as f64,
            eta_seconds: 1.0,
            transfer_id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_global_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.publish(TransferEvent::Started {
            transfer_id: "t1".into(),
            user_id: "u1".into(),
            file_name: "a.bin".into(),
            file_size: 100,
            predicted_speed: None,
        });
        bus.publish(progress("t1", 50));

        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::Started { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::Progress(_)
        ));
    }

    #[tokio::test]
    async fn test_per_transfer_subscription_filters_and_expires() {
        let bus = EventBus::new();
        let rx = bus.subscribe_transfer("t1");

        bus.publish(progress("other", 10));
        bus.publish(progress("t1", 20));
        bus.publish(TransferEvent::Failed {
            transfer_id: "t1".into(),
            reason: "network error: reset".into(),
            kind: "network".into(),
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.transfer_id(), "t1");
        assert!(matches!(rx.recv().await.unwrap(), TransferEvent::Failed { .. }));
        // Terminal event dropped the subscription
        assert!(bus.per_transfer.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(progress("t1", 1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
