//! The live bus: a process-internal broadcast hub feeding the browser UI
//! over WebSockets.
//!
//! Delivery is best effort: the channel buffer is bounded and slow
//! subscribers observe a lag marker and miss messages rather than applying
//! backpressure to the loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cadence::StatsdClient;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::broadcast;

use nutify_common::db::models::{CommandLog, CommandStats};
use nutify_common::metric_name::MetricName;
use nutify_common::metrics::StatsdClientExt;

/// Messages broadcast to every connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// One merged static+dynamic snapshot per poll tick, timestamps in the
    /// configured timezone.
    Sample { data: serde_json::Value },

    CommandExecuted {
        command: String,
        success: bool,
        output: Option<String>,
    },
    CommandStatsUpdate { stats: CommandStats },
    CommandLogsUpdate { logs: Vec<CommandLog> },
    VariableUpdate {
        name: String,
        old_value: Option<String>,
        new_value: String,
        success: bool,
    },

    /// A persisted NUT event, after the pipeline ran.
    NutEvent { data: serde_json::Value },

    UsbDisconnect {
        timestamp: String,
        status: String,
    },
    UsbReconnectAttempt {
        timestamp: String,
        attempt: u32,
    },
    ContainerRestartNeeded {
        timestamp: String,
        reason: String,
    },
    StorageUnhealthy { consecutive_failures: u32 },
}

impl BusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sample { .. } => "sample",
            Self::CommandExecuted { .. } => "command_executed",
            Self::CommandStatsUpdate { .. } => "command_stats_update",
            Self::CommandLogsUpdate { .. } => "command_logs_update",
            Self::VariableUpdate { .. } => "variable_update",
            Self::NutEvent { .. } => "nut_event",
            Self::UsbDisconnect { .. } => "usb_disconnect",
            Self::UsbReconnectAttempt { .. } => "usb_reconnect_attempt",
            Self::ContainerRestartNeeded { .. } => "container_restart_needed",
            Self::StorageUnhealthy { .. } => "storage_unhealthy",
        }
    }
}

/// The broadcast hub. Cheap to clone via `Arc`.
pub struct BusHub {
    tx: broadcast::Sender<BusEvent>,
    metrics: Arc<StatsdClient>,
    dropped: AtomicU64,
}

impl BusHub {
    pub fn new(capacity: usize, metrics: Arc<StatsdClient>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            metrics,
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish to all current subscribers. With nobody connected the event
    /// is simply discarded.
    pub fn publish(&self, event: BusEvent) {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => {
                trace!("bus: {} -> {} subscriber(s)", kind, receivers);
            }
            Err(_) => {
                trace!("bus: {} with no subscribers", kind);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Record messages a lagging subscriber skipped.
    pub fn note_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
        self.metrics
            .incr_with_tags(MetricName::BusDropped)
            .send();
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutify_common::metrics;

    fn hub() -> BusHub {
        BusHub::new(4, Arc::new(metrics::builder("nutify", &None, 8125).unwrap()))
    }

    #[actix_rt::test]
    async fn test_publish_and_subscribe() {
        let hub = hub();
        let mut rx = hub.subscribe();
        hub.publish(BusEvent::Sample {
            data: serde_json::json!({"ups_status": "OL"}),
        });
        match rx.recv().await.unwrap() {
            BusEvent::Sample { data } => assert_eq!(data["ups_status"], "OL"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[actix_rt::test]
    async fn test_lagging_subscriber_observes_lag() {
        let hub = hub();
        let mut rx = hub.subscribe();
        for i in 0..10 {
            hub.publish(BusEvent::UsbReconnectAttempt {
                timestamp: format!("t{i}"),
                attempt: i,
            });
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                hub.note_dropped(skipped);
                assert!(skipped >= 6);
                assert!(hub.dropped_total() >= 6);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        // Subsequent receives resume from the retained tail.
        assert!(rx.recv().await.is_ok());
    }

    #[actix_rt::test]
    async fn test_publish_without_subscribers_is_silent() {
        let hub = hub();
        hub.publish(BusEvent::StorageUnhealthy {
            consecutive_failures: 3,
        });
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = BusEvent::UsbDisconnect {
            timestamp: "2024-06-01 12:00:00".to_owned(),
            status: "NOCOMM".to_owned(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "usb_disconnect");
        assert_eq!(value["status"], "NOCOMM");

        let parsed: BusEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.kind(), "usb_disconnect");
    }
}
