//! Notification sinks

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sources::{AlertKind, NotificationSink};

/// Logs alerts through `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, kind: AlertKind, payload: serde_json::Value) {
        match kind {
            AlertKind::CircuitOpened | AlertKind::MemoryHard | AlertKind::BacklogHigh => {
                warn!(alert = %kind, payload = %payload, "Operator alert")
            }
            _ => info!(alert = %kind, payload = %payload, "Operator alert"),
        }
    }
}

/// An alert delivered over a channel
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: AlertKind,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Forwards alerts to a bounded channel. Alerts are dropped when the
/// receiver lags or is gone.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, kind: AlertKind, payload: serde_json::Value) {
        let notification = Notification {
            kind,
            payload,
            at: Utc::now(),
        };
        if let Err(e) = self.tx.try_send(notification) {
            debug!(alert = %kind, error = %e, "Dropped notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_notifier_never_blocks() {
        let (notifier, mut rx) = ChannelNotifier::new(1);
        notifier.notify(AlertKind::CircuitOpened, json!({"failures": 5}));
        // Channel full: dropped, not blocked
        notifier.notify(AlertKind::CircuitClosed, json!({}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, AlertKind::CircuitOpened);
        assert_eq!(first.payload["failures"], 5);
        assert!(rx.try_recv().is_err());

        drop(rx);
        notifier.notify(AlertKind::MemorySoft, json!({}));
    }
}
