use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::SlotTime;

const CHANNEL_CAPACITY: usize = 256;

/// Post-commit message for the agency that owns a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    BookingCancelled {
        agency_id: Ulid,
        booking_id: Ulid,
        date: NaiveDate,
        time: SlotTime,
        party_size: u32,
    },
    BookingModified {
        agency_id: Ulid,
        booking_id: Ulid,
        date: NaiveDate,
        time: SlotTime,
        old_party_size: u32,
        new_party_size: u32,
        old_precise_time: NaiveTime,
        new_precise_time: NaiveTime,
    },
    GuestListRevoked {
        agency_id: Ulid,
        booking_id: Ulid,
        date: NaiveDate,
        time: SlotTime,
    },
}

impl Notification {
    pub fn agency_id(&self) -> Ulid {
        match self {
            Notification::BookingCancelled { agency_id, .. }
            | Notification::BookingModified { agency_id, .. }
            | Notification::GuestListRevoked { agency_id, .. } => *agency_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Notification::BookingCancelled { .. } => "booking_cancelled",
            Notification::BookingModified { .. } => "booking_modified",
            Notification::GuestListRevoked { .. } => "guest_list_revoked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound delivery (email, messenger, ...). Runs after the change is
/// durable; a failure never undoes it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes each notification to the log as one JSON object.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload =
            serde_json::to_string(notification).map_err(|e| NotifyError(e.to_string()))?;
        info!(agency = %notification.agency_id(), "notify {payload}");
        Ok(())
    }
}

/// Fan-out point for committed changes: per-agency broadcast channels for
/// in-process subscribers plus the outbound `Notifier`.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    sink: Arc<dyn Notifier>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::with_notifier(Arc::new(LogNotifier))
    }

    pub fn with_notifier(sink: Arc<dyn Notifier>) -> Self {
        Self {
            channels: DashMap::new(),
            sink,
        }
    }

    /// Subscribe to one agency's notifications. Creates the channel if needed.
    pub fn subscribe(&self, agency_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(agency_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to subscribers, then hand off to the sink on its own task.
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.channels.get(&notification.agency_id()) {
            let _ = sender.send(notification.clone());
        }
        metrics::counter!(
            crate::observability::NOTIFICATIONS_TOTAL,
            "kind" => notification.label()
        )
        .increment(1);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime, dropping {} notification", notification.label());
            return;
        };
        let sink = self.sink.clone();
        handle.spawn(async move {
            if let Err(e) = sink.deliver(&notification).await {
                warn!(agency = %notification.agency_id(), "{e}");
                metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording(Mutex<Vec<Notification>>);

    #[async_trait]
    impl Notifier for Recording {
        async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(n.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn deliver(&self, _: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError("smtp down".into()))
        }
    }

    fn revoked(agency_id: Ulid) -> Notification {
        Notification::GuestListRevoked {
            agency_id,
            booking_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            time: SlotTime::from_hm(10, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_only_own_agency() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let mut rx = hub.subscribe(mine);

        hub.send(revoked(Ulid::new()));
        let n = revoked(mine);
        hub.send(n.clone());

        assert_eq!(rx.recv().await.unwrap(), n);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sink_gets_every_notification() {
        let sink = Arc::new(Recording(Mutex::new(Vec::new())));
        let hub = NotifyHub::with_notifier(sink.clone());
        let n = revoked(Ulid::new());
        hub.send(n.clone());

        for _ in 0..50 {
            if !sink.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*sink.0.lock().unwrap(), vec![n]);
    }

    #[tokio::test]
    async fn failing_sink_is_not_fatal() {
        let hub = NotifyHub::with_notifier(Arc::new(Failing));
        let agency = Ulid::new();
        let mut rx = hub.subscribe(agency);
        hub.send(revoked(agency));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn payload_is_tagged_json() {
        let n = revoked(Ulid::new());
        let json: serde_json::Value = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], "guest_list_revoked");
        assert_eq!(json["date"], "2025-06-01");
    }
}
