use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Prefix of the LISTEN channel name for a tutor's calendar.
pub const TUTOR_CHANNEL_PREFIX: &str = "tutor_";

pub fn tutor_channel(tutor_id: Ulid) -> String {
    format!("{TUTOR_CHANNEL_PREFIX}{tutor_id}")
}

pub fn parse_tutor_channel(channel: &str) -> Option<Ulid> {
    channel
        .strip_prefix(TUTOR_CHANNEL_PREFIX)
        .and_then(|id| Ulid::from_string(id).ok())
}

/// Per-tutor broadcast of committed events. Anything showing a tutor's
/// calendar subscribes here instead of polling.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Creates the channel on first subscription.
    pub fn subscribe(&self, tutor_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(tutor_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, tutor_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&tutor_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Publish on the channel the event belongs to, if any.
    pub fn publish(&self, event: &Event) {
        if let Some(tutor_id) = event.tutor_id() {
            self.send(tutor_id, event);
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BookingStatus;

    fn status_event(tutor_id: Ulid) -> Event {
        Event::BookingStatusChanged {
            id: Ulid::new(),
            tutor_id,
            student_id: Ulid::new(),
            status: BookingStatus::Confirmed,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let tutor = Ulid::new();
        let mut rx = hub.subscribe(tutor);

        let event = status_event(tutor);
        hub.publish(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_tutor_events_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let mut rx = hub.subscribe(mine);

        hub.publish(&status_event(Ulid::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let tutor = Ulid::new();
        hub.send(tutor, &status_event(tutor));
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(Ulid::new());
        drop(rx);
        hub.prune();
        assert!(hub.channels.is_empty());
    }

    #[test]
    fn channel_names_roundtrip() {
        let tutor = Ulid::new();
        assert_eq!(parse_tutor_channel(&tutor_channel(tutor)), Some(tutor));
        assert_eq!(parse_tutor_channel("resource_x"), None);
        assert_eq!(parse_tutor_channel("tutor_not-a-ulid"), None);
    }
}
