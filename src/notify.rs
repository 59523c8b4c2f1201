use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::collab::CourtEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub, one channel per court.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<CourtEvent>>,
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

    /// Subscribe to a court's events. Creates the channel if needed.
    pub fn subscribe(&self, court_id: Ulid) -> broadcast::Receiver<CourtEvent> {
        let sender = self
            .channels
            .entry(court_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, court_id: Ulid, event: &CourtEvent) {
        if let Some(sender) = self.channels.get(&court_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn subscriber_count(&self, court_id: &Ulid) -> usize {
        self.channels
            .get(court_id)
            .map_or(0, |s| s.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::CourtEventKind;

    fn event(court_id: Ulid) -> CourtEvent {
        CourtEvent {
            court_id,
            kind: CourtEventKind::ItemAdmitted,
            subject_id: Ulid::new(),
            span: None,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let court = Ulid::new();
        let mut rx = hub.subscribe(court);
        assert_eq!(hub.subscriber_count(&court), 1);

        let sent = event(court);
        hub.send(court, &sent);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let court = Ulid::new();
        hub.send(court, &event(court));
        assert_eq!(hub.subscriber_count(&court), 0);
    }

    #[tokio::test]
    async fn channels_are_per_court() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        hub.send(b, &event(b));
        hub.send(a, &event(a));
        assert_eq!(rx_a.recv().await.unwrap().court_id, a);
        assert!(rx_a.try_recv().is_err());
    }
}
