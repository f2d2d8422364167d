use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ReservationEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY per building. Every committed
/// reservation mutation is published to the building's channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<ReservationEvent>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to notifications for a building. Creates the channel if needed.
    pub fn subscribe(&self, building_id: Ulid) -> broadcast::Receiver<ReservationEvent> {
        let sender = self
            .channels
            .entry(building_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, building_id: Ulid, event: &ReservationEvent) {
        if let Some(sender) = self.channels.get(&building_id) {
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReservationStatus;
    use tokio_test::assert_ok;

    fn event(building_id: Ulid) -> ReservationEvent {
        ReservationEvent {
            building_id,
            reservation_id: Ulid::new(),
            status: ReservationStatus::Pending,
            slot_label: Some("1F-A-001".into()),
            start: 1_000,
            end: 2_000,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let bid = Ulid::new();
        let mut rx = hub.subscribe(bid);

        let ev = event(bid);
        hub.send(bid, &ev);

        let received = assert_ok!(rx.recv().await);
        assert_eq!(received, ev);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let bid = Ulid::new();
        // No subscriber; must not panic
        hub.send(bid, &event(bid));
    }

    #[tokio::test]
    async fn channels_are_isolated_per_building() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);

        hub.send(b, &event(b));
        hub.send(a, &event(a));

        let received = assert_ok!(rx_a.recv().await);
        assert_eq!(received.building_id, a);
        assert!(rx_a.try_recv().is_err());
    }
}
