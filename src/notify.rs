use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::ReservationEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for reservation changes, one channel per calendar date.
pub struct NotifyHub {
    channels: DashMap<NaiveDate, broadcast::Sender<ReservationEvent>>,
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

    /// Subscribe to changes on `date`. Creates the channel if needed.
    pub fn subscribe(&self, date: NaiveDate) -> broadcast::Receiver<ReservationEvent> {
        let sender = self
            .channels
            .entry(date)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to every date the event touches. No-op for dates nobody listens on.
    pub fn send(&self, event: &ReservationEvent) {
        for date in event.dates() {
            if let Some(sender) = self.channels.get(&date) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Drop the channel for `date` once its last subscriber has gone.
    pub fn release(&self, date: &NaiveDate) {
        self.channels
            .remove_if(date, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
