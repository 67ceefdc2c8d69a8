use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ChangeEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out for change events, one broadcast channel per establishment.
/// The mutation and replay paths publish; views hold the receivers.
pub struct ChangeHub {
    channels: DashMap<Ulid, broadcast::Sender<ChangeEvent>>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Receiver for one establishment's events. The first subscriber
    /// brings the channel into existence.
    pub fn subscribe(&self, establishment_id: Ulid) -> broadcast::Receiver<ChangeEvent> {
        let sender = self
            .channels
            .entry(establishment_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to an establishment's subscribers. Dropped when nobody
    /// is watching the establishment.
    pub fn send(&self, establishment_id: Ulid, event: &ChangeEvent) {
        if let Some(sender) = self.channels.get(&establishment_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Tear down the channel for an establishment that is going away.
    pub fn remove(&self, establishment_id: &Ulid) {
        self.channels.remove(establishment_id);
    }
}
