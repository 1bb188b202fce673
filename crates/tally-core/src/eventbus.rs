//! In-process broadcast of [`TallyEvent`]s.
//!
//! Transports publish raw state changes, message actions and ticks; the
//! counter store publishes its mirror writes. The rule registry and any
//! observers hold a [`Subscription`].

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::event::{EventMetadata, TallyEvent};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Source recorded for events published without one.
pub const DEFAULT_SOURCE: &str = "system";

type Envelope = (TallyEvent, EventMetadata);

/// Cloneable publishing side of the bus.
///
/// A subscriber falling more than the capacity behind loses the oldest
/// events; the loss is logged on its next receive.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
    name: String,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_name("default")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Returns `false` when nobody is subscribed.
    pub fn publish(&self, event: TallyEvent) -> bool {
        self.publish_from(event, DEFAULT_SOURCE)
    }

    pub fn publish_from(&self, event: TallyEvent, source: impl Into<String>) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            bus: self.name.clone(),
            filter: None,
        }
    }

    /// Subscription yielding state changes only.
    pub fn state_events(&self) -> Subscription {
        Subscription {
            filter: Some(TallyEvent::is_state_event),
            ..self.subscribe()
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the bus, optionally filtered.
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
    bus: String,
    filter: Option<fn(&TallyEvent) -> bool>,
}

impl Subscription {
    fn accepts(&self, event: &TallyEvent) -> bool {
        self.filter.map_or(true, |filter| filter(event))
    }

    /// Next accepted event, `None` once every [`EventBus`] handle is dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if self.accepts(&envelope.0) => return Some(envelope),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(bus = %self.bus, skipped, "Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next accepted event already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if self.accepts(&envelope.0) => return Some(envelope),
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StateChange;

    fn tick() -> TallyEvent {
        TallyEvent::Tick {
            at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert!(bus.publish(TallyEvent::state_changed("pump.energy", StateChange::value(1.0))));

        let (event, meta) = first.recv().await.unwrap();
        assert_eq!(event.type_name(), "StateChanged");
        assert_eq!(meta.source, DEFAULT_SOURCE);
        assert_eq!(second.recv().await.unwrap().0, event);
    }

    #[tokio::test]
    async fn test_state_events_skip_ticks() {
        let bus = EventBus::new();
        let mut rx = bus.state_events();

        bus.publish(tick());
        bus.publish_from(TallyEvent::state_changed("a", StateChange::value(2.0)), "tests");

        let (event, meta) = rx.recv().await.unwrap();
        assert!(event.is_state_event());
        assert_eq!(meta.source, "tests");
        bus.publish(tick());
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = EventBus::with_name("closing");
        let mut rx = bus.subscribe();
        bus.publish(tick());
        drop(bus);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_lagged_subscriber_keeps_newest() {
        let bus = EventBus::with_capacity("small", 2);
        let mut rx = bus.subscribe();
        for v in 0..4 {
            bus.publish(TallyEvent::state_changed("a", StateChange::value(v as f64)));
        }

        let (event, _) = rx.try_recv().unwrap();
        assert_eq!(event, TallyEvent::state_changed("a", StateChange::value(2.0)));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::with_name("empty");
        assert_eq!(bus.name(), "empty");
        assert!(!bus.publish(tick()));
    }
}
