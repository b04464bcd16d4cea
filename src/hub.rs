//! Broadcast Hub: named subscriber groups over per-connection outbound queues.
//!
//! Each connection attaches one bounded sender. Publishing never blocks: a
//! full queue drops the event for that subscriber only, and a disconnected
//! queue is detached.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::protocol::ServerMessage;

pub const VIEWERS_TOPIC: &str = "viewers";

pub type ConnectionId = u64;
pub type Sink = SyncSender<Arc<ServerMessage>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct HubState {
    sinks: HashMap<ConnectionId, Sink>,
    topics: HashMap<String, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct BroadcastHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn attach(&self, id: ConnectionId, sink: Sink) {
        lock(&self.state).sinks.insert(id, sink);
    }

    /// Remove the connection's sink and every subscription it holds.
    pub fn detach(&self, id: ConnectionId) {
        let mut state = lock(&self.state);
        state.sinks.remove(&id);
        state.topics.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
    }

    /// Idempotent. Returns false when the connection has no attached sink.
    pub fn subscribe(&self, topic: &str, id: ConnectionId) -> bool {
        let mut state = lock(&self.state);
        if !state.sinks.contains_key(&id) {
            return false;
        }
        state.topics.entry(topic.to_string()).or_default().insert(id);
        true
    }

    /// Idempotent.
    pub fn unsubscribe(&self, topic: &str, id: ConnectionId) {
        let mut state = lock(&self.state);
        if let Some(members) = state.topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                state.topics.remove(topic);
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.state).topics.get(topic).map_or(0, |m| m.len())
    }

    /// Deliver to everyone subscribed to `topic` at this moment.
    pub fn publish(&self, topic: &str, message: ServerMessage) -> DeliveryReport {
        let targets: Vec<(ConnectionId, Sink)> = {
            let state = lock(&self.state);
            match state.topics.get(topic) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| state.sinks.get(id).map(|s| (*id, s.clone())))
                    .collect(),
                None => Vec::new(),
            }
        };

        let message = Arc::new(message);
        let mut report = DeliveryReport::default();
        let mut gone = Vec::new();
        for (id, sink) in targets {
            match sink.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::debug!("subscriber {} queue full; dropping {} event", id, topic);
                    report.dropped += 1;
                }
                Err(TrySendError::Disconnected(_)) => {
                    report.dropped += 1;
                    gone.push(id);
                }
            }
        }
        for id in gone {
            self.detach(id);
        }
        if report.dropped > 0 {
            self.dropped_total
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
        }
        report
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn alert() -> ServerMessage {
        ServerMessage::Error {
            reason: "test".into(),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.publish(VIEWERS_TOPIC, alert()), DeliveryReport::default());
    }

    #[test]
    fn late_subscriber_gets_nothing_retroactively() {
        let hub = BroadcastHub::new();
        let (tx, rx) = mpsc::sync_channel(4);
        hub.attach(1, tx);
        hub.publish(VIEWERS_TOPIC, alert());
        assert!(hub.subscribe(VIEWERS_TOPIC, 1));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.publish(VIEWERS_TOPIC, alert()).delivered, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let hub = BroadcastHub::new();
        let (tx, rx) = mpsc::sync_channel(4);
        hub.attach(1, tx);
        hub.subscribe(VIEWERS_TOPIC, 1);
        hub.subscribe(VIEWERS_TOPIC, 1);
        assert_eq!(hub.subscriber_count(VIEWERS_TOPIC), 1);
        hub.publish(VIEWERS_TOPIC, alert());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        hub.unsubscribe(VIEWERS_TOPIC, 1);
        hub.unsubscribe(VIEWERS_TOPIC, 1);
        assert_eq!(hub.subscriber_count(VIEWERS_TOPIC), 0);
    }

    #[test]
    fn full_queue_does_not_block_other_subscribers() {
        let hub = BroadcastHub::new();
        let (slow_tx, _slow_rx) = mpsc::sync_channel(1);
        let (fast_tx, fast_rx) = mpsc::sync_channel(8);
        hub.attach(1, slow_tx);
        hub.attach(2, fast_tx);
        hub.subscribe(VIEWERS_TOPIC, 1);
        hub.subscribe(VIEWERS_TOPIC, 2);

        hub.publish(VIEWERS_TOPIC, alert());
        let report = hub.publish(VIEWERS_TOPIC, alert());
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 1 });
        assert_eq!(fast_rx.try_iter().count(), 2);
        assert_eq!(hub.dropped_total(), 1);
    }

    #[test]
    fn disconnected_sink_is_detached() {
        let hub = BroadcastHub::new();
        let (tx, rx) = mpsc::sync_channel(1);
        hub.attach(1, tx);
        hub.subscribe(VIEWERS_TOPIC, 1);
        drop(rx);
        hub.publish(VIEWERS_TOPIC, alert());
        assert_eq!(hub.subscriber_count(VIEWERS_TOPIC), 0);
        assert!(!hub.subscribe(VIEWERS_TOPIC, 1));
    }
}
