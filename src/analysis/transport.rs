use crate::events::{ParsedEvent, ServerId};
use log::debug;
use tokio::sync::broadcast;

/// Topic on which a server's parsed events are pushed
pub fn topic_for(server_id: ServerId) -> String {
    format!("logs/{}", server_id)
}

/// Fire-and-forget push of parsed events to live subscribers
pub trait PushTransport: Send + Sync {
    fn publish(&self, topic: &str, event: &ParsedEvent);
}

/// A published event together with its topic
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub topic: String,
    pub event: ParsedEvent,
}

/// In-process push transport over a broadcast channel
///
/// Publishing without subscribers drops the event. Slow subscribers lag and
/// miss the oldest messages instead of blocking the publisher.
pub struct BroadcastTransport {
    sender: broadcast::Sender<TopicMessage>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PushTransport for BroadcastTransport {
    fn publish(&self, topic: &str, event: &ParsedEvent) {
        let message = TopicMessage {
            topic: topic.to_string(),
            event: event.clone(),
        };
        if self.sender.send(message).is_err() {
            debug!("No subscriber on {}, event dropped", topic);
        }
    }
}
