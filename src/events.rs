//! Events the relay emits back at its host: local echoes of sent messages
//! and receipt notifications.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::binary::jid::Jid;
use crate::proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertType {
    /// A message this client produced, echoed after a successful send.
    Append,
    /// A message learned from the server.
    Notify,
}

#[derive(Debug, Clone)]
pub struct MessageUpsert {
    pub jid: Jid,
    pub id: String,
    pub message: proto::Message,
    pub upsert_type: UpsertType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReceiptEvent {
    pub chat: Jid,
    pub sender: Jid,
    pub message_ids: Vec<String>,
    pub receipt_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Event {
    MessageUpsert(MessageUpsert),
    Receipt(ReceiptEvent),
}

/// Broadcast fan-out to however many listeners the host attaches. Dispatch
/// never blocks and never fails; a bus without subscribers drops events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn dispatch(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_dispatched_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.dispatch(Event::MessageUpsert(MessageUpsert {
            jid: Jid::pn("1111"),
            id: "ABC".into(),
            message: proto::Message::text("hi"),
            upsert_type: UpsertType::Append,
            timestamp: Utc::now(),
        }));

        match rx.recv().await.unwrap() {
            Event::MessageUpsert(upsert) => {
                assert_eq!(upsert.id, "ABC");
                assert_eq!(upsert.upsert_type, UpsertType::Append);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn dispatch_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.dispatch(Event::Receipt(ReceiptEvent {
            chat: Jid::pn("1111"),
            sender: Jid::pn("1111"),
            message_ids: vec!["ABC".into()],
            receipt_type: "read".into(),
            timestamp: Utc::now(),
        }));
    }
}
