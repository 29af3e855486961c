//! Bookkeeping behind retry resends: a bounded cache of recently sent
//! messages (so a retry receipt can re-encrypt the original payload) and
//! atomic per-message retry counters.

use std::time::Duration;

use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};

use crate::binary::jid::Jid;
use crate::proto;

const RECENT_MESSAGES_CAPACITY: u64 = 512;
const RETRY_COUNT_TTL: Duration = Duration::from_secs(60 * 60);

pub struct RecentMessageManager {
    messages: Cache<String, proto::Message>,
    retry_counts: Cache<String, u32>,
    max_retry_count: u32,
}

impl RecentMessageManager {
    pub fn new(max_retry_count: u32) -> Self {
        Self {
            messages: Cache::builder()
                .max_capacity(RECENT_MESSAGES_CAPACITY)
                .build(),
            retry_counts: Cache::builder().time_to_live(RETRY_COUNT_TTL).build(),
            max_retry_count,
        }
    }

    fn key(destination: &Jid, message_id: &str) -> String {
        format!("{destination}|{message_id}")
    }

    pub async fn add_recent_message(
        &self,
        destination: &Jid,
        message_id: &str,
        message: &proto::Message,
    ) {
        self.messages
            .insert(Self::key(destination, message_id), message.clone())
            .await;
    }

    pub async fn get_recent_message(
        &self,
        destination: &Jid,
        message_id: &str,
    ) -> Option<proto::Message> {
        self.messages.get(&Self::key(destination, message_id)).await
    }

    /// Atomically bump the retry counter for a message. Returns the new
    /// count, or `None` once the configured maximum has been reached.
    pub async fn increment_retry_count(
        &self,
        destination: &Jid,
        message_id: &str,
    ) -> Option<u32> {
        let max = self.max_retry_count;
        let result = self
            .retry_counts
            .entry(Self::key(destination, message_id))
            .and_compute_with(|maybe_entry| {
                let op = match maybe_entry {
                    Some(entry) => {
                        let current = entry.into_value();
                        if current >= max {
                            Op::Nop
                        } else {
                            Op::Put(current + 1)
                        }
                    }
                    None => Op::Put(1),
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::Inserted(entry) => Some(entry.into_value()),
            CompResult::ReplacedWith(entry) => Some(entry.into_value()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recent_messages_are_retrievable_by_destination_and_id() {
        let manager = RecentMessageManager::new(5);
        let chat = Jid::pn("1111");
        let message = proto::Message::text("hello");

        manager.add_recent_message(&chat, "MSG1", &message).await;

        assert_eq!(
            manager.get_recent_message(&chat, "MSG1").await,
            Some(message)
        );
        assert!(manager.get_recent_message(&chat, "MSG2").await.is_none());
        assert!(manager
            .get_recent_message(&Jid::pn("2222"), "MSG1")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn retry_counter_stops_at_the_maximum() {
        let manager = RecentMessageManager::new(3);
        let chat = Jid::pn("1111");

        assert_eq!(manager.increment_retry_count(&chat, "M").await, Some(1));
        assert_eq!(manager.increment_retry_count(&chat, "M").await, Some(2));
        assert_eq!(manager.increment_retry_count(&chat, "M").await, Some(3));
        assert_eq!(manager.increment_retry_count(&chat, "M").await, None);
        assert_eq!(manager.increment_retry_count(&chat, "M").await, None);

        // Other messages are unaffected.
        assert_eq!(manager.increment_retry_count(&chat, "N").await, Some(1));
    }

    #[tokio::test]
    async fn concurrent_increments_never_exceed_the_maximum() {
        let manager = std::sync::Arc::new(RecentMessageManager::new(5));
        let chat = Jid::pn("1111");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            let chat = chat.clone();
            handles.push(tokio::spawn(async move {
                manager.increment_retry_count(&chat, "M").await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}
