//! Receipts: building outgoing receipt stanzas, and turning incoming retry
//! receipts into a resend of the cached original message.

use chrono::Utc;

use crate::binary::builder::NodeBuilder;
use crate::binary::jid::Jid;
use crate::binary::node::{Attrs, Node};
use crate::error::{RelayError, Result};
use crate::events::{Event, ReceiptEvent};

use super::{MessageOptions, Relay, RetryParticipant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    /// Plain delivery ack; carried as an absent `type` attribute.
    Delivery,
    Read,
    ReadSelf,
    /// Companion-device ack for a prekey message.
    Sender,
    Retry,
}

impl ReceiptType {
    pub fn as_attr(&self) -> Option<&'static str> {
        match self {
            ReceiptType::Delivery => None,
            ReceiptType::Read => Some("read"),
            ReceiptType::ReadSelf => Some("read-self"),
            ReceiptType::Sender => Some("sender"),
            ReceiptType::Retry => Some("retry"),
        }
    }
}

impl Relay {
    /// Acknowledge one or more messages. The first id rides in the `id`
    /// attribute, any remaining ids in a `<list>` of `<item>`s. Read
    /// receipts carry the read timestamp; sender receipts in direct chats
    /// address the device in `to` and the chat owner in `recipient`.
    pub async fn send_receipt(
        &self,
        chat: &Jid,
        participant: Option<&Jid>,
        message_ids: &[String],
        receipt_type: ReceiptType,
    ) -> Result<()> {
        let Some((first_id, remaining)) = message_ids.split_first() else {
            return Ok(());
        };

        let mut attrs = Attrs::new();
        attrs.insert("id".into(), first_id.clone());
        if let Some(type_attr) = receipt_type.as_attr() {
            attrs.insert("type".into(), type_attr.to_string());
        }
        if matches!(receipt_type, ReceiptType::Read | ReceiptType::ReadSelf) {
            attrs.insert("t".into(), Utc::now().timestamp().to_string());
        }

        match (receipt_type, participant) {
            (ReceiptType::Sender, Some(device)) if chat.is_user() => {
                attrs.insert("to".into(), device.to_string());
                attrs.insert("recipient".into(), chat.to_string());
            }
            (_, participant) => {
                attrs.insert("to".into(), chat.to_string());
                if let Some(participant) = participant {
                    attrs.insert("participant".into(), participant.to_string());
                }
            }
        }

        let mut builder = NodeBuilder::new("receipt").attrs(attrs);
        if !remaining.is_empty() {
            let items: Vec<Node> = remaining
                .iter()
                .map(|id| NodeBuilder::new("item").attr("id", id.clone()).build())
                .collect();
            builder = builder.children([NodeBuilder::new("list").children(items).build()]);
        }

        self.transport.send_node(builder.build()).await?;
        Ok(())
    }

    /// Route an incoming `<receipt>` stanza: retry receipts trigger a
    /// resend, everything else surfaces as an event.
    pub async fn handle_receipt(&self, node: &Node) -> Result<()> {
        let mut attrs = node.attrs();
        let from = attrs.jid("from");
        let id = attrs.string("id");
        let receipt_type = attrs.optional_string("type").unwrap_or("delivery").to_string();
        let participant = attrs.optional_jid("participant");
        attrs.finish().map_err(RelayError::MalformedResponse)?;

        if receipt_type == "retry" {
            return self.handle_retry_receipt(&from, &id, participant, node).await;
        }

        let sender = participant.unwrap_or_else(|| from.clone());
        self.events.dispatch(Event::Receipt(ReceiptEvent {
            chat: from,
            sender: sender.clone(),
            message_ids: vec![id],
            receipt_type,
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    /// Re-encrypt and resend a recently sent message to the device that
    /// could not decrypt it.
    async fn handle_retry_receipt(
        &self,
        from: &Jid,
        message_id: &str,
        participant: Option<Jid>,
        node: &Node,
    ) -> Result<()> {
        let count = node
            .get_optional_child("retry")
            .and_then(|retry| retry.attrs().optional_string("count").map(str::to_string))
            .and_then(|count| count.parse::<u32>().ok())
            .unwrap_or(1);

        let Some(recent) = &self.recent else {
            log::debug!("retry receipt for {message_id} ignored, recent-message cache disabled");
            return Ok(());
        };
        let Some(message) = recent.get_recent_message(from, message_id).await else {
            log::warn!("retry receipt for unknown message {message_id} from {from}");
            return Ok(());
        };
        if recent.increment_retry_count(from, message_id).await.is_none() {
            log::warn!(
                "dropping retry receipt for {message_id} from {from}, retry budget exhausted"
            );
            return Ok(());
        }

        let requester = participant.unwrap_or_else(|| from.clone());
        log::info!("re-sending {message_id} to {requester} (retry #{count})");
        self.relay_message(
            from,
            &message,
            MessageOptions {
                message_id: Some(message_id.to_string()),
                participant: Some(RetryParticipant {
                    jid: requester,
                    count,
                }),
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }
}
