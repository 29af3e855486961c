//! The payload envelope the relay carries, as hand-annotated prost structs.
//! Only the parts the relay itself inspects are modeled: the content slots
//! that drive the stanza `type`/`mediatype` attributes, the device-sent
//! wrapper, the sender-key distribution carrier and the peer-operation
//! envelope. Content builders above the relay fill in the rest.

/// Stanza-level message classification derived from the populated slot.
pub mod stanza_type {
    pub const TEXT: &str = "text";
    pub const MEDIA: &str = "media";
    pub const POLL: &str = "poll";
    pub const EVENT: &str = "event";
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(string, optional, tag = "1")]
    pub conversation: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub sender_key_distribution_message: Option<SenderKeyDistributionMessage>,
    #[prost(message, optional, tag = "3")]
    pub image_message: Option<ImageMessage>,
    #[prost(message, optional, tag = "6")]
    pub extended_text_message: Option<ExtendedTextMessage>,
    #[prost(message, optional, tag = "7")]
    pub document_message: Option<DocumentMessage>,
    #[prost(message, optional, tag = "8")]
    pub audio_message: Option<AudioMessage>,
    #[prost(message, optional, tag = "9")]
    pub video_message: Option<VideoMessage>,
    #[prost(message, optional, boxed, tag = "12")]
    pub protocol_message: Option<Box<ProtocolMessage>>,
    #[prost(message, optional, tag = "26")]
    pub sticker_message: Option<StickerMessage>,
    #[prost(message, optional, boxed, tag = "31")]
    pub device_sent_message: Option<Box<DeviceSentMessage>>,
    #[prost(message, optional, tag = "49")]
    pub poll_creation_message: Option<PollCreationMessage>,
    #[prost(message, optional, tag = "146")]
    pub event_message: Option<EventMessage>,
}

impl Message {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            conversation: Some(body.into()),
            ..Default::default()
        }
    }

    /// The message a recipient actually sees, unwrapping the device-sent
    /// envelope when present.
    pub fn effective_content(&self) -> &Message {
        match self.device_sent_message.as_deref().and_then(|d| d.message.as_deref()) {
            Some(inner) => inner,
            None => self,
        }
    }

    /// Media subtype carried by this message, if any.
    pub fn media_type(&self) -> Option<&'static str> {
        let content = self.effective_content();
        if content.image_message.is_some() {
            Some("image")
        } else if content.video_message.is_some() {
            Some("video")
        } else if content.audio_message.is_some() {
            Some("audio")
        } else if content.document_message.is_some() {
            Some("document")
        } else if content.sticker_message.is_some() {
            Some("sticker")
        } else {
            None
        }
    }

    /// `type` attribute for the outgoing `message` stanza. First match wins:
    /// poll, event, media, text.
    pub fn stanza_type(&self) -> &'static str {
        let content = self.effective_content();
        if content.poll_creation_message.is_some() {
            stanza_type::POLL
        } else if content.event_message.is_some() {
            stanza_type::EVENT
        } else if self.media_type().is_some() {
            stanza_type::MEDIA
        } else {
            stanza_type::TEXT
        }
    }
}

/// Wrapper letting the sender's other devices render their own outgoing
/// messages.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceSentMessage {
    #[prost(string, optional, tag = "1")]
    pub destination_jid: Option<String>,
    #[prost(message, optional, boxed, tag = "2")]
    pub message: Option<Box<Message>>,
    #[prost(string, optional, tag = "3")]
    pub phash: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SenderKeyDistributionMessage {
    #[prost(string, optional, tag = "1")]
    pub group_id: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub axolotl_sender_key_distribution_message: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageKey {
    #[prost(string, optional, tag = "1")]
    pub remote_jid: Option<String>,
    #[prost(bool, optional, tag = "2")]
    pub from_me: Option<bool>,
    #[prost(string, optional, tag = "3")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub participant: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(int32, optional, tag = "2")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "16")]
    pub peer_data_operation_request_message: Option<PeerDataOperationRequestMessage>,
}

pub mod protocol_message_type {
    pub const PEER_DATA_OPERATION_REQUEST: i32 = 16;
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerDataOperationRequestMessage {
    #[prost(int32, optional, tag = "1")]
    pub peer_data_operation_request_type: Option<i32>,
    #[prost(message, repeated, tag = "4")]
    pub placeholder_message_resend_request: Vec<PlaceholderMessageResendRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlaceholderMessageResendRequest {
    #[prost(message, optional, tag = "1")]
    pub message_key: Option<MessageKey>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtendedTextMessage {
    #[prost(string, optional, tag = "1")]
    pub text: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub matched_text: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub title: Option<String>,
    #[prost(bytes = "vec", optional, tag = "16")]
    pub jpeg_thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub caption: Option<String>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub media_key: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VideoMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub media_key: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AudioMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(bool, optional, tag = "18")]
    pub ptt: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DocumentMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub file_name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StickerMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollCreationMessage {
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "3")]
    pub options: Vec<PollOption>,
    #[prost(uint32, optional, tag = "4")]
    pub selectable_options_count: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollOption {
    #[prost(string, optional, tag = "1")]
    pub option_name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventMessage {
    #[prost(bool, optional, tag = "1")]
    pub is_canceled: Option<bool>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub description: Option<String>,
    #[prost(int64, optional, tag = "5")]
    pub start_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn stanza_type_first_match_wins() {
        let mut msg = Message::text("hi");
        assert_eq!(msg.stanza_type(), "text");

        msg.image_message = Some(ImageMessage::default());
        assert_eq!(msg.stanza_type(), "media");
        assert_eq!(msg.media_type(), Some("image"));

        msg.event_message = Some(EventMessage::default());
        assert_eq!(msg.stanza_type(), "event");

        msg.poll_creation_message = Some(PollCreationMessage::default());
        assert_eq!(msg.stanza_type(), "poll");
    }

    #[test]
    fn device_sent_wrapper_is_transparent_for_classification() {
        let inner = Message {
            video_message: Some(VideoMessage::default()),
            ..Default::default()
        };
        let wrapped = Message {
            device_sent_message: Some(Box::new(DeviceSentMessage {
                destination_jid: Some("1@s.whatsapp.net".into()),
                message: Some(Box::new(inner)),
                phash: Some(String::new()),
            })),
            ..Default::default()
        };
        assert_eq!(wrapped.stanza_type(), "media");
        assert_eq!(wrapped.media_type(), Some("video"));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let msg = Message {
            conversation: Some("payload".into()),
            sender_key_distribution_message: Some(SenderKeyDistributionMessage {
                group_id: Some("123@g.us".into()),
                axolotl_sender_key_distribution_message: Some(vec![1, 2, 3]),
            }),
            ..Default::default()
        };
        let bytes = msg.encode_to_vec();
        let decoded = Message::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }
}
