//! Per-recipient encryption fan-out: runs the pairwise encrypts for a
//! recipient set concurrently, each one under that recipient's keyed mutex,
//! and folds the results into the `<to><enc/></to>` subtrees of the outgoing
//! stanza. Device-sent substitution for the sender's own companions happens
//! here too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{stream, StreamExt};
use prost::Message as _;
use tokio::sync::Mutex;

use crate::binary::builder::NodeBuilder;
use crate::binary::jid::Jid;
use crate::binary::node::{Attrs, Node};
use crate::error::{RelayError, Result};
use crate::messages::MessageUtils;
use crate::proto;
use crate::signal::repository::SignalRepository;

/// Result of a pre-send patch: one message for everyone, or one per
/// recipient (index-aligned with the recipient list).
pub enum PatchedMessages {
    Single(proto::Message),
    PerRecipient(Vec<proto::Message>),
}

/// Host hook applied to the payload right before encryption.
pub type MessagePatcher =
    Arc<dyn Fn(&proto::Message, &[Jid]) -> PatchedMessages + Send + Sync>;

/// Who we are on the wire: both identities (when linked) and the encoded
/// signed device identity attached alongside prekey messages.
#[derive(Debug, Clone)]
pub struct SenderIdentity {
    pub pn: Jid,
    pub lid: Option<Jid>,
    pub account: Option<Vec<u8>>,
}

impl SenderIdentity {
    /// Is this one of our own devices, under either identity?
    pub fn is_own_device(&self, jid: &Jid) -> bool {
        (jid.is_pn() && jid.is_same_user_as(&self.pn))
            || self
                .lid
                .as_ref()
                .is_some_and(|lid| jid.is_lid() && jid.is_same_user_as(lid))
    }

    /// Is this the exact device we are sending from?
    pub fn is_exact_sender_device(&self, jid: &Jid) -> bool {
        *jid == self.pn || self.lid.as_ref() == Some(jid)
    }
}

pub struct ParticipantNodes {
    pub nodes: Vec<Node>,
    /// Set when any recipient received a prekey message; the stanza must
    /// then carry our device identity.
    pub should_include_device_identity: bool,
}

pub struct EncryptionFanOut {
    repository: Arc<SignalRepository>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EncryptionFanOut {
    pub fn new(repository: Arc<SignalRepository>) -> Self {
        Self {
            repository,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, jid: &Jid) -> Arc<Mutex<()>> {
        self.locks
            .entry(jid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Encrypt `message` to every recipient and wrap each ciphertext in a
    /// `<to jid><enc v="2" type=…/></to>` subtree. When `dsm` is given it
    /// replaces the payload for the sender's own non-exact devices.
    pub async fn create_participant_nodes(
        &self,
        sender: &SenderIdentity,
        recipients: &[Jid],
        message: &proto::Message,
        extra_attrs: &Attrs,
        dsm: Option<&proto::Message>,
        patcher: Option<&MessagePatcher>,
    ) -> Result<ParticipantNodes> {
        let patched = match patcher {
            Some(patch) => patch(message, recipients),
            None => PatchedMessages::Single(message.clone()),
        };
        if let PatchedMessages::PerRecipient(list) = &patched {
            if list.len() != recipients.len() {
                return Err(RelayError::MalformedResponse(format!(
                    "patcher returned {} messages for {} recipients",
                    list.len(),
                    recipients.len()
                )));
            }
        }

        let include_device_identity = AtomicBool::new(false);
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .clamp(1, 16);

        let tasks = recipients.iter().enumerate().map(|(index, jid)| {
            let patched = &patched;
            let include_device_identity = &include_device_identity;
            async move {
                let payload: &proto::Message = match dsm {
                    Some(dsm)
                        if sender.is_own_device(jid) && !sender.is_exact_sender_device(jid) =>
                    {
                        dsm
                    }
                    _ => match patched {
                        PatchedMessages::Single(msg) => msg,
                        PatchedMessages::PerRecipient(list) => &list[index],
                    },
                };
                let plaintext = MessageUtils::pad_message_v2(payload.encode_to_vec());

                let lock = self.lock_for(jid);
                let encrypted = {
                    let _guard = lock.lock().await;
                    self.repository.encrypt_message(jid, &plaintext).await?
                };
                if encrypted.enc_type == "pkmsg" {
                    include_device_identity.store(true, Ordering::SeqCst);
                }

                let mut enc_attrs = Attrs::new();
                enc_attrs.insert("v".to_string(), "2".to_string());
                enc_attrs.insert("type".to_string(), encrypted.enc_type.to_string());
                for (k, v) in extra_attrs.iter() {
                    enc_attrs.insert(k.clone(), v.clone());
                }

                let enc_node = NodeBuilder::new("enc")
                    .attrs(enc_attrs)
                    .bytes(encrypted.ciphertext)
                    .build();
                let to_node = NodeBuilder::new("to")
                    .attr("jid", jid.to_string())
                    .children([enc_node])
                    .build();
                Ok::<Node, RelayError>(to_node)
            }
        });

        let results: Vec<std::result::Result<Node, RelayError>> =
            stream::iter(tasks).buffer_unordered(concurrency).collect().await;

        let mut nodes = Vec::with_capacity(results.len());
        for result in results {
            nodes.push(result?);
        }

        Ok(ParticipantNodes {
            nodes,
            should_include_device_identity: include_device_identity.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lid::{LidMappingStore, MAPPING_CACHE_TTL};
    use crate::signal::binding::SignalCreds;
    use crate::signal::mock::MockSignalEngine;
    use crate::signal::repository::MIGRATED_SESSION_CACHE_TTL;
    use crate::store::{KeyStore, MemoryStore};
    use prost::Message as _;

    fn fanout() -> (EncryptionFanOut, Arc<SignalRepository>) {
        let store = KeyStore::new(Arc::new(MemoryStore::new()));
        let lid = Arc::new(LidMappingStore::new(store.clone(), MAPPING_CACHE_TTL));
        let repository = Arc::new(SignalRepository::new(
            store,
            Arc::new(MockSignalEngine::new()),
            lid,
            SignalCreds {
                registration_id: 1,
                identity_public: vec![0; 32],
                signed_pre_key: vec![1; 2],
            },
            MIGRATED_SESSION_CACHE_TTL,
        ));
        (EncryptionFanOut::new(repository.clone()), repository)
    }

    fn sender() -> SenderIdentity {
        SenderIdentity {
            pn: Jid::pn_device("1000", 1),
            lid: Some(Jid::lid_device("2000", 1)),
            account: Some(vec![9; 4]),
        }
    }

    async fn establish(repository: &SignalRepository, jid: &Jid, acknowledged: bool) {
        repository
            .inject_e2e_session(jid, &MockSignalEngine::test_bundle())
            .await
            .unwrap();
        if acknowledged {
            // A prekey decrypt flips the record into the open state.
            let enc = repository
                .encrypt_message(jid, b"warmup")
                .await
                .unwrap();
            repository
                .decrypt_message(jid, "pkmsg", &enc.ciphertext)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn builds_one_to_node_per_recipient() {
        let (fanout, repository) = fanout();
        let recipients = vec![Jid::pn_device("1111", 0), Jid::pn_device("2222", 0)];
        for jid in &recipients {
            establish(&repository, jid, true).await;
        }

        let out = fanout
            .create_participant_nodes(
                &sender(),
                &recipients,
                &proto::Message::text("hi"),
                &Attrs::new(),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(out.nodes.len(), 2);
        assert!(!out.should_include_device_identity);
        for node in &out.nodes {
            assert_eq!(node.tag, "to");
            let enc = node.get_optional_child("enc").unwrap();
            assert_eq!(enc.attrs.get("v").map(String::as_str), Some("2"));
            assert_eq!(enc.attrs.get("type").map(String::as_str), Some("msg"));
        }
    }

    #[tokio::test]
    async fn prekey_recipient_raises_device_identity_flag() {
        let (fanout, repository) = fanout();
        let fresh = Jid::pn_device("1111", 0);
        let warm = Jid::pn_device("2222", 0);
        establish(&repository, &fresh, false).await;
        establish(&repository, &warm, true).await;

        let out = fanout
            .create_participant_nodes(
                &sender(),
                &[fresh, warm],
                &proto::Message::text("hi"),
                &Attrs::new(),
                None,
                None,
            )
            .await
            .unwrap();

        assert!(out.should_include_device_identity);
        let types: Vec<&str> = out
            .nodes
            .iter()
            .map(|n| {
                n.get_optional_child("enc")
                    .unwrap()
                    .attrs
                    .get("type")
                    .unwrap()
                    .as_str()
            })
            .collect();
        assert!(types.contains(&"pkmsg"));
        assert!(types.contains(&"msg"));
    }

    #[tokio::test]
    async fn dsm_substitutes_for_own_companion_devices_only() {
        let (fanout, repository) = fanout();
        let me = sender();
        let peer = Jid::pn_device("1111", 0);
        let own_companion = Jid::pn_device("1000", 2);
        for jid in [&peer, &own_companion] {
            establish(&repository, jid, true).await;
        }

        let dsm = proto::Message {
            device_sent_message: Some(Box::new(proto::DeviceSentMessage {
                destination_jid: Some(peer.to_string()),
                message: Some(Box::new(proto::Message::text("hi"))),
                phash: Some(String::new()),
            })),
            ..Default::default()
        };

        let out = fanout
            .create_participant_nodes(
                &me,
                &[peer.clone(), own_companion.clone()],
                &proto::Message::text("hi"),
                &Attrs::new(),
                Some(&dsm),
                None,
            )
            .await
            .unwrap();

        // The mock prepends MSG: to the padded plaintext, so the payloads
        // are recoverable for inspection.
        for node in &out.nodes {
            let jid = node.attrs.get("jid").unwrap();
            let ciphertext = node.get_optional_child("enc").unwrap().bytes().unwrap();
            let padded = ciphertext.strip_prefix(b"MSG:").unwrap();
            let plain = MessageUtils::unpad_message(padded).unwrap();
            let decoded = proto::Message::decode(plain).unwrap();
            if jid == &own_companion.to_string() {
                assert!(decoded.device_sent_message.is_some());
            } else {
                assert!(decoded.device_sent_message.is_none());
                assert_eq!(decoded.conversation.as_deref(), Some("hi"));
            }
        }
    }

    #[tokio::test]
    async fn per_recipient_patches_are_index_aligned() {
        let (fanout, repository) = fanout();
        let a = Jid::pn_device("1111", 0);
        let b = Jid::pn_device("2222", 0);
        establish(&repository, &a, true).await;
        establish(&repository, &b, true).await;

        let patcher: MessagePatcher = Arc::new(|_msg, recipients| {
            PatchedMessages::PerRecipient(
                recipients
                    .iter()
                    .map(|jid| proto::Message::text(format!("for:{}", jid.user)))
                    .collect(),
            )
        });

        let out = fanout
            .create_participant_nodes(
                &sender(),
                &[a, b],
                &proto::Message::text("ignored"),
                &Attrs::new(),
                None,
                Some(&patcher),
            )
            .await
            .unwrap();

        for node in &out.nodes {
            let user = node.attrs.get("jid").unwrap().split('@').next().unwrap();
            let user = user.split(':').next().unwrap();
            let ciphertext = node.get_optional_child("enc").unwrap().bytes().unwrap();
            let padded = ciphertext.strip_prefix(b"MSG:").unwrap();
            let plain = MessageUtils::unpad_message(padded).unwrap();
            let decoded = proto::Message::decode(plain).unwrap();
            assert_eq!(decoded.conversation.as_deref(), Some(format!("for:{user}").as_str()));
        }
    }

    #[tokio::test]
    async fn mismatched_patch_length_is_an_error() {
        let (fanout, repository) = fanout();
        let a = Jid::pn_device("1111", 0);
        establish(&repository, &a, true).await;

        let patcher: MessagePatcher =
            Arc::new(|_msg, _recipients| PatchedMessages::PerRecipient(vec![]));
        let err = fanout
            .create_participant_nodes(
                &sender(),
                &[a],
                &proto::Message::text("x"),
                &Attrs::new(),
                None,
                Some(&patcher),
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn extra_attrs_land_on_every_enc_node() {
        let (fanout, repository) = fanout();
        let a = Jid::pn_device("1111", 0);
        establish(&repository, &a, true).await;

        let mut extra = Attrs::new();
        extra.insert("mediatype".into(), "image".into());

        let out = fanout
            .create_participant_nodes(
                &sender(),
                &[a],
                &proto::Message::text("x"),
                &extra,
                None,
                None,
            )
            .await
            .unwrap();
        let enc = out.nodes[0].get_optional_child("enc").unwrap();
        assert_eq!(enc.attrs.get("mediatype").map(String::as_str), Some("image"));
    }
}
