//! The relay pipeline: classify a destination, resolve the sending
//! identity, enumerate devices, assert sessions, fan out the encryption and
//! assemble the final `message` stanza. One entry point, five paths:
//! newsletter, retry resend, group/status broadcast, direct 1:1 and
//! peer data operations.

pub mod receipt;
pub mod retry;


use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use prost::Message as _;

use crate::binary::builder::NodeBuilder;
use crate::binary::jid::{Jid, HOSTED_DEVICE_ID};
use crate::binary::node::{Attrs, Node};
use crate::config::RelayConfig;
use crate::devices::DeviceDirectory;
use crate::error::{RelayError, Result};
use crate::events::{Event, EventBus, MessageUpsert, UpsertType};
use crate::fanout::{EncryptionFanOut, SenderIdentity};
use crate::lid::LidMappingStore;
use crate::messages::MessageUtils;
use crate::proto;
use crate::session::SessionAsserter;
use crate::signal::binding::SignalCreds;
use crate::signal::engine::{SignalEngine, WIRE_TYPE_SKMSG};
use crate::signal::repository::SignalRepository;
use crate::store::{columns, ColumnWrites, KeyStore};
use crate::transport::{generate_message_id, InfoQuery, Transport};
use crate::usync::UsyncPnLidResolver;

use retry::RecentMessageManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Pn,
    Lid,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Pn => "pn",
            AddressingMode::Lid => "lid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupMetadata {
    pub addressing_mode: Option<AddressingMode>,
    pub participants: Vec<Jid>,
}

/// Target of a retry resend, taken from an incoming retry receipt.
#[derive(Debug, Clone)]
pub struct RetryParticipant {
    pub jid: Jid,
    pub count: u32,
}

#[derive(Clone)]
pub struct MessageOptions {
    pub message_id: Option<String>,
    /// Present on retry resends; switches the pipeline to the single-target
    /// path.
    pub participant: Option<RetryParticipant>,
    /// Recipients of a status broadcast.
    pub status_jid_list: Vec<Jid>,
    pub additional_attrs: Vec<(String, String)>,
    pub additional_nodes: Vec<Node>,
    pub use_user_devices_cache: bool,
    pub use_cached_group_metadata: bool,
    /// Peer data operation: a single-device stanza in category `peer`.
    pub peer: bool,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            message_id: None,
            participant: None,
            status_jid_list: Vec::new(),
            additional_attrs: Vec::new(),
            additional_nodes: Vec::new(),
            use_user_devices_cache: true,
            use_cached_group_metadata: true,
            peer: false,
        }
    }
}

pub struct Relay {
    transport: Arc<dyn Transport>,
    store: KeyStore,
    lid: Arc<LidMappingStore>,
    repository: Arc<SignalRepository>,
    asserter: Arc<SessionAsserter>,
    directory: Arc<DeviceDirectory>,
    fanout: EncryptionFanOut,
    identity: Option<SenderIdentity>,
    config: RelayConfig,
    events: EventBus,
    recent: Option<RecentMessageManager>,
}

impl Relay {
    pub async fn new(
        transport: Arc<dyn Transport>,
        store: KeyStore,
        engine: Arc<dyn SignalEngine>,
        creds: SignalCreds,
        identity: Option<SenderIdentity>,
        config: RelayConfig,
    ) -> Arc<Self> {
        let lid = Arc::new(LidMappingStore::new(store.clone(), config.mapping_cache_ttl));
        lid.set_resolver(Arc::new(UsyncPnLidResolver::new(transport.clone())))
            .await;

        let repository = Arc::new(SignalRepository::new(
            store.clone(),
            engine,
            lid.clone(),
            creds,
            config.migrated_session_cache_ttl,
        ));
        let asserter = Arc::new(SessionAsserter::new(
            transport.clone(),
            repository.clone(),
            lid.clone(),
            config.peer_session_cache_ttl,
        ));
        let directory = Arc::new(DeviceDirectory::new(
            transport.clone(),
            store.clone(),
            lid.clone(),
            asserter.clone(),
            config.user_devices_cache_ttl,
        ));
        let recent = config
            .enable_recent_message_cache
            .then(|| RecentMessageManager::new(config.max_msg_retry_count));

        Arc::new(Self {
            fanout: EncryptionFanOut::new(repository.clone()),
            transport,
            store,
            lid,
            repository,
            asserter,
            directory,
            identity,
            config,
            events: EventBus::default(),
            recent,
        })
    }

    pub fn lid_mappings(&self) -> &Arc<LidMappingStore> {
        &self.lid
    }

    pub fn repository(&self) -> &Arc<SignalRepository> {
        &self.repository
    }

    pub fn devices(&self) -> &Arc<DeviceDirectory> {
        &self.directory
    }

    pub fn sessions(&self) -> &Arc<SessionAsserter> {
        &self.asserter
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn authed(&self) -> Result<&SenderIdentity> {
        self.identity.as_ref().ok_or(RelayError::AuthenticationMissing)
    }

    /// Turn a message intent into an encrypted stanza on the wire and
    /// return its message id.
    pub async fn relay_message(
        &self,
        jid: &Jid,
        message: &proto::Message,
        options: MessageOptions,
    ) -> Result<String> {
        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_id(self.identity.as_ref().map(|i| &i.pn)));

        let stanza = if jid.is_newsletter() {
            self.build_newsletter_stanza(jid, message, &options, &message_id)
        } else if options.peer {
            self.build_peer_stanza(jid, message, &options, &message_id)
                .await?
        } else if let Some(participant) = options.participant.clone() {
            self.build_retry_stanza(jid, message, &participant, &options, &message_id)
                .await?
        } else if jid.is_group() || jid.is_status_broadcast() {
            self.build_group_stanza(jid, message, &options, &message_id)
                .await?
        } else {
            self.build_direct_stanza(jid, message, &options, &message_id)
                .await?
        };

        if !options.peer && !jid.is_newsletter() && options.participant.is_none() {
            if let Some(recent) = &self.recent {
                recent.add_recent_message(jid, &message_id, message).await;
            }
        }

        self.transport.send_node(stanza).await?;

        if self.config.emit_own_events {
            self.events.dispatch(Event::MessageUpsert(MessageUpsert {
                jid: jid.clone(),
                id: message_id.clone(),
                message: message.clone(),
                upsert_type: UpsertType::Append,
                timestamp: Utc::now(),
            }));
        }
        Ok(message_id)
    }

    fn build_newsletter_stanza(
        &self,
        jid: &Jid,
        message: &proto::Message,
        options: &MessageOptions,
        message_id: &str,
    ) -> Node {
        // Newsletters carry the payload unencrypted and unpadded.
        let plaintext_node = NodeBuilder::new("plaintext")
            .bytes(message.encode_to_vec())
            .build();

        let mut attrs = Attrs::new();
        attrs.insert("id".into(), message_id.to_string());
        attrs.insert("to".into(), jid.to_string());
        attrs.insert("type".into(), message.stanza_type().to_string());
        Self::apply_additional_attrs(&mut attrs, options);

        let mut children = vec![plaintext_node];
        children.extend(options.additional_nodes.iter().cloned());

        NodeBuilder::new("message").attrs(attrs).children(children).build()
    }

    async fn build_peer_stanza(
        &self,
        jid: &Jid,
        message: &proto::Message,
        options: &MessageOptions,
        message_id: &str,
    ) -> Result<Node> {
        self.authed()?;

        self.asserter
            .assert_sessions(std::slice::from_ref(jid), false)
            .await?;

        let plaintext = MessageUtils::pad_message_v2(message.encode_to_vec());
        let encrypted = self.repository.encrypt_message(jid, &plaintext).await?;

        let enc_node = NodeBuilder::new("enc")
            .attrs([("v", "2"), ("type", encrypted.enc_type)])
            .bytes(encrypted.ciphertext)
            .build();

        let mut attrs = Attrs::new();
        attrs.insert("id".into(), message_id.to_string());
        attrs.insert("to".into(), jid.to_string());
        attrs.insert("type".into(), message.stanza_type().to_string());
        attrs.insert("category".into(), "peer".to_string());
        Self::apply_additional_attrs(&mut attrs, options);

        let mut children = vec![enc_node];
        children.extend(options.additional_nodes.iter().cloned());

        Ok(NodeBuilder::new("message").attrs(attrs).children(children).build())
    }

    async fn build_retry_stanza(
        &self,
        jid: &Jid,
        message: &proto::Message,
        participant: &RetryParticipant,
        options: &MessageOptions,
        message_id: &str,
    ) -> Result<Node> {
        let identity = self.authed()?.clone();
        let target = &participant.jid;
        let is_group_destination = jid.is_group() || jid.is_status_broadcast();

        // A forced resend invalidates the distribution bookkeeping; the
        // next group send rebuilds it from scratch.
        if is_group_destination {
            self.clear_sender_key_memory(jid).await;
        }

        let own_target = identity.is_own_device(target);
        let payload = if own_target {
            self.device_sent_wrapper(jid, message)
        } else {
            message.clone()
        };

        self.asserter
            .assert_sessions(std::slice::from_ref(target), false)
            .await?;

        let plaintext = MessageUtils::pad_message_v2(payload.encode_to_vec());
        let encrypted = self.repository.encrypt_message(target, &plaintext).await?;

        let mut enc_attrs = Attrs::new();
        enc_attrs.insert("v".into(), "2".into());
        enc_attrs.insert("type".into(), encrypted.enc_type.to_string());
        enc_attrs.insert("count".into(), participant.count.to_string());
        if let Some(media) = message.media_type() {
            enc_attrs.insert("mediatype".into(), media.to_string());
        }
        let enc_node = NodeBuilder::new("enc")
            .attrs(enc_attrs)
            .bytes(encrypted.ciphertext)
            .build();

        let mut children = vec![enc_node];
        if encrypted.enc_type == "pkmsg" {
            if let Some(account) = &identity.account {
                children.push(NodeBuilder::new("device-identity").bytes(account.clone()).build());
            }
        }
        children.extend(options.additional_nodes.iter().cloned());

        let mut attrs = Attrs::new();
        attrs.insert("id".into(), message_id.to_string());
        attrs.insert("type".into(), message.stanza_type().to_string());
        if is_group_destination {
            attrs.insert("to".into(), jid.to_string());
            attrs.insert("participant".into(), target.to_string());
        } else {
            attrs.insert("to".into(), target.to_string());
            if own_target && !jid.is_same_user_as(target) {
                attrs.insert("recipient".into(), jid.to_string());
            }
            attrs.insert("device_fanout".into(), "false".to_string());
        }
        Self::apply_additional_attrs(&mut attrs, options);

        Ok(NodeBuilder::new("message").attrs(attrs).children(children).build())
    }

    async fn build_group_stanza(
        &self,
        jid: &Jid,
        message: &proto::Message,
        options: &MessageOptions,
        message_id: &str,
    ) -> Result<Node> {
        let identity = self.authed()?.clone();
        let is_status = jid.is_status_broadcast();

        let metadata = if is_status {
            None
        } else {
            Some(
                self.group_metadata(jid, options.use_cached_group_metadata)
                    .await?,
            )
        };
        let mode = metadata
            .as_ref()
            .and_then(|m| m.addressing_mode)
            .unwrap_or(AddressingMode::Lid);
        let own_jid = match mode {
            AddressingMode::Lid => identity
                .lid
                .clone()
                .ok_or(RelayError::AuthenticationMissing)?,
            AddressingMode::Pn => identity.pn.clone(),
        };

        let base_participants = match &metadata {
            Some(meta) => meta.participants.clone(),
            None => options.status_jid_list.clone(),
        };
        let mut users: Vec<Jid> = base_participants.iter().map(|p| p.to_non_ad()).collect();
        if !users.iter().any(|u| u.is_same_user_as(&own_jid)) {
            users.push(own_jid.to_non_ad());
        }
        let mut seen = std::collections::HashSet::new();
        users.retain(|u| seen.insert(u.to_string()));

        // One sender-key encryption of the payload, regardless of fan-out.
        let plaintext = MessageUtils::pad_message_v2(message.encode_to_vec());
        let group_encrypted = self
            .repository
            .encrypt_group_message(jid, &own_jid, &plaintext)
            .await?;

        let all_devices = self
            .directory
            .get_devices(&users, options.use_user_devices_cache, false)
            .await?;
        let devices: Vec<Jid> = all_devices
            .into_iter()
            .filter(|d| !identity.is_exact_sender_device(d))
            .collect();

        let mut memory = self.load_sender_key_memory(jid).await;
        let fanout_targets: Vec<Jid> = devices
            .iter()
            .filter(|d| {
                d.device != HOSTED_DEVICE_ID
                    && !d.is_hosted()
                    && !memory.get(&d.to_string()).copied().unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut children = Vec::new();
        let mut include_device_identity = false;

        if !fanout_targets.is_empty() {
            log::debug!(
                "distributing sender key for {jid} to {} devices",
                fanout_targets.len()
            );
            let skdm_message = proto::Message {
                sender_key_distribution_message: Some(proto::SenderKeyDistributionMessage {
                    group_id: Some(jid.to_string()),
                    axolotl_sender_key_distribution_message: Some(
                        group_encrypted.sender_key_distribution.clone(),
                    ),
                }),
                ..Default::default()
            };

            self.asserter.assert_sessions(&fanout_targets, false).await?;
            let fanned = self
                .fanout
                .create_participant_nodes(
                    &identity,
                    &fanout_targets,
                    &skdm_message,
                    &Attrs::new(),
                    None,
                    None,
                )
                .await?;
            include_device_identity = fanned.should_include_device_identity;
            children.push(NodeBuilder::new("participants").children(fanned.nodes).build());

            for device in &fanout_targets {
                memory.insert(device.to_string(), true);
            }
            self.store_sender_key_memory(jid, &memory).await;
        }

        if include_device_identity {
            if let Some(account) = &identity.account {
                children.push(NodeBuilder::new("device-identity").bytes(account.clone()).build());
            }
        }

        let mut enc_attrs = Attrs::new();
        enc_attrs.insert("v".into(), "2".into());
        enc_attrs.insert("type".into(), WIRE_TYPE_SKMSG.to_string());
        if let Some(media) = message.media_type() {
            enc_attrs.insert("mediatype".into(), media.to_string());
        }
        children.push(
            NodeBuilder::new("enc")
                .attrs(enc_attrs)
                .bytes(group_encrypted.ciphertext)
                .build(),
        );
        children.extend(options.additional_nodes.iter().cloned());

        let mut attrs = Attrs::new();
        attrs.insert("id".into(), message_id.to_string());
        attrs.insert("to".into(), jid.to_string());
        attrs.insert("type".into(), message.stanza_type().to_string());
        attrs.insert("addressing_mode".into(), mode.as_str().to_string());
        Self::apply_additional_attrs(&mut attrs, options);

        Ok(NodeBuilder::new("message").attrs(attrs).children(children).build())
    }

    async fn build_direct_stanza(
        &self,
        jid: &Jid,
        message: &proto::Message,
        options: &MessageOptions,
        message_id: &str,
    ) -> Result<Node> {
        let identity = self.authed()?.clone();
        // The sending identity follows the conversation's domain.
        let own_jid = if jid.is_lid() {
            identity
                .lid
                .clone()
                .ok_or(RelayError::AuthenticationMissing)?
        } else {
            identity.pn.clone()
        };

        let all_devices = self
            .directory
            .get_devices(
                &[jid.to_non_ad(), own_jid.to_non_ad()],
                options.use_user_devices_cache,
                false,
            )
            .await?;
        let recipients: Vec<Jid> = all_devices
            .into_iter()
            .filter(|d| !identity.is_exact_sender_device(d))
            .collect();

        let dsm = self.device_sent_wrapper(jid, message);

        self.asserter.assert_sessions(&recipients, false).await?;

        let mut enc_extra = Attrs::new();
        if let Some(media) = message.media_type() {
            enc_extra.insert("mediatype".into(), media.to_string());
        }
        let fanned = self
            .fanout
            .create_participant_nodes(
                &identity,
                &recipients,
                message,
                &enc_extra,
                Some(&dsm),
                self.config.patch_message_before_sending.as_ref(),
            )
            .await?;

        let mut children = vec![NodeBuilder::new("participants").children(fanned.nodes).build()];
        if fanned.should_include_device_identity {
            if let Some(account) = &identity.account {
                children.push(NodeBuilder::new("device-identity").bytes(account.clone()).build());
            }
        }
        match self.store.get_one(columns::TC_TOKEN, &jid.user).await {
            Ok(Some(token)) => {
                children.push(NodeBuilder::new("tctoken").bytes(token).build());
            }
            Ok(None) => {}
            Err(e) => log::warn!("tctoken lookup for {jid} failed: {e}"),
        }
        children.extend(options.additional_nodes.iter().cloned());

        let mut attrs = Attrs::new();
        attrs.insert("id".into(), message_id.to_string());
        attrs.insert("to".into(), jid.to_string());
        attrs.insert("type".into(), message.stanza_type().to_string());
        if !recipients.is_empty() {
            attrs.insert(
                "phash".into(),
                MessageUtils::participant_list_hash(&recipients),
            );
        }
        Self::apply_additional_attrs(&mut attrs, options);

        Ok(NodeBuilder::new("message").attrs(attrs).children(children).build())
    }

    fn device_sent_wrapper(&self, destination: &Jid, message: &proto::Message) -> proto::Message {
        proto::Message {
            device_sent_message: Some(Box::new(proto::DeviceSentMessage {
                destination_jid: Some(destination.to_string()),
                message: Some(Box::new(message.clone())),
                phash: Some(String::new()),
            })),
            ..Default::default()
        }
    }

    fn apply_additional_attrs(attrs: &mut Attrs, options: &MessageOptions) {
        for (key, value) in &options.additional_attrs {
            attrs.insert(key.clone(), value.clone());
        }
    }

    async fn group_metadata(&self, jid: &Jid, allow_cached: bool) -> Result<GroupMetadata> {
        if allow_cached {
            if let Some(provider) = &self.config.cached_group_metadata {
                if let Some(metadata) = provider.cached_group_metadata(jid).await {
                    return Ok(metadata);
                }
            }
        }

        let query = NodeBuilder::new("query").attr("request", "interactive").build();
        let response = self
            .transport
            .send_iq(InfoQuery::get("w:g2", jid.clone(), vec![query]))
            .await?;
        let group_node = response.get_optional_child("group").ok_or_else(|| {
            RelayError::MalformedResponse("<group> not found in group info response".into())
        })?;

        let addressing_mode = group_node
            .attrs()
            .optional_string("addressing_mode")
            .map(|s| match s {
                "lid" => AddressingMode::Lid,
                _ => AddressingMode::Pn,
            });

        let mut participants = Vec::new();
        let mut learned = Vec::new();
        for participant_node in group_node.get_children_by_tag("participant") {
            let mut attrs = participant_node.attrs();
            let participant_jid = attrs.jid("jid");
            if attrs.finish().is_err() {
                log::warn!("group participant without a valid jid in {jid}, skipping");
                continue;
            }
            if let Some(phone) = participant_node.attrs().optional_jid("phone_number") {
                if participant_jid.is_lid() {
                    learned.push((participant_jid.to_non_ad(), phone.to_non_ad()));
                }
            }
            participants.push(participant_jid);
        }

        if !learned.is_empty() {
            if let Err(e) = self.lid.store_mappings(&learned).await {
                log::warn!("storing group participant mappings failed: {e}");
            }
        }

        Ok(GroupMetadata {
            addressing_mode,
            participants,
        })
    }

    async fn load_sender_key_memory(&self, group: &Jid) -> HashMap<String, bool> {
        match self
            .store
            .get_one(columns::SENDER_KEY_MEMORY, &group.to_string())
            .await
        {
            Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                log::warn!("sender-key memory for {group} is corrupt, resetting: {e}");
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                log::warn!("sender-key memory read for {group} failed: {e}");
                HashMap::new()
            }
        }
    }

    async fn store_sender_key_memory(&self, group: &Jid, memory: &HashMap<String, bool>) {
        let bytes = match serde_json::to_vec(memory) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("encoding sender-key memory for {group} failed: {e}");
                return;
            }
        };
        let mut writes: ColumnWrites = Default::default();
        writes
            .entry(columns::SENDER_KEY_MEMORY.to_string())
            .or_default()
            .insert(group.to_string(), Some(bytes));
        if let Err(e) = self.store.set(writes).await {
            log::warn!("persisting sender-key memory for {group} failed: {e}");
        }
    }

    async fn clear_sender_key_memory(&self, group: &Jid) {
        let mut writes: ColumnWrites = Default::default();
        writes
            .entry(columns::SENDER_KEY_MEMORY.to_string())
            .or_default()
            .insert(group.to_string(), None);
        if let Err(e) = self.store.set(writes).await {
            log::warn!("clearing sender-key memory for {group} failed: {e}");
        }
    }
}
