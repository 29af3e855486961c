//! Capability surface of the Signal primitive. The relay core orchestrates
//! sessions and sender keys but never touches the ratchet math; hosts plug
//! in a real implementation, tests use [`crate::signal::mock`].

use async_trait::async_trait;

use crate::error::Result;
use crate::signal::address::{ProtocolAddress, SenderKeyName};
use crate::signal::binding::SignalStorage;

/// Whisper message-type constant for a PreKey message.
pub const PREKEY_WHISPER_TYPE: u8 = 3;

pub const WIRE_TYPE_PKMSG: &str = "pkmsg";
pub const WIRE_TYPE_MSG: &str = "msg";
pub const WIRE_TYPE_SKMSG: &str = "skmsg";

#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub message_type: u8,
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Maps the Whisper message type onto the wire `type` attribute.
    pub fn wire_type(&self) -> &'static str {
        if self.message_type == PREKEY_WHISPER_TYPE {
            WIRE_TYPE_PKMSG
        } else {
            WIRE_TYPE_MSG
        }
    }

    pub fn is_prekey(&self) -> bool {
        self.message_type == PREKEY_WHISPER_TYPE
    }
}

/// A peer's published key material, as fetched through an `encrypt get` IQ.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub device_id: u32,
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub pre_key: Option<(u32, Vec<u8>)>,
}

#[async_trait]
pub trait SignalEngine: Send + Sync {
    /// Pairwise encrypt under an existing session.
    async fn encrypt(
        &self,
        storage: &dyn SignalStorage,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload>;

    async fn decrypt_prekey_message(
        &self,
        storage: &dyn SignalStorage,
        address: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    async fn decrypt_message(
        &self,
        storage: &dyn SignalStorage,
        address: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Seed an outgoing session from a fetched prekey bundle.
    async fn process_prekey_bundle(
        &self,
        storage: &dyn SignalStorage,
        address: &ProtocolAddress,
        bundle: &PreKeyBundle,
    ) -> Result<()>;

    async fn group_encrypt(
        &self,
        storage: &dyn SignalStorage,
        name: &SenderKeyName,
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    async fn group_decrypt(
        &self,
        storage: &dyn SignalStorage,
        name: &SenderKeyName,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Build (creating sender-key state on first use) the distribution
    /// message peers need before they can read our `skmsg` payloads.
    async fn create_sender_key_distribution(
        &self,
        storage: &dyn SignalStorage,
        name: &SenderKeyName,
    ) -> Result<Vec<u8>>;

    /// Install a sender key received from a peer.
    async fn process_sender_key_distribution(
        &self,
        storage: &dyn SignalStorage,
        name: &SenderKeyName,
        message: &[u8],
    ) -> Result<()>;

    /// Probe a serialized session record for at least one open session.
    fn record_has_open_session(&self, record: &[u8]) -> bool;

    /// A freshly initialized, empty sender-key record.
    fn new_sender_key_record(&self) -> Vec<u8>;
}
