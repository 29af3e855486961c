//! Deterministic stand-in for the Signal primitive. Session records are
//! tiny state strings, ciphertexts are tagged plaintexts. Useful for tests
//! and for hosts exercising the relay without real key material.

use async_trait::async_trait;

use crate::error::{RelayError, Result};
use crate::signal::address::{ProtocolAddress, SenderKeyName};
use crate::signal::binding::SignalStorage;
use crate::signal::engine::{EncryptedPayload, PreKeyBundle, SignalEngine, PREKEY_WHISPER_TYPE};

const RECORD_PREKEY: &[u8] = b"state:prekey";
const RECORD_OPEN: &[u8] = b"state:open";
const RECORD_CLOSED: &[u8] = b"state:closed";

const PKMSG_TAG: &[u8] = b"PKMSG:";
const MSG_TAG: &[u8] = b"MSG:";
const SKMSG_TAG: &[u8] = b"SKMSG:";

#[derive(Debug, Default)]
pub struct MockSignalEngine;

impl MockSignalEngine {
    pub fn new() -> Self {
        Self
    }

    /// A record in the freshly-established (unacknowledged prekey) state.
    pub fn prekey_record() -> &'static [u8] {
        RECORD_PREKEY
    }

    /// A record with an open session.
    pub fn open_record() -> &'static [u8] {
        RECORD_OPEN
    }

    /// A record whose sessions are all closed.
    pub fn closed_record() -> &'static [u8] {
        RECORD_CLOSED
    }

    pub fn test_bundle() -> PreKeyBundle {
        PreKeyBundle {
            registration_id: 1,
            device_id: 0,
            identity_key: vec![1; 32],
            signed_pre_key_id: 1,
            signed_pre_key_public: vec![2; 32],
            signed_pre_key_signature: vec![3; 64],
            pre_key: Some((1, vec![4; 32])),
        }
    }

    fn strip<'a>(tag: &[u8], ciphertext: &'a [u8]) -> Result<&'a [u8]> {
        ciphertext
            .strip_prefix(tag)
            .ok_or_else(|| RelayError::Signal("ciphertext tag mismatch".into()))
    }
}

#[async_trait]
impl SignalEngine for MockSignalEngine {
    async fn encrypt(
        &self,
        storage: &dyn SignalStorage,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<EncryptedPayload> {
        let record = storage
            .load_session(address)
            .await?
            .ok_or_else(|| RelayError::Signal(format!("no session for {address}")))?;
        if record == RECORD_CLOSED {
            return Err(RelayError::Signal(format!("session for {address} is closed")));
        }
        let (message_type, tag) = if record == RECORD_PREKEY {
            (PREKEY_WHISPER_TYPE, PKMSG_TAG)
        } else {
            (2, MSG_TAG)
        };
        // The ratchet steps on every encrypt; mirror that with a write.
        storage.store_session(address, &record).await?;
        Ok(EncryptedPayload {
            message_type,
            ciphertext: [tag, plaintext].concat(),
        })
    }

    async fn decrypt_prekey_message(
        &self,
        storage: &dyn SignalStorage,
        address: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let plaintext = Self::strip(PKMSG_TAG, ciphertext)?.to_vec();
        storage.store_session(address, RECORD_OPEN).await?;
        Ok(plaintext)
    }

    async fn decrypt_message(
        &self,
        storage: &dyn SignalStorage,
        address: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        storage
            .load_session(address)
            .await?
            .ok_or_else(|| RelayError::Signal(format!("no session for {address}")))?;
        Ok(Self::strip(MSG_TAG, ciphertext)?.to_vec())
    }

    async fn process_prekey_bundle(
        &self,
        storage: &dyn SignalStorage,
        address: &ProtocolAddress,
        _bundle: &PreKeyBundle,
    ) -> Result<()> {
        storage.store_session(address, RECORD_PREKEY).await
    }

    async fn group_encrypt(
        &self,
        storage: &dyn SignalStorage,
        name: &SenderKeyName,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let record = storage
            .load_sender_key(name)
            .await?
            .filter(|r| !r.is_empty())
            .ok_or_else(|| RelayError::Signal(format!("no sender key state for {}", name.storage_key())))?;
        // Advance the chain iteration.
        let next = Self::bump_iteration(&record);
        storage.store_sender_key(name, &next).await?;
        Ok([SKMSG_TAG, plaintext].concat())
    }

    async fn group_decrypt(
        &self,
        storage: &dyn SignalStorage,
        name: &SenderKeyName,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        storage
            .load_sender_key(name)
            .await?
            .filter(|r| !r.is_empty())
            .ok_or_else(|| RelayError::Signal(format!("no sender key state for {}", name.storage_key())))?;
        Ok(Self::strip(SKMSG_TAG, ciphertext)?.to_vec())
    }

    async fn create_sender_key_distribution(
        &self,
        storage: &dyn SignalStorage,
        name: &SenderKeyName,
    ) -> Result<Vec<u8>> {
        let record = storage.load_sender_key(name).await?.unwrap_or_default();
        if record.is_empty() {
            storage.store_sender_key(name, b"sk:0").await?;
        }
        Ok([b"SKDM:", name.group_id().as_bytes()].concat())
    }

    async fn process_sender_key_distribution(
        &self,
        storage: &dyn SignalStorage,
        name: &SenderKeyName,
        message: &[u8],
    ) -> Result<()> {
        Self::strip(b"SKDM:", message)?;
        storage.store_sender_key(name, b"sk:peer").await
    }

    fn record_has_open_session(&self, record: &[u8]) -> bool {
        !record.is_empty() && record != RECORD_CLOSED
    }

    fn new_sender_key_record(&self) -> Vec<u8> {
        Vec::new()
    }
}

impl MockSignalEngine {
    fn bump_iteration(record: &[u8]) -> Vec<u8> {
        let iteration = std::str::from_utf8(record)
            .ok()
            .and_then(|s| s.strip_prefix("sk:"))
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        format!("sk:{}", iteration + 1).into_bytes()
    }
}
