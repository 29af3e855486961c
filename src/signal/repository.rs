//! Transactional orchestration over the Signal primitive: pairwise and
//! group encryption, session injection and validation, batch deletion, and
//! PN-to-LID session migration. Every public operation runs inside one
//! key-store transaction tagged by its destination, which both serializes
//! same-peer work and makes each operation's writes atomic.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::binary::jid::Jid;
use crate::error::{RelayError, Result};
use crate::lid::LidMappingStore;
use crate::signal::address::{JidSignalExt, SenderKeyName};
use crate::signal::binding::{SignalCreds, SignalStorage, TransactionSignalStorage};
use crate::signal::engine::{PreKeyBundle, SignalEngine, WIRE_TYPE_MSG, WIRE_TYPE_PKMSG};
use crate::store::{columns, DeviceListRecord, KeyStore};

/// Default time-to-live for the migrated-session marker cache.
pub const MIGRATED_SESSION_CACHE_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    /// `pkmsg` or `msg`.
    pub enc_type: &'static str,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GroupEncryptedMessage {
    pub ciphertext: Vec<u8>,
    pub sender_key_distribution: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SessionValidation {
    pub exists: bool,
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSummary {
    pub migrated: usize,
    pub skipped: usize,
    pub total: usize,
}

pub struct SignalRepository {
    store: KeyStore,
    engine: Arc<dyn SignalEngine>,
    lid: Arc<LidMappingStore>,
    creds: SignalCreds,
    migrated_sessions: Cache<String, ()>,
}

impl SignalRepository {
    pub fn new(
        store: KeyStore,
        engine: Arc<dyn SignalEngine>,
        lid: Arc<LidMappingStore>,
        creds: SignalCreds,
        migrated_cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            lid,
            creds,
            migrated_sessions: Cache::builder().time_to_live(migrated_cache_ttl).build(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn SignalEngine> {
        &self.engine
    }

    pub async fn encrypt_message(&self, jid: &Jid, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let tx = self.store.transaction(jid.to_string()).await;
        let storage = TransactionSignalStorage::new(&tx, &self.lid, &self.creds);
        let payload = self
            .engine
            .encrypt(&storage, &jid.to_signal_address(), plaintext)
            .await?;
        tx.commit().await?;
        Ok(EncryptedMessage {
            enc_type: payload.wire_type(),
            ciphertext: payload.ciphertext,
        })
    }

    pub async fn decrypt_message(
        &self,
        jid: &Jid,
        enc_type: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let tx = self.store.transaction(jid.to_string()).await;
        let storage = TransactionSignalStorage::new(&tx, &self.lid, &self.creds);
        let address = jid.to_signal_address();
        let plaintext = match enc_type {
            WIRE_TYPE_PKMSG => {
                self.engine
                    .decrypt_prekey_message(&storage, &address, ciphertext)
                    .await?
            }
            WIRE_TYPE_MSG => {
                self.engine
                    .decrypt_message(&storage, &address, ciphertext)
                    .await?
            }
            other => return Err(RelayError::UnknownMessageType(other.to_string())),
        };
        tx.commit().await?;
        Ok(plaintext)
    }

    /// Encrypt a group payload with our sender key, returning both the
    /// `skmsg` ciphertext and the distribution message new devices need.
    /// A missing sender-key record is initialized empty before use.
    pub async fn encrypt_group_message(
        &self,
        group: &Jid,
        me: &Jid,
        plaintext: &[u8],
    ) -> Result<GroupEncryptedMessage> {
        let tx = self.store.transaction(group.to_string()).await;
        let storage = TransactionSignalStorage::new(&tx, &self.lid, &self.creds);
        let name = SenderKeyName::new(group.to_string(), me.to_signal_address().to_string());

        if storage.load_sender_key(&name).await?.is_none() {
            storage
                .store_sender_key(&name, &self.engine.new_sender_key_record())
                .await?;
        }
        let sender_key_distribution = self
            .engine
            .create_sender_key_distribution(&storage, &name)
            .await?;
        let ciphertext = self.engine.group_encrypt(&storage, &name, plaintext).await?;
        tx.commit().await?;

        Ok(GroupEncryptedMessage {
            ciphertext,
            sender_key_distribution,
        })
    }

    pub async fn decrypt_group_message(
        &self,
        group: &Jid,
        author: &Jid,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let tx = self.store.transaction(group.to_string()).await;
        let storage = TransactionSignalStorage::new(&tx, &self.lid, &self.creds);
        let name = SenderKeyName::new(group.to_string(), author.to_signal_address().to_string());
        let plaintext = self.engine.group_decrypt(&storage, &name, ciphertext).await?;
        tx.commit().await?;
        Ok(plaintext)
    }

    /// Install a sender key a peer distributed to us.
    pub async fn process_sender_key_distribution_message(
        &self,
        group_id: Option<&str>,
        author: &Jid,
        message: &[u8],
    ) -> Result<()> {
        let group_id = group_id.ok_or(RelayError::MissingGroupId)?;
        let tx = self.store.transaction(group_id.to_string()).await;
        let storage = TransactionSignalStorage::new(&tx, &self.lid, &self.creds);
        let name = SenderKeyName::new(group_id, author.to_signal_address().to_string());

        if storage.load_sender_key(&name).await?.is_none() {
            storage
                .store_sender_key(&name, &self.engine.new_sender_key_record())
                .await?;
        }
        self.engine
            .process_sender_key_distribution(&storage, &name, message)
            .await?;
        tx.commit().await
        .map_err(Into::into)
    }

    /// Seed an outgoing pairwise session from a fetched prekey bundle.
    pub async fn inject_e2e_session(&self, jid: &Jid, bundle: &PreKeyBundle) -> Result<()> {
        let tx = self.store.transaction(jid.to_string()).await;
        let storage = TransactionSignalStorage::new(&tx, &self.lid, &self.creds);
        self.engine
            .process_prekey_bundle(&storage, &jid.to_signal_address(), bundle)
            .await?;
        tx.commit().await.map_err(Into::into)
    }

    /// A session exists iff its record loads and reports at least one open
    /// session.
    pub async fn validate_session(&self, jid: &Jid) -> Result<SessionValidation> {
        let tx = self.store.transaction(jid.to_string()).await;
        let storage = TransactionSignalStorage::new(&tx, &self.lid, &self.creds);
        let record = storage.load_session(&jid.to_signal_address()).await?;
        Ok(match record {
            None => SessionValidation {
                exists: false,
                reason: Some("no session record"),
            },
            Some(record) if !self.engine.record_has_open_session(&record) => SessionValidation {
                exists: false,
                reason: Some("no open session"),
            },
            Some(_) => SessionValidation {
                exists: true,
                reason: None,
            },
        })
    }

    /// Null out every target's session in one transaction.
    pub async fn delete_session(&self, jids: &[Jid]) -> Result<()> {
        if jids.is_empty() {
            return Ok(());
        }
        let tx = self
            .store
            .transaction(format!("delete-{}-sessions", jids.len()))
            .await;
        for jid in jids {
            tx.set(columns::SESSION, jid.to_signal_address().to_string(), None);
        }
        tx.commit().await.map_err(Into::into)
    }

    /// Move every device session of `from`'s user onto the LID identity of
    /// `to`. The target's device component is ignored; the source's
    /// persisted device list drives the walk. For each source session with
    /// an open state, the record is re-addressed (device preserved, server
    /// per the hosted-device rule) and the PN-addressed slot is deleted in
    /// the same write batch, so no crash can leave a half-moved session.
    pub async fn migrate_session(&self, from: &Jid, to: &Jid) -> Result<MigrationSummary> {
        let raw = self.store.get_one(columns::DEVICE_LIST, &from.user).await?;
        let Some(raw) = raw else {
            return Ok(MigrationSummary {
                migrated: 0,
                skipped: 0,
                total: 0,
            });
        };
        let record: DeviceListRecord = serde_json::from_slice(&raw)
            .map_err(|e| RelayError::MalformedResponse(format!("device list for {}: {e}", from.user)))?;

        let mut devices: Vec<u16> = record
            .devices
            .iter()
            .filter_map(|d| d.parse::<u16>().ok())
            .collect();
        if !devices.contains(&from.device) {
            devices.push(from.device);
        }
        let total = devices.len();

        let mut candidates = Vec::with_capacity(devices.len());
        for device in devices {
            let marker = format!("{}.{}", from.user, device);
            if self.migrated_sessions.get(&marker).await.is_none() {
                candidates.push(device);
            }
        }

        let tx = self
            .store
            .transaction(format!("migrate-{}-sessions-{}", candidates.len(), to.user))
            .await;

        let source_addresses: Vec<String> = candidates
            .iter()
            .map(|&device| {
                Jid::pn_device(from.user.clone(), device)
                    .to_signal_address()
                    .to_string()
            })
            .collect();
        let sessions = tx.get(columns::SESSION, &source_addresses).await?;

        let mut migrated_devices = Vec::new();
        for (&device, source_address) in candidates.iter().zip(&source_addresses) {
            let Some(Some(record)) = sessions.get(source_address) else {
                continue;
            };
            if !self.engine.record_has_open_session(record) {
                continue;
            }
            let target_address = Jid::lid_device(to.user.clone(), device)
                .to_signal_address()
                .to_string();
            tx.set(columns::SESSION, target_address, Some(record.clone()));
            tx.set(columns::SESSION, source_address.clone(), None);
            migrated_devices.push(device);
        }
        tx.commit().await?;

        for device in &migrated_devices {
            self.migrated_sessions
                .insert(format!("{}.{}", from.user, device), ())
                .await;
        }

        let migrated = migrated_devices.len();
        log::info!(
            "migrated {migrated}/{total} sessions from {} to {}",
            from.user,
            to.user
        );
        Ok(MigrationSummary {
            migrated,
            skipped: total - migrated,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::mock::MockSignalEngine;
    use crate::store::{ColumnWrites, MemoryStore};
    use std::collections::HashMap;

    fn creds() -> SignalCreds {
        SignalCreds {
            registration_id: 42,
            identity_public: vec![7; 32],
            signed_pre_key: b"spk".to_vec(),
        }
    }

    fn repository() -> (SignalRepository, KeyStore) {
        let store = KeyStore::new(Arc::new(MemoryStore::new()));
        let lid = Arc::new(LidMappingStore::new(
            store.clone(),
            crate::lid::MAPPING_CACHE_TTL,
        ));
        let repo = SignalRepository::new(
            store.clone(),
            Arc::new(MockSignalEngine::new()),
            lid,
            creds(),
            MIGRATED_SESSION_CACHE_TTL,
        );
        (repo, store)
    }

    async fn put_session(store: &KeyStore, address: &str, record: &[u8]) {
        let mut writes: ColumnWrites = HashMap::new();
        writes
            .entry(columns::SESSION.into())
            .or_default()
            .insert(address.into(), Some(record.to_vec()));
        store.set(writes).await.unwrap();
    }

    async fn put_device_list(store: &KeyStore, user: &str, devices: &[&str]) {
        let record = DeviceListRecord {
            devices: devices.iter().map(|s| s.to_string()).collect(),
        };
        let mut writes: ColumnWrites = HashMap::new();
        writes
            .entry(columns::DEVICE_LIST.into())
            .or_default()
            .insert(user.into(), Some(serde_json::to_vec(&record).unwrap()));
        store.set(writes).await.unwrap();
    }

    #[tokio::test]
    async fn encrypt_without_session_fails() {
        let (repo, _) = repository();
        let jid = Jid::pn_device("1555", 0);
        assert!(repo.encrypt_message(&jid, b"hi").await.is_err());
    }

    #[tokio::test]
    async fn fresh_session_yields_pkmsg_then_msg_after_ack() {
        let (repo, _) = repository();
        let jid = Jid::pn_device("1555", 0);
        repo.inject_e2e_session(&jid, &MockSignalEngine::test_bundle())
            .await
            .unwrap();

        let first = repo.encrypt_message(&jid, b"hi").await.unwrap();
        assert_eq!(first.enc_type, "pkmsg");

        // An inbound prekey decrypt acknowledges the session.
        repo.decrypt_message(&jid, "pkmsg", &first.ciphertext)
            .await
            .unwrap();
        let second = repo.encrypt_message(&jid, b"again").await.unwrap();
        assert_eq!(second.enc_type, "msg");
    }

    #[tokio::test]
    async fn decrypt_rejects_unknown_type() {
        let (repo, _) = repository();
        let jid = Jid::pn_device("1555", 0);
        let err = repo.decrypt_message(&jid, "skmsg2", b"x").await.unwrap_err();
        assert!(matches!(err, RelayError::UnknownMessageType(_)));
    }

    #[tokio::test]
    async fn group_encrypt_creates_record_and_distribution() {
        let (repo, store) = repository();
        let group = Jid::group("123-456");
        let me = Jid::lid_device("9999", 2);

        let out = repo.encrypt_group_message(&group, &me, b"hello").await.unwrap();
        assert!(!out.ciphertext.is_empty());
        assert!(!out.sender_key_distribution.is_empty());

        let key = SenderKeyName::new(group.to_string(), me.to_signal_address().to_string());
        assert!(store
            .get_one(columns::SENDER_KEY, &key.storage_key())
            .await
            .unwrap()
            .is_some());

        // Round-trip through the group cipher.
        let plain = repo
            .decrypt_group_message(&group, &me, &out.ciphertext)
            .await
            .unwrap();
        assert_eq!(plain, b"hello");
    }

    #[tokio::test]
    async fn skdm_processing_requires_group_id() {
        let (repo, _) = repository();
        let author = Jid::pn_device("1555", 1);
        let err = repo
            .process_sender_key_distribution_message(None, &author, b"skdm")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MissingGroupId));
    }

    #[tokio::test]
    async fn peer_sender_key_installs_and_decrypts() {
        let (repo, _) = repository();
        let group = Jid::group("123-456");
        let author = Jid::lid_device("7001", 2);

        repo.process_sender_key_distribution_message(
            Some("123-456@g.us"),
            &author,
            b"SKDM:123-456@g.us",
        )
        .await
        .unwrap();

        let plain = repo
            .decrypt_group_message(&group, &author, b"SKMSG:group payload")
            .await
            .unwrap();
        assert_eq!(plain, b"group payload");
    }

    #[tokio::test]
    async fn validate_and_delete_sessions() {
        let (repo, store) = repository();
        let jid = Jid::pn_device("1555", 0);

        assert!(!repo.validate_session(&jid).await.unwrap().exists);

        put_session(&store, "1555.0", MockSignalEngine::open_record()).await;
        assert!(repo.validate_session(&jid).await.unwrap().exists);

        put_session(&store, "1555.0", MockSignalEngine::closed_record()).await;
        let validation = repo.validate_session(&jid).await.unwrap();
        assert!(!validation.exists);
        assert_eq!(validation.reason, Some("no open session"));

        put_session(&store, "1555.0", MockSignalEngine::open_record()).await;
        repo.delete_session(std::slice::from_ref(&jid)).await.unwrap();
        assert!(!repo.validate_session(&jid).await.unwrap().exists);
    }

    #[tokio::test]
    async fn migration_moves_open_sessions_atomically() {
        let (repo, store) = repository();
        put_device_list(&store, "1555", &["0", "1", "2"]).await;
        put_session(&store, "1555.0", MockSignalEngine::open_record()).await;
        put_session(&store, "1555.2", MockSignalEngine::open_record()).await;

        let summary = repo
            .migrate_session(&Jid::pn("1555"), &Jid::lid("9999"))
            .await
            .unwrap();
        assert_eq!(
            summary,
            MigrationSummary {
                migrated: 2,
                skipped: 1,
                total: 3
            }
        );

        assert!(store.get_one(columns::SESSION, "1555.0").await.unwrap().is_none());
        assert!(store.get_one(columns::SESSION, "1555.2").await.unwrap().is_none());
        assert!(store.get_one(columns::SESSION, "9999_1.0").await.unwrap().is_some());
        assert!(store.get_one(columns::SESSION, "9999_1.2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn migration_without_device_list_is_a_noop() {
        let (repo, _) = repository();
        let summary = repo
            .migrate_session(&Jid::pn("1555"), &Jid::lid("9999"))
            .await
            .unwrap();
        assert_eq!(summary.total, 0);
    }

    #[tokio::test]
    async fn migration_skips_devices_already_marked() {
        let (repo, store) = repository();
        put_device_list(&store, "1555", &["0"]).await;
        put_session(&store, "1555.0", MockSignalEngine::open_record()).await;

        let first = repo
            .migrate_session(&Jid::pn("1555"), &Jid::lid("9999"))
            .await
            .unwrap();
        assert_eq!(first.migrated, 1);

        // Restore a source session; the cache marker must keep it untouched.
        put_session(&store, "1555.0", MockSignalEngine::open_record()).await;
        let second = repo
            .migrate_session(&Jid::pn("1555"), &Jid::lid("9999"))
            .await
            .unwrap();
        assert_eq!(second.migrated, 0);
        assert!(store.get_one(columns::SESSION, "1555.0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn hosted_device_migrates_onto_hosted_lid_address() {
        let (repo, store) = repository();
        put_device_list(&store, "1555", &["99"]).await;
        put_session(&store, "1555_2.99", MockSignalEngine::open_record()).await;

        // The source JID for a hosted device lives on the hosted server.
        let summary = repo
            .migrate_session(&Jid::pn_device("1555", 99), &Jid::lid("9999"))
            .await
            .unwrap();
        assert_eq!(summary.migrated, 1);
        assert!(store.get_one(columns::SESSION, "9999_3.99").await.unwrap().is_some());
        assert!(store.get_one(columns::SESSION, "1555_2.99").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pn_encrypt_uses_lid_session_once_mapped() {
        let (repo, store) = repository();
        // Open session stored under the LID address only.
        put_session(&store, "9999_1.0", MockSignalEngine::open_record()).await;
        repo.lid
            .store_mappings(&[(Jid::lid("9999"), Jid::pn("1555"))])
            .await
            .unwrap();

        // Encrypting to the PN JID must find the LID session.
        let out = repo
            .encrypt_message(&Jid::pn_device("1555", 0), b"hi")
            .await
            .unwrap();
        assert_eq!(out.enc_type, "msg");
        // And the PN slot stays empty.
        assert!(store.get_one(columns::SESSION, "1555.0").await.unwrap().is_none());
    }
}
