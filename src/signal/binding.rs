//! Storage callbacks handed to the Signal primitive, backed by an open
//! key-store transaction so that every mutation of an operation lands in one
//! atomic batch.

use async_trait::async_trait;

use crate::error::Result;
use crate::lid::LidMappingStore;
use crate::signal::address::{ProtocolAddress, SenderKeyName};
use crate::store::{columns, Transaction};

/// Our long-lived Signal key material, supplied by the host's auth state.
#[derive(Debug, Clone)]
pub struct SignalCreds {
    pub registration_id: u32,
    pub identity_public: Vec<u8>,
    pub signed_pre_key: Vec<u8>,
}

#[async_trait]
pub trait SignalStorage: Send + Sync {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<Vec<u8>>>;
    async fn store_session(&self, address: &ProtocolAddress, record: &[u8]) -> Result<()>;
    async fn load_pre_key(&self, id: u32) -> Result<Option<Vec<u8>>>;
    async fn remove_pre_key(&self, id: u32) -> Result<()>;
    async fn load_signed_pre_key(&self, id: u32) -> Result<Option<Vec<u8>>>;
    async fn load_sender_key(&self, name: &SenderKeyName) -> Result<Option<Vec<u8>>>;
    async fn store_sender_key(&self, name: &SenderKeyName, record: &[u8]) -> Result<()>;
    /// Trust decisions are enforced elsewhere in the stack.
    async fn is_trusted_identity(&self, address: &ProtocolAddress, identity: &[u8]) -> bool;
    fn our_registration_id(&self) -> u32;
    fn our_identity(&self) -> &[u8];
}

/// [`SignalStorage`] over an open [`Transaction`].
///
/// Session access resolves addressing: a session asked for under a plain
/// phone-number signal user is transparently served from (and written to)
/// the LID-addressed slot once the mapping is known, so PN-addressed
/// encrypt calls migrate on their own as mappings arrive.
pub struct TransactionSignalStorage<'a> {
    tx: &'a Transaction,
    lid: &'a LidMappingStore,
    creds: &'a SignalCreds,
}

impl<'a> TransactionSignalStorage<'a> {
    pub fn new(tx: &'a Transaction, lid: &'a LidMappingStore, creds: &'a SignalCreds) -> Self {
        Self { tx, lid, creds }
    }

    async fn resolve_session_address(&self, address: &ProtocolAddress) -> ProtocolAddress {
        if address.is_domain_tagged() {
            return address.clone();
        }
        match self.lid.lid_user_for_pn_user(address.name()).await {
            Some(lid_user) => {
                let resolved = ProtocolAddress::new(format!("{lid_user}_1"), address.device());
                log::debug!("session address {address} resolved to {resolved}");
                resolved
            }
            None => address.clone(),
        }
    }
}

#[async_trait]
impl SignalStorage for TransactionSignalStorage<'_> {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<Vec<u8>>> {
        let resolved = self.resolve_session_address(address).await;
        Ok(self
            .tx
            .get_one(columns::SESSION, &resolved.to_string())
            .await?)
    }

    async fn store_session(&self, address: &ProtocolAddress, record: &[u8]) -> Result<()> {
        let resolved = self.resolve_session_address(address).await;
        self.tx
            .set(columns::SESSION, resolved.to_string(), Some(record.to_vec()));
        Ok(())
    }

    async fn load_pre_key(&self, id: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.tx.get_one(columns::PRE_KEY, &id.to_string()).await?)
    }

    async fn remove_pre_key(&self, id: u32) -> Result<()> {
        self.tx.set(columns::PRE_KEY, id.to_string(), None);
        Ok(())
    }

    async fn load_signed_pre_key(&self, _id: u32) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.creds.signed_pre_key.clone()))
    }

    async fn load_sender_key(&self, name: &SenderKeyName) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tx
            .get_one(columns::SENDER_KEY, &name.storage_key())
            .await?)
    }

    async fn store_sender_key(&self, name: &SenderKeyName, record: &[u8]) -> Result<()> {
        self.tx
            .set(columns::SENDER_KEY, name.storage_key(), Some(record.to_vec()));
        Ok(())
    }

    async fn is_trusted_identity(&self, _address: &ProtocolAddress, _identity: &[u8]) -> bool {
        true
    }

    fn our_registration_id(&self) -> u32 {
        self.creds.registration_id
    }

    fn our_identity(&self) -> &[u8] {
        &self.creds.identity_public
    }
}
