//! Bidirectional user-level mapping between phone-number identities and LID
//! identities, with a USync-backed resolver delegate for backfill.
//!
//! Both halves of a mapping are written in one `lid-mapping` transaction:
//! the forward key is the PN user, the reverse key is the LID user with a
//! `_reverse` suffix. Lookups go cache, then key store, then (for the bulk
//! path) the resolver.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tokio::sync::RwLock;

use crate::binary::jid::Jid;
use crate::error::{RelayError, Result};
use crate::store::{columns, KeyStore};

/// Default time-to-idle for mapping lookups.
pub const MAPPING_CACHE_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// A resolved identity pair. Both sides carry the device suffix of the JID
/// the lookup started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LidPnPair {
    pub pn: Jid,
    pub lid: Jid,
}

/// Host-supplied delegate that asks the server for PN-to-LID mappings,
/// typically through a USync query. Input JIDs are canonical user-level
/// phone JIDs; unknown users are simply absent from the result.
#[async_trait]
pub trait PnLidResolver: Send + Sync {
    async fn resolve(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>>;
}

pub struct LidMappingStore {
    store: KeyStore,
    cache: Cache<String, String>,
    resolver: RwLock<Option<Arc<dyn PnLidResolver>>>,
}

impl LidMappingStore {
    pub fn new(store: KeyStore, cache_ttl: Duration) -> Self {
        Self {
            store,
            // Access-refreshed: a hit keeps the mapping warm.
            cache: Cache::builder().time_to_idle(cache_ttl).build(),
            resolver: RwLock::new(None),
        }
    }

    /// Install the backfill delegate. Wired after construction because the
    /// usual resolver (a USync query) needs the transport, which in turn is
    /// built alongside this store.
    pub async fn set_resolver(&self, resolver: Arc<dyn PnLidResolver>) {
        *self.resolver.write().await = Some(resolver);
    }

    fn classify(a: &Jid, b: &Jid) -> Result<(Jid, Jid)> {
        match (a.is_lid(), b.is_pn(), b.is_lid(), a.is_pn()) {
            (true, true, _, _) => Ok((a.clone(), b.clone())),
            (_, _, true, true) => Ok((b.clone(), a.clone())),
            _ => Err(RelayError::MappingMismatch {
                pn: a.to_string(),
                lid: b.to_string(),
            }),
        }
    }

    /// Persist a batch of mappings. Invalid pairs are logged and skipped,
    /// pairs equal to what is already stored are no-ops. Returns the pairs
    /// that were actually new, at user level.
    pub async fn store_mappings(&self, pairs: &[(Jid, Jid)]) -> Result<Vec<LidPnPair>> {
        let mut fresh: Vec<(String, String)> = Vec::new();
        let mut seen_pns = HashSet::new();

        for (a, b) in pairs {
            let (lid, pn) = match Self::classify(a, b) {
                Ok(split) => split,
                Err(e) => {
                    log::warn!("skipping mapping entry: {e}");
                    continue;
                }
            };
            if !seen_pns.insert(pn.user.clone()) {
                continue;
            }
            if let Some(existing) = self.lid_user_for_pn_user(&pn.user).await {
                if existing == lid.user {
                    continue;
                }
                log::info!(
                    "updating LID mapping for {}: {} -> {}",
                    pn.user,
                    existing,
                    lid.user
                );
            }
            fresh.push((pn.user.clone(), lid.user.clone()));
        }

        if fresh.is_empty() {
            return Ok(Vec::new());
        }

        let tx = self.store.transaction("lid-mapping").await;
        for (pn_user, lid_user) in &fresh {
            tx.set(
                columns::LID_MAPPING,
                pn_user.clone(),
                Some(lid_user.as_bytes().to_vec()),
            );
            tx.set(
                columns::LID_MAPPING,
                format!("{lid_user}_reverse"),
                Some(pn_user.as_bytes().to_vec()),
            );
        }
        tx.commit().await?;

        let mut stored = Vec::with_capacity(fresh.len());
        for (pn_user, lid_user) in fresh {
            self.cache
                .insert(format!("pn:{pn_user}"), lid_user.clone())
                .await;
            self.cache
                .insert(format!("lid:{lid_user}"), pn_user.clone())
                .await;
            stored.push(LidPnPair {
                pn: Jid::pn(pn_user),
                lid: Jid::lid(lid_user),
            });
        }
        Ok(stored)
    }

    /// User-level forward lookup, cache then key store. Never consults the
    /// resolver.
    pub async fn lid_user_for_pn_user(&self, pn_user: &str) -> Option<String> {
        let cache_key = format!("pn:{pn_user}");
        if let Some(hit) = self.cache.get(&cache_key).await {
            return Some(hit);
        }
        let raw = match self.store.get_one(columns::LID_MAPPING, pn_user).await {
            Ok(value) => value?,
            Err(e) => {
                log::warn!("LID mapping read failed for {pn_user}: {e}");
                return None;
            }
        };
        let lid_user = match String::from_utf8(raw) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("stored LID mapping for {pn_user} is not valid UTF-8: {e}");
                return None;
            }
        };
        self.cache.insert(cache_key, lid_user.clone()).await;
        self.cache
            .insert(format!("lid:{lid_user}"), pn_user.to_string())
            .await;
        Some(lid_user)
    }

    pub async fn pn_user_for_lid_user(&self, lid_user: &str) -> Option<String> {
        let cache_key = format!("lid:{lid_user}");
        if let Some(hit) = self.cache.get(&cache_key).await {
            return Some(hit);
        }
        let raw = match self
            .store
            .get_one(columns::LID_MAPPING, &format!("{lid_user}_reverse"))
            .await
        {
            Ok(value) => value?,
            Err(e) => {
                log::warn!("reverse LID mapping read failed for {lid_user}: {e}");
                return None;
            }
        };
        let pn_user = match String::from_utf8(raw) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("stored reverse mapping for {lid_user} is not valid UTF-8: {e}");
                return None;
            }
        };
        self.cache.insert(cache_key, pn_user.clone()).await;
        self.cache
            .insert(format!("pn:{pn_user}"), lid_user.to_string())
            .await;
        Some(pn_user)
    }

    /// LID equivalent of a PN JID, device suffix preserved. The server
    /// follows the device domain: the hosted device id lands on the hosted
    /// LID server.
    pub async fn lid_for_pn(&self, pn: &Jid) -> Option<Jid> {
        let lid_user = self.lid_user_for_pn_user(&pn.user).await?;
        Some(Jid::lid_device(lid_user, pn.device))
    }

    /// PN equivalent of a LID JID, device suffix preserved; hosted LIDs map
    /// back onto the hosted PN server.
    pub async fn pn_for_lid(&self, lid: &Jid) -> Option<Jid> {
        let pn_user = self.pn_user_for_lid_user(&lid.user).await?;
        Some(Jid::pn_device(pn_user, lid.device))
    }

    /// Bulk forward lookup with resolver backfill. Users the resolver does
    /// not know stay absent from the result; negative answers are not
    /// cached.
    pub async fn lids_for_pns(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>> {
        let mut out = Vec::with_capacity(pns.len());
        let mut unresolved: Vec<Jid> = Vec::new();

        for pn in pns {
            if !pn.is_pn() {
                log::warn!("lids_for_pns: {pn} is not a PN JID, skipping");
                continue;
            }
            match self.lid_user_for_pn_user(&pn.user).await {
                Some(lid_user) => out.push(LidPnPair {
                    pn: pn.clone(),
                    lid: Jid::lid_device(lid_user, pn.device),
                }),
                None => unresolved.push(pn.clone()),
            }
        }

        if !unresolved.is_empty() {
            let resolver = self.resolver.read().await.clone();
            if let Some(resolver) = resolver {
                // Canonical user-level phone JIDs for the query; hosted
                // device suffixes must not leak into the resolver call.
                let mut seen = HashSet::new();
                let canonical: Vec<Jid> = unresolved
                    .iter()
                    .filter(|j| seen.insert(j.user.clone()))
                    .map(|j| Jid::pn(j.user.clone()))
                    .collect();

                match resolver.resolve(&canonical).await {
                    Ok(found) if !found.is_empty() => {
                        let pairs: Vec<(Jid, Jid)> =
                            found.iter().map(|p| (p.lid.clone(), p.pn.clone())).collect();
                        if let Err(e) = self.store_mappings(&pairs).await {
                            log::warn!("persisting resolved LID mappings failed: {e}");
                        }
                        for pn in &unresolved {
                            if let Some(lid_user) = self.lid_user_for_pn_user(&pn.user).await {
                                out.push(LidPnPair {
                                    pn: pn.clone(),
                                    lid: Jid::lid_device(lid_user, pn.device),
                                });
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("LID resolver query failed: {e}"),
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mapping_store() -> LidMappingStore {
        let store = KeyStore::new(Arc::new(MemoryStore::new()));
        LidMappingStore::new(store, MAPPING_CACHE_TTL)
    }

    #[tokio::test]
    async fn store_and_lookup_roundtrip() {
        let store = mapping_store();
        let stored = store
            .store_mappings(&[(Jid::lid("9999"), Jid::pn("15551234567"))])
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);

        let lid = store.lid_for_pn(&Jid::pn("15551234567")).await.unwrap();
        assert_eq!(lid.user, "9999");
        assert_eq!(lid.server, "lid");

        let pn = store.pn_for_lid(&Jid::lid("9999")).await.unwrap();
        assert_eq!(pn.user, "15551234567");
        assert_eq!(pn.server, "s.whatsapp.net");
    }

    #[tokio::test]
    async fn device_suffix_is_preserved_and_hosted_aware() {
        let store = mapping_store();
        store
            .store_mappings(&[(Jid::pn("15551234567"), Jid::lid("9999"))])
            .await
            .unwrap();

        let lid = store
            .lid_for_pn(&Jid::pn_device("15551234567", 3))
            .await
            .unwrap();
        assert_eq!(lid.device, 3);
        assert_eq!(lid.server, "lid");

        let hosted = store
            .lid_for_pn(&Jid::pn_device("15551234567", 99))
            .await
            .unwrap();
        assert_eq!(hosted.device, 99);
        assert_eq!(hosted.server, "hosted.lid");

        let pn = store
            .pn_for_lid(&Jid::lid_device("9999", 99))
            .await
            .unwrap();
        assert_eq!(pn.server, "hosted");
    }

    #[tokio::test]
    async fn storing_same_pair_twice_is_a_noop() {
        let store = mapping_store();
        let pair = (Jid::lid("9999"), Jid::pn("15551234567"));
        let first = store.store_mappings(std::slice::from_ref(&pair)).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.store_mappings(&[pair]).await.unwrap();
        assert!(second.is_empty(), "duplicate mapping must not rewrite");
    }

    #[tokio::test]
    async fn invalid_pairs_are_skipped_not_fatal() {
        let store = mapping_store();
        let stored = store
            .store_mappings(&[
                (Jid::pn("1111"), Jid::pn("2222")),
                (Jid::lid("9999"), Jid::lid("8888")),
                (Jid::lid("7777"), Jid::pn("3333")),
            ])
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].pn.user, "3333");
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PnLidResolver for CountingResolver {
        async fn resolve(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(pns.iter().all(|j| j.device == 0), "resolver wants user-level JIDs");
            Ok(pns
                .iter()
                .filter(|j| j.user == "15551234567")
                .map(|j| LidPnPair {
                    pn: j.clone(),
                    lid: Jid::lid("9999"),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn resolver_backfills_and_persists() {
        let store = mapping_store();
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        store.set_resolver(resolver.clone()).await;

        let pairs = store
            .lids_for_pns(&[Jid::pn_device("15551234567", 2)])
            .await
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].lid.user, "9999");
        assert_eq!(pairs[0].lid.device, 2);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        // Second call is served from the mapping, not the resolver.
        let again = store
            .lids_for_pns(&[Jid::pn("15551234567")])
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_resolver_results_are_not_cached() {
        let store = mapping_store();
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        store.set_resolver(resolver.clone()).await;

        let unknown = Jid::pn("440000000");
        assert!(store.lids_for_pns(std::slice::from_ref(&unknown)).await.unwrap().is_empty());
        assert!(store.lids_for_pns(&[unknown]).await.unwrap().is_empty());
        // Both calls reached the resolver.
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hosted_pn_is_normalized_for_resolver() {
        struct AssertingResolver;
        #[async_trait]
        impl PnLidResolver for AssertingResolver {
            async fn resolve(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>> {
                assert_eq!(pns.len(), 1);
                assert_eq!(pns[0].to_string(), "15551234567@s.whatsapp.net");
                Ok(vec![])
            }
        }

        let store = mapping_store();
        store.set_resolver(Arc::new(AssertingResolver)).await;
        store
            .lids_for_pns(&[Jid::pn_device("15551234567", 99)])
            .await
            .unwrap();
    }
}
