//! Device discovery: resolve user-level JIDs into the full set of
//! device-qualified JIDs, backed by a short-lived per-user cache, a USync
//! round-trip for the misses, and device-list persistence for the session
//! migration path. Mappings the response carries are learned as a side
//! effect, and newly mapped LIDs get their sessions force-refreshed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::binary::jid::{Jid, SERVER_JID};
use crate::cache::TtlCache;
use crate::error::Result;
use crate::lid::LidMappingStore;
use crate::session::SessionAsserter;
use crate::store::{columns, ColumnWrites, DeviceListRecord, KeyStore};
use crate::transport::{generate_message_id, InfoQuery, Transport};
use crate::usync;

/// Default time-to-live for the user-devices cache.
pub const USER_DEVICES_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub struct DeviceDirectory {
    transport: Arc<dyn Transport>,
    store: KeyStore,
    lid: Arc<LidMappingStore>,
    asserter: Arc<SessionAsserter>,
    cache: TtlCache<String, Vec<Jid>>,
}

impl DeviceDirectory {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: KeyStore,
        lid: Arc<LidMappingStore>,
        asserter: Arc<SessionAsserter>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            lid,
            asserter,
            cache: TtlCache::new(cache_ttl),
        }
    }

    /// Expand the inputs into device-qualified JIDs. JIDs arriving with an
    /// explicit device pass through untouched; the rest are looked up per
    /// user, from the cache when `use_cache` allows it, otherwise through
    /// one USync query. `ignore_zero_devices` drops the primary device from
    /// the result.
    pub async fn get_devices(
        &self,
        jids: &[Jid],
        use_cache: bool,
        ignore_zero_devices: bool,
    ) -> Result<Vec<Jid>> {
        let mut result: Vec<Jid> = Vec::new();
        let mut to_lookup: Vec<Jid> = Vec::new();
        let mut queued = HashSet::new();

        for jid in jids {
            if !jid.is_user() {
                log::warn!("get_devices: {jid} is not a user JID, skipping");
                continue;
            }
            if jid.device != 0 {
                result.push(jid.clone());
                continue;
            }
            let user = jid.to_non_ad();
            if queued.insert(user.to_string()) {
                to_lookup.push(user);
            }
        }

        let mut fetch_list: Vec<Jid> = Vec::new();
        for user in to_lookup {
            if use_cache {
                if let Some(cached) = self.cache.get(&user.to_string()) {
                    result.extend(cached);
                    continue;
                }
            }
            fetch_list.push(user);
        }

        if !fetch_list.is_empty() {
            log::debug!(
                "get_devices: fetching {} users from usync",
                fetch_list.len()
            );
            let fetched = self.fetch_devices(&fetch_list).await?;
            result.extend(fetched);
        }

        if ignore_zero_devices {
            result.retain(|jid| jid.device != 0);
        }

        let mut seen = HashSet::new();
        result.retain(|jid| seen.insert(jid.to_string()));
        Ok(result)
    }

    async fn fetch_devices(&self, users: &[Jid]) -> Result<Vec<Jid>> {
        let lid_requested: HashSet<String> = users
            .iter()
            .filter(|j| j.is_lid())
            .map(|j| j.user.clone())
            .collect();

        let sid = generate_message_id(None);
        let query = usync::build_get_user_devices_query(users, &sid);
        let response = self
            .transport
            .send_iq(InfoQuery::get(
                "usync",
                Jid::new("", SERVER_JID),
                vec![query],
            ))
            .await?;

        self.learn_mappings(&response).await;

        let mut result = Vec::new();
        for entry in usync::parse_get_user_devices_response(&response)? {
            let as_lid = entry.user.is_lid() || lid_requested.contains(&entry.user.user);
            let device_jids: Vec<Jid> = entry
                .devices
                .iter()
                .map(|&device| {
                    if as_lid {
                        Jid::lid_device(entry.user.user.clone(), device)
                    } else {
                        Jid::pn_device(entry.user.user.clone(), device)
                    }
                })
                .collect();

            self.cache.insert(entry.user.to_string(), device_jids.clone());
            self.persist_device_list(&entry.user.user, &entry.devices)
                .await;
            result.extend(device_jids);
        }
        Ok(result)
    }

    /// Store any mappings the response carried. Fresh LIDs invalidate the
    /// assumption that their sessions are current, so those are re-fetched
    /// with the identity reason.
    async fn learn_mappings(&self, response: &crate::binary::node::Node) {
        let mappings = usync::parse_lid_mappings_from_response(response);
        if mappings.is_empty() {
            return;
        }
        let pairs: Vec<(Jid, Jid)> = mappings
            .into_iter()
            .map(|m| (Jid::lid(m.lid), Jid::pn(m.phone_number)))
            .collect();

        match self.lid.store_mappings(&pairs).await {
            Ok(fresh) if !fresh.is_empty() => {
                let lids: Vec<Jid> = fresh.into_iter().map(|pair| pair.lid).collect();
                if let Err(e) = self.asserter.assert_sessions(&lids, true).await {
                    log::warn!("forced session refresh for new LIDs failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("storing usync mappings failed: {e}"),
        }
    }

    async fn persist_device_list(&self, user: &str, devices: &[u16]) {
        let record = DeviceListRecord {
            devices: devices.iter().map(|d| d.to_string()).collect(),
        };
        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("encoding device list for {user} failed: {e}");
                return;
            }
        };
        let mut writes: ColumnWrites = Default::default();
        writes
            .entry(columns::DEVICE_LIST.to_string())
            .or_default()
            .insert(user.to_string(), Some(bytes));
        if let Err(e) = self.store.set(writes).await {
            log::warn!("persisting device list for {user} failed: {e}");
        }
    }

    pub fn invalidate_user(&self, jid: &Jid) {
        self.cache.remove(&jid.to_non_ad().to_string());
    }
}
