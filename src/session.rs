//! Session assertion: make sure a Signal session exists for every
//! destination before fan-out encryption starts, fetching prekey bundles
//! through an `encrypt get` IQ where one is missing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::binary::jid::{Jid, SERVER_JID};
use crate::cache::TtlCache;
use crate::error::Result;
use crate::lid::LidMappingStore;
use crate::prekeys::PreKeyUtils;
use crate::signal::address::JidSignalExt;
use crate::signal::repository::SignalRepository;
use crate::transport::{InfoQuery, Transport};

/// Default time-to-live for the session-exists cache.
pub const PEER_SESSION_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub struct SessionAsserter {
    transport: Arc<dyn Transport>,
    repository: Arc<SignalRepository>,
    lid: Arc<LidMappingStore>,
    peer_sessions: TtlCache<String, bool>,
}

impl SessionAsserter {
    pub fn new(
        transport: Arc<dyn Transport>,
        repository: Arc<SignalRepository>,
        lid: Arc<LidMappingStore>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            transport,
            repository,
            lid,
            peer_sessions: TtlCache::new(cache_ttl),
        }
    }

    /// Guarantee a session for every target, fetching bundles for the ones
    /// that lack one (or for all of them when `force` is set). Returns
    /// whether a fetch round-trip happened.
    pub async fn assert_sessions(&self, jids: &[Jid], force: bool) -> Result<bool> {
        let mut seen = HashSet::new();
        let targets: Vec<Jid> = jids
            .iter()
            .filter(|j| seen.insert(j.to_string()))
            .cloned()
            .collect();

        let mut need_fetch = Vec::new();
        for jid in &targets {
            if force {
                need_fetch.push(jid.clone());
                continue;
            }
            let address = jid.to_signal_address().to_string();
            let exists = match self.peer_sessions.get(&address) {
                Some(cached) => cached,
                None => {
                    let exists = self.repository.validate_session(jid).await?.exists;
                    self.peer_sessions.insert(address, exists);
                    exists
                }
            };
            if !exists {
                need_fetch.push(jid.clone());
            }
        }
        if need_fetch.is_empty() {
            return Ok(false);
        }

        // Fetch under the LID identity wherever the mapping is already
        // known; unmapped targets keep their original address. Discovery
        // queries carry the LID protocol, so a missing mapping here means
        // the server had none to offer moments ago.
        let mut wire_jids = Vec::with_capacity(need_fetch.len());
        for jid in &need_fetch {
            let wire = match jid.is_pn() {
                true => self.lid.lid_for_pn(jid).await.unwrap_or_else(|| jid.clone()),
                false => jid.clone(),
            };
            wire_jids.push(wire);
        }

        log::debug!(
            "fetching sessions for {} targets (force={force})",
            wire_jids.len()
        );
        let reason = force.then_some("identity");
        let key_node = PreKeyUtils::build_fetch_prekeys_request(&wire_jids, reason);
        let response = self
            .transport
            .send_iq(InfoQuery::get(
                "encrypt",
                Jid::new("", SERVER_JID),
                vec![key_node],
            ))
            .await?;

        let bundles = PreKeyUtils::parse_prekeys_response(&response)?;
        for (jid, bundle) in &bundles {
            if let Err(e) = self.repository.inject_e2e_session(jid, bundle).await {
                log::warn!("failed to establish session with {jid}: {e}");
            }
        }

        for jid in &wire_jids {
            self.peer_sessions
                .insert(jid.to_signal_address().to_string(), true);
        }
        Ok(true)
    }

    /// Drop the cached session-exists flag for a target.
    pub fn invalidate(&self, jid: &Jid) {
        self.peer_sessions
            .remove(&jid.to_signal_address().to_string());
    }
}
