use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::binary::jid::Jid;
use crate::fanout::MessagePatcher;
use crate::relay::GroupMetadata;

/// Host-side cache of group metadata. When present and allowed by the send
/// options, it short-circuits the `w:g2` fetch.
#[async_trait]
pub trait GroupMetadataProvider: Send + Sync {
    async fn cached_group_metadata(&self, jid: &Jid) -> Option<GroupMetadata>;
}

/// Tunables of the relay. Field defaults mirror platform behavior; hosts
/// override what they need.
#[derive(Clone)]
pub struct RelayConfig {
    /// Keep recently sent messages around for retry-receipt re-encryption.
    pub enable_recent_message_cache: bool,
    /// Upper bound on per-message retry re-encryptions.
    pub max_msg_retry_count: u32,
    /// Emit sent messages back onto the local upsert stream.
    pub emit_own_events: bool,
    pub link_preview_image_thumbnail_width: u32,
    pub generate_high_quality_link_preview: bool,
    pub user_devices_cache_ttl: Duration,
    pub mapping_cache_ttl: Duration,
    pub migrated_session_cache_ttl: Duration,
    pub peer_session_cache_ttl: Duration,
    pub cached_group_metadata: Option<Arc<dyn GroupMetadataProvider>>,
    pub patch_message_before_sending: Option<MessagePatcher>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enable_recent_message_cache: true,
            max_msg_retry_count: 5,
            emit_own_events: true,
            link_preview_image_thumbnail_width: 192,
            generate_high_quality_link_preview: false,
            user_devices_cache_ttl: crate::devices::USER_DEVICES_CACHE_TTL,
            mapping_cache_ttl: crate::lid::MAPPING_CACHE_TTL,
            migrated_session_cache_ttl: crate::signal::repository::MIGRATED_SESSION_CACHE_TTL,
            peer_session_cache_ttl: crate::session::PEER_SESSION_CACHE_TTL,
            cached_group_metadata: None,
            patch_message_before_sending: None,
        }
    }
}
