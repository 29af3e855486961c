//! Media connection bookkeeping: a server-issued auth token plus host list
//! with a server-supplied TTL, refreshed eagerly when stale or forced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::binary::builder::NodeBuilder;
use crate::binary::jid::{Jid, SERVER_JID};
use crate::binary::node::Node;
use crate::error::{RelayError, Result};
use crate::transport::{InfoQuery, Transport};

#[derive(Debug, Clone)]
pub struct MediaConnHost {
    pub hostname: String,
}

#[derive(Debug, Clone)]
pub struct MediaConn {
    pub auth: String,
    /// Server-supplied time-to-live, in seconds.
    pub ttl: u64,
    pub hosts: Vec<MediaConnHost>,
    pub fetched_at: Instant,
}

impl MediaConn {
    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() > Duration::from_secs(self.ttl)
    }
}

pub struct MediaConnManager {
    transport: Arc<dyn Transport>,
    conn: RwLock<Option<MediaConn>>,
}

impl MediaConnManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            conn: RwLock::new(None),
        }
    }

    pub async fn refresh(&self, force: bool) -> Result<MediaConn> {
        {
            let guard = self.conn.read().await;
            if !force {
                if let Some(conn) = &*guard {
                    if !conn.is_expired() {
                        return Ok(conn.clone());
                    }
                }
            }
        }

        let response = self
            .transport
            .send_iq(InfoQuery::get(
                "w:m",
                Jid::new("", SERVER_JID),
                vec![NodeBuilder::new("media_conn").build()],
            ))
            .await?;
        let new_conn = Self::parse_response(&response)?;

        let mut guard = self.conn.write().await;
        *guard = Some(new_conn.clone());
        Ok(new_conn)
    }

    fn parse_response(response: &Node) -> Result<MediaConn> {
        let conn_node = response.get_optional_child("media_conn").ok_or_else(|| {
            RelayError::MalformedResponse("<media_conn> missing from response".into())
        })?;
        let mut attrs = conn_node.attrs();
        let auth = attrs.string("auth");
        let ttl = attrs.optional_u64("ttl").unwrap_or(0);
        attrs
            .finish()
            .map_err(RelayError::MalformedResponse)?;

        let hosts = conn_node
            .get_children_by_tag("host")
            .into_iter()
            .filter_map(|host| {
                host.attrs()
                    .optional_string("hostname")
                    .map(|hostname| MediaConnHost {
                        hostname: hostname.to_string(),
                    })
            })
            .collect();

        Ok(MediaConn {
            auth,
            ttl,
            hosts,
            fetched_at: Instant::now(),
        })
    }
}

/// Outcome of a media reupload/update notification. Failures carry the
/// server status code.
pub fn parse_media_retry_result(node: &Node) -> Result<String> {
    if let Some(error_node) = node.get_optional_child("error") {
        let code = error_node
            .attrs()
            .optional_u64("code")
            .unwrap_or(0) as u16;
        return Err(RelayError::MediaRetryFailure(code));
    }
    node.attrs()
        .optional_string("direct_path")
        .map(|p| p.to_string())
        .ok_or_else(|| {
            RelayError::MalformedResponse("media retry result without direct_path".into())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn media_conn_response(auth: &str, ttl: &str) -> Node {
        NodeBuilder::new("iq")
            .children([NodeBuilder::new("media_conn")
                .attr("auth", auth)
                .attr("ttl", ttl)
                .children([
                    NodeBuilder::new("host").attr("hostname", "media-a.example").build(),
                    NodeBuilder::new("host").attr("hostname", "media-b.example").build(),
                ])
                .build()])
            .build()
    }

    #[tokio::test]
    async fn fetches_and_caches_until_ttl() {
        let transport = Arc::new(MockTransport::new());
        let manager = MediaConnManager::new(transport.clone());

        transport.expect_iq(|iq| {
            assert_eq!(iq.attrs.get("xmlns").map(String::as_str), Some("w:m"));
            Ok(media_conn_response("token-1", "300"))
        });

        let conn = manager.refresh(false).await.unwrap();
        assert_eq!(conn.auth, "token-1");
        assert_eq!(conn.hosts.len(), 2);

        // Served from the cached entry, no second IQ handler queued.
        let cached = manager.refresh(false).await.unwrap();
        assert_eq!(cached.auth, "token-1");
        assert_eq!(transport.iq_log().len(), 1);
    }

    #[tokio::test]
    async fn force_refreshes_past_the_cache() {
        let transport = Arc::new(MockTransport::new());
        let manager = MediaConnManager::new(transport.clone());

        transport.expect_iq(|_| Ok(media_conn_response("token-1", "300")));
        transport.expect_iq(|_| Ok(media_conn_response("token-2", "300")));

        manager.refresh(false).await.unwrap();
        let forced = manager.refresh(true).await.unwrap();
        assert_eq!(forced.auth, "token-2");
    }

    #[tokio::test]
    async fn zero_ttl_counts_as_expired() {
        let transport = Arc::new(MockTransport::new());
        let manager = MediaConnManager::new(transport.clone());

        transport.expect_iq(|_| Ok(media_conn_response("token-1", "0")));
        transport.expect_iq(|_| Ok(media_conn_response("token-2", "300")));

        manager.refresh(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = manager.refresh(false).await.unwrap();
        assert_eq!(second.auth, "token-2");
    }

    #[test]
    fn media_retry_error_carries_status_code() {
        let node = NodeBuilder::new("media_retry")
            .children([NodeBuilder::new("error").attr("code", "403").build()])
            .build();
        match parse_media_retry_result(&node) {
            Err(RelayError::MediaRetryFailure(code)) => assert_eq!(code, 403),
            other => panic!("unexpected: {other:?}"),
        }

        let ok = NodeBuilder::new("media_retry")
            .attr("direct_path", "/v/t62.7119-24/x")
            .build();
        assert_eq!(parse_media_retry_result(&ok).unwrap(), "/v/t62.7119-24/x");
    }
}
