//! USync wire codec: the device-discovery query (device protocol plus LID
//! protocol) and its response parsers, and the standalone mapping resolver
//! built on the same machinery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::binary::builder::NodeBuilder;
use crate::binary::jid::{Jid, SERVER_JID};
use crate::binary::node::Node;
use crate::error::{RelayError, Result};
use crate::lid::{LidPnPair, PnLidResolver};
use crate::transport::{InfoQuery, Transport};

/// Devices of one user as reported by the server.
#[derive(Debug, Clone)]
pub struct UserDeviceList {
    /// User-level JID the entry belongs to.
    pub user: Jid,
    pub devices: Vec<u16>,
    /// Participant hash over the device list, when the server sends one.
    pub phash: Option<String>,
}

/// A LID mapping learned from a usync response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsyncLidMapping {
    pub phone_number: String,
    pub lid: String,
}

/// Device enumeration query: context `message`, device list protocol
/// (version 2) and the LID identity protocol.
pub fn build_get_user_devices_query(jids: &[Jid], sid: &str) -> Node {
    let user_nodes = jids
        .iter()
        .map(|jid| {
            NodeBuilder::new("user")
                .attr("jid", jid.to_non_ad().to_string())
                .build()
        })
        .collect::<Vec<_>>();

    let query_node = NodeBuilder::new("query")
        .children([
            NodeBuilder::new("devices").attr("version", "2").build(),
            NodeBuilder::new("lid").build(),
        ])
        .build();

    let list_node = NodeBuilder::new("list").children(user_nodes).build();

    NodeBuilder::new("usync")
        .attrs([
            ("context", "message"),
            ("index", "0"),
            ("last", "true"),
            ("mode", "query"),
            ("sid", sid),
        ])
        .children([query_node, list_node])
        .build()
}

/// Identity-only query used for mapping backfill.
pub fn build_lid_resolver_query(jids: &[Jid], sid: &str) -> Node {
    let user_nodes = jids
        .iter()
        .map(|jid| {
            NodeBuilder::new("user")
                .attr("jid", jid.to_non_ad().to_string())
                .build()
        })
        .collect::<Vec<_>>();

    let query_node = NodeBuilder::new("query")
        .children([NodeBuilder::new("lid").build()])
        .build();
    let list_node = NodeBuilder::new("list").children(user_nodes).build();

    NodeBuilder::new("usync")
        .attrs([
            ("context", "interactive"),
            ("index", "0"),
            ("last", "true"),
            ("mode", "query"),
            ("sid", sid),
        ])
        .children([query_node, list_node])
        .build()
}

/// Parse a usync response into per-user device lists. Malformed device
/// entries are logged and skipped rather than failing the whole response.
pub fn parse_get_user_devices_response(resp_node: &Node) -> Result<Vec<UserDeviceList>> {
    let list_node = resp_node
        .get_optional_child_by_tag(&["usync", "list"])
        .ok_or_else(|| {
            RelayError::MalformedResponse("<usync> or <list> not found in usync response".into())
        })?;

    let mut result = Vec::new();
    for user_node in list_node.get_children_by_tag("user") {
        let mut attrs = user_node.attrs();
        let user_jid = attrs.jid("jid");
        if attrs.finish().is_err() {
            log::warn!(target: "usync", "user node without a valid jid, skipping");
            continue;
        }

        let Some(device_list_node) =
            user_node.get_optional_child_by_tag(&["devices", "device-list"])
        else {
            log::warn!(target: "usync", "<device-list> not found for user {user_jid}, skipping");
            continue;
        };

        let phash = device_list_node
            .attrs()
            .optional_string("hash")
            .map(|s| s.to_string());

        let mut devices = Vec::new();
        for device_node in device_list_node.get_children_by_tag("device") {
            let Some(id_str) = device_node.attrs().optional_string("id") else {
                log::warn!(target: "usync", "device node missing 'id' attribute, skipping");
                continue;
            };
            match id_str.parse::<u16>() {
                Ok(id) => devices.push(id),
                Err(_) => {
                    log::warn!(target: "usync", "invalid device id '{id_str}' for user {user_jid}, skipping");
                }
            }
        }

        result.push(UserDeviceList {
            user: user_jid.to_non_ad(),
            devices,
            phash,
        });
    }
    Ok(result)
}

/// Extract `<lid val=…/>` mappings from a usync response. Only entries where
/// the user is a phone JID and the value parses as a LID are kept.
pub fn parse_lid_mappings_from_response(resp_node: &Node) -> Vec<UsyncLidMapping> {
    let mut mappings = Vec::new();
    let Some(list_node) = resp_node.get_optional_child_by_tag(&["usync", "list"]) else {
        return mappings;
    };

    for user_node in list_node.get_children_by_tag("user") {
        let Some(user_jid) = user_node
            .attrs()
            .optional_string("jid")
            .and_then(|s| s.parse::<Jid>().ok())
        else {
            continue;
        };
        if !user_jid.is_pn() {
            continue;
        }
        let Some(lid_node) = user_node.get_optional_child("lid") else {
            continue;
        };
        let Some(lid_val) = lid_node.attrs().optional_string("val") else {
            continue;
        };
        if let Ok(lid_jid) = lid_val.parse::<Jid>() {
            if lid_jid.is_lid() {
                mappings.push(UsyncLidMapping {
                    phone_number: user_jid.user.clone(),
                    lid: lid_jid.user.clone(),
                });
            }
        }
    }
    mappings
}

/// [`PnLidResolver`] asking the server through a usync IQ.
pub struct UsyncPnLidResolver {
    transport: Arc<dyn Transport>,
}

impl UsyncPnLidResolver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl PnLidResolver for UsyncPnLidResolver {
    async fn resolve(&self, pns: &[Jid]) -> Result<Vec<LidPnPair>> {
        if pns.is_empty() {
            return Ok(Vec::new());
        }
        let sid = crate::transport::generate_message_id(None);
        let query = build_lid_resolver_query(pns, &sid);
        let response = self
            .transport
            .send_iq(InfoQuery::get(
                "usync",
                Jid::new("", SERVER_JID),
                vec![query],
            ))
            .await?;

        Ok(parse_lid_mappings_from_response(&response)
            .into_iter()
            .map(|m| LidPnPair {
                pn: Jid::pn(m.phone_number),
                lid: Jid::lid(m.lid),
            })
            .collect())
    }
}
