//! Building `encrypt get` key requests and decoding the prekey bundles the
//! server answers with.

use std::collections::HashMap;

use crate::binary::builder::NodeBuilder;
use crate::binary::jid::Jid;
use crate::binary::node::Node;
use crate::error::{RelayError, Result};
use crate::signal::engine::PreKeyBundle;

pub struct PreKeyUtils;

impl PreKeyUtils {
    /// `<key><user jid=… [reason=…]/>…</key>` request body.
    pub fn build_fetch_prekeys_request(jids: &[Jid], reason: Option<&str>) -> Node {
        let user_nodes = jids.iter().map(|jid| {
            let mut user = NodeBuilder::new("user").attr("jid", jid.to_string());
            if let Some(r) = reason {
                user = user.attr("reason", r);
            }
            user.build()
        });
        NodeBuilder::new("key").children(user_nodes).build()
    }

    /// Decode the `<list>` of per-user bundles. Users whose bundle fails to
    /// decode are dropped; the caller decides whether that is fatal.
    pub fn parse_prekeys_response(resp_node: &Node) -> Result<HashMap<Jid, PreKeyBundle>> {
        let list_node = resp_node.get_optional_child("list").ok_or_else(|| {
            RelayError::MalformedResponse("<list> not found in pre-key response".into())
        })?;

        let mut bundles = HashMap::new();
        for user_node in list_node.get_children_by_tag("user") {
            let mut attrs = user_node.attrs();
            let jid = attrs.jid("jid");
            if attrs.finish().is_err() {
                continue;
            }
            match Self::node_to_pre_key_bundle(&jid, user_node) {
                Ok(bundle) => {
                    bundles.insert(jid, bundle);
                }
                Err(e) => {
                    log::warn!("dropping undecodable prekey bundle for {jid}: {e}");
                }
            }
        }
        Ok(bundles)
    }

    fn node_to_pre_key_bundle(jid: &Jid, node: &Node) -> Result<PreKeyBundle> {
        if let Some(error_node) = node.get_optional_child("error") {
            return Err(RelayError::MalformedResponse(format!(
                "error fetching prekeys: {:?}",
                error_node.attrs
            )));
        }

        let reg_id_bytes = Self::extract_bytes(node.get_optional_child("registration"))?;
        if reg_id_bytes.len() != 4 {
            return Err(RelayError::MalformedResponse(
                "invalid registration id length".into(),
            ));
        }
        let registration_id =
            u32::from_be_bytes([reg_id_bytes[0], reg_id_bytes[1], reg_id_bytes[2], reg_id_bytes[3]]);

        let keys_node = node.get_optional_child("keys").unwrap_or(node);

        let identity_key = Self::extract_bytes(keys_node.get_optional_child("identity"))?;
        if identity_key.len() != 32 {
            return Err(RelayError::MalformedResponse(format!(
                "invalid identity key length {}",
                identity_key.len()
            )));
        }

        let pre_key = match keys_node.get_optional_child("key") {
            Some(pre_key_node) => Self::node_to_pre_key(pre_key_node)?,
            None => None,
        };

        let signed_node = keys_node
            .get_optional_child("skey")
            .ok_or_else(|| RelayError::MalformedResponse("missing signed prekey".into()))?;
        let (signed_pre_key_id, signed_pre_key_public) = Self::node_to_pre_key(signed_node)?
            .ok_or_else(|| RelayError::MalformedResponse("signed prekey missing id or value".into()))?;
        let signed_pre_key_signature =
            Self::extract_bytes(signed_node.get_optional_child("signature"))?;
        if signed_pre_key_signature.len() != 64 {
            return Err(RelayError::MalformedResponse("invalid signature length".into()));
        }

        Ok(PreKeyBundle {
            registration_id,
            device_id: jid.device as u32,
            identity_key,
            signed_pre_key_id,
            signed_pre_key_public,
            signed_pre_key_signature,
            pre_key,
        })
    }

    fn node_to_pre_key(node: &Node) -> Result<Option<(u32, Vec<u8>)>> {
        let id_bytes = match node.get_optional_child("id").and_then(|n| n.bytes()) {
            Some(b) if !b.is_empty() => b,
            _ => return Ok(None),
        };
        // Ids arrive either as a 3-byte big-endian integer or as hex text.
        let id = if id_bytes.len() == 3 {
            u32::from_be_bytes([0, id_bytes[0], id_bytes[1], id_bytes[2]])
        } else {
            match std::str::from_utf8(id_bytes)
                .ok()
                .and_then(|s| u32::from_str_radix(s.trim(), 16).ok())
            {
                Some(id) => id,
                None => return Ok(None),
            }
        };

        let value = Self::extract_bytes(node.get_optional_child("value"))?;
        if value.len() != 32 {
            return Err(RelayError::MalformedResponse("invalid prekey value length".into()));
        }
        Ok(Some((id, value)))
    }

    fn extract_bytes(node: Option<&Node>) -> Result<Vec<u8>> {
        node.and_then(|n| n.bytes())
            .map(|b| b.to_vec())
            .ok_or_else(|| RelayError::MalformedResponse("expected bytes in node content".into()))
    }
}
