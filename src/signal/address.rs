use std::fmt;

use crate::binary::jid::{DomainType, Jid};

/// Address a Signal session is indexed under: the encoded signal user plus
/// the device id. Rendered as `user.device`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    name: String,
    device: u16,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device: u16) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> u16 {
        self.device
    }

    /// Whether the signal user carries a domain suffix (anything but the
    /// default phone-number domain).
    pub fn is_domain_tagged(&self) -> bool {
        self.name.contains('_')
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device)
    }
}

/// Index of a sender-key record: one per `(group, sender address)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderKeyName {
    group_id: String,
    sender_id: String,
}

impl SenderKeyName {
    pub fn new(group_id: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            sender_id: sender_id.into(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Storage key in the sender-key column.
    pub fn storage_key(&self) -> String {
        format!("{}::{}", self.group_id, self.sender_id)
    }
}

pub trait JidSignalExt {
    /// The signal user: the bare user for the default domain, otherwise the
    /// user tagged with the numeric domain type.
    fn signal_user(&self) -> String;
    fn to_signal_address(&self) -> ProtocolAddress;
}

impl JidSignalExt for Jid {
    fn signal_user(&self) -> String {
        match self.domain_type() {
            Some(DomainType::Pn) | None => self.user.clone(),
            Some(domain) => format!("{}_{}", self.user, domain as u8),
        }
    }

    fn to_signal_address(&self) -> ProtocolAddress {
        ProtocolAddress::new(self.signal_user(), self.device)
    }
}
