use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const SERVER_JID: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const HIDDEN_USER_SERVER: &str = "lid";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const HOSTED_SERVER: &str = "hosted";
pub const HOSTED_LID_SERVER: &str = "hosted.lid";
pub const STATUS_BROADCAST_USER: &str = "status";

/// Device id reserved for hosted (server-side) companions. JIDs carrying it
/// must live on a hosted server.
pub const HOSTED_DEVICE_ID: u16 = 99;

pub type MessageId = String;

#[derive(Debug, Clone, Error)]
pub enum JidError {
    #[error("invalid JID format: {0}")]
    InvalidFormat(String),
    #[error("invalid device component: {0}")]
    Device(#[from] std::num::ParseIntError),
    #[error("device {HOSTED_DEVICE_ID} requires a hosted server, got '{0}'")]
    UnhostedDevice99(String),
}

/// Identity domain a JID belongs to. The numeric value is the wire tag used
/// when deriving Signal protocol addresses for non-default domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainType {
    Pn = 0,
    Lid = 1,
    Hosted = 2,
    HostedLid = 3,
}

impl DomainType {
    pub fn of_server(server: &str) -> Option<Self> {
        match server {
            DEFAULT_USER_SERVER => Some(Self::Pn),
            HIDDEN_USER_SERVER => Some(Self::Lid),
            HOSTED_SERVER => Some(Self::Hosted),
            HOSTED_LID_SERVER => Some(Self::HostedLid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub device: u16,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            device: 0,
        }
    }

    /// Phone-number identity at user level.
    pub fn pn(user: impl Into<String>) -> Self {
        Self::new(user, DEFAULT_USER_SERVER)
    }

    /// LID identity at user level.
    pub fn lid(user: impl Into<String>) -> Self {
        Self::new(user, HIDDEN_USER_SERVER)
    }

    /// Device-qualified PN JID. The hosted device id lands on the hosted
    /// server, every other device stays on the default one.
    pub fn pn_device(user: impl Into<String>, device: u16) -> Self {
        let server = if device == HOSTED_DEVICE_ID {
            HOSTED_SERVER
        } else {
            DEFAULT_USER_SERVER
        };
        Self {
            user: user.into(),
            server: server.to_string(),
            device,
        }
    }

    /// Device-qualified LID JID, hosted-aware like [`Jid::pn_device`].
    pub fn lid_device(user: impl Into<String>, device: u16) -> Self {
        let server = if device == HOSTED_DEVICE_ID {
            HOSTED_LID_SERVER
        } else {
            HIDDEN_USER_SERVER
        };
        Self {
            user: user.into(),
            server: server.to_string(),
            device,
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(id, GROUP_SERVER)
    }

    pub fn status_broadcast() -> Self {
        Self::new(STATUS_BROADCAST_USER, BROADCAST_SERVER)
    }

    pub fn with_device(&self, device: u16) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            device,
        }
    }

    /// Strip the device component, keeping the user-level identity.
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            device: 0,
        }
    }

    pub fn domain_type(&self) -> Option<DomainType> {
        DomainType::of_server(&self.server)
    }

    pub fn is_pn(&self) -> bool {
        matches!(
            self.domain_type(),
            Some(DomainType::Pn) | Some(DomainType::Hosted)
        )
    }

    pub fn is_lid(&self) -> bool {
        matches!(
            self.domain_type(),
            Some(DomainType::Lid) | Some(DomainType::HostedLid)
        )
    }

    pub fn is_hosted(&self) -> bool {
        matches!(
            self.domain_type(),
            Some(DomainType::Hosted) | Some(DomainType::HostedLid)
        )
    }

    pub fn is_user(&self) -> bool {
        self.domain_type().is_some()
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == NEWSLETTER_SERVER
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER && self.user == STATUS_BROADCAST_USER
    }

    pub fn is_same_user_as(&self, other: &Jid) -> bool {
        !self.user.is_empty() && self.user == other.user
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = match s.split_once('@') {
            Some((u, srv)) => (u, srv),
            None => return Err(JidError::InvalidFormat(s.to_string())),
        };
        if server.is_empty() {
            return Err(JidError::InvalidFormat(s.to_string()));
        }

        // LID users may contain dots; only ':' separates the device.
        let (user, device) = match user_part.rsplit_once(':') {
            Some((u, d)) => (u, d.parse::<u16>()?),
            None => (user_part, 0),
        };

        let jid = Jid {
            user: user.to_string(),
            server: server.to_string(),
            device,
        };
        if device == HOSTED_DEVICE_ID && !jid.is_hosted() {
            return Err(JidError::UnhostedDevice99(server.to_string()));
        }
        Ok(jid)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "@{}", self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::from_str(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(input: &str, user: &str, server: &str, device: u16) {
        let jid = Jid::from_str(input).unwrap_or_else(|e| panic!("parse {input}: {e}"));
        assert_eq!(jid.user, user);
        assert_eq!(jid.server, server);
        assert_eq!(jid.device, device);
        assert_eq!(jid.to_string(), input);
    }

    #[test]
    fn parse_and_display_roundtrip() {
        roundtrip("15551234567@s.whatsapp.net", "15551234567", "s.whatsapp.net", 0);
        roundtrip("15551234567:15@s.whatsapp.net", "15551234567", "s.whatsapp.net", 15);
        roundtrip("123-456@g.us", "123-456", "g.us", 0);
        roundtrip("status@broadcast", "status", "broadcast", 0);
        // LID user parts may contain dots.
        roundtrip("12345.6789@lid", "12345.6789", "lid", 0);
        roundtrip("12345.6789:25@lid", "12345.6789", "lid", 25);
        roundtrip("15551234567:99@hosted", "15551234567", "hosted", 99);
        roundtrip("9999:99@hosted.lid", "9999", "hosted.lid", 99);
    }

    #[test]
    fn device_99_requires_hosted_server() {
        assert!(Jid::from_str("15551234567:99@s.whatsapp.net").is_err());
        assert!(Jid::from_str("9999:99@lid").is_err());
        assert!(Jid::from_str("15551234567:99@hosted").is_ok());
        assert!(Jid::from_str("9999:99@hosted.lid").is_ok());
    }

    #[test]
    fn device_constructors_pick_hosted_servers() {
        assert_eq!(Jid::pn_device("1555", 2).server, DEFAULT_USER_SERVER);
        assert_eq!(Jid::pn_device("1555", 99).server, HOSTED_SERVER);
        assert_eq!(Jid::lid_device("9999", 2).server, HIDDEN_USER_SERVER);
        assert_eq!(Jid::lid_device("9999", 99).server, HOSTED_LID_SERVER);
    }

    #[test]
    fn domain_classification() {
        assert!(Jid::pn("1555").is_pn());
        assert!(Jid::pn_device("1555", 99).is_pn());
        assert!(Jid::pn_device("1555", 99).is_hosted());
        assert!(Jid::lid("9999").is_lid());
        assert!(Jid::lid_device("9999", 99).is_lid());
        assert!(!Jid::group("123").is_user());
        assert!(Jid::status_broadcast().is_status_broadcast());
    }

    #[test]
    fn invalid_jids_fail_to_parse() {
        assert!(Jid::from_str("notajid").is_err());
        assert!(Jid::from_str("").is_err());
        assert!(Jid::from_str("user@").is_err());
    }
}
