//! Message-relay core for a WhatsApp-compatible client.
//!
//! Everything between "send this content to this recipient" and the
//! encrypted binary stanza on the wire lives here: the PN/LID dual-identity
//! bookkeeping, device discovery and session assertion, pairwise and
//! sender-key encryption orchestration, and the stanza assembly for direct,
//! group, status, retry, newsletter and peer sends.
//!
//! The pieces below the relay are capability traits the host supplies: the
//! socket ([`transport::Transport`]), persistence ([`store::KeyStoreBackend`])
//! and the Signal primitive itself ([`signal::SignalEngine`]).

pub mod binary;
pub mod cache;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod fanout;
pub mod lid;
pub mod mediaconn;
pub mod messages;
pub mod prekeys;
pub mod proto;
pub mod registry;
pub mod relay;
pub mod session;
pub mod signal;
pub mod store;
pub mod transport;
pub mod usync;

pub use binary::jid::Jid;
pub use binary::{Node, NodeBuilder};
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use fanout::SenderIdentity;
pub use relay::{MessageOptions, Relay, RetryParticipant};
pub use store::{KeyStore, MemoryStore};
