//! Encryption orchestration: the capability surface of the Signal
//! primitive, the storage callbacks binding it to the key store, and the
//! transactional repository the rest of the relay talks to.

pub mod address;
pub mod binding;
pub mod engine;
pub mod mock;
pub mod repository;

pub use address::{JidSignalExt, ProtocolAddress, SenderKeyName};
pub use binding::{SignalCreds, SignalStorage};
pub use engine::{EncryptedPayload, PreKeyBundle, SignalEngine};
pub use repository::{
    EncryptedMessage, GroupEncryptedMessage, MigrationSummary, SessionValidation, SignalRepository,
};
