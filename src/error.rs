use thiserror::Error;

use crate::binary::jid::JidError;
use crate::store::StoreError;
use crate::transport::IqError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("sender key distribution without a group id")]
    MissingGroupId,

    #[error("not authenticated: no own identity available")]
    AuthenticationMissing,

    #[error("mapping mismatch: '{pn}' / '{lid}' is not a PN/LID pair")]
    MappingMismatch { pn: String, lid: String },

    #[error("media retry failed with server status {0}")]
    MediaRetryFailure(u16),

    #[error("signal protocol failure: {0}")]
    Signal(String),

    #[error("malformed server payload: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Jid(#[from] JidError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] IqError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
