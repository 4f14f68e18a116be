//! Error types for the buffered protocol store
//!
//! Callers need to tell apart three kinds of failure: misuse of the buffer
//! (an operation it does not support), data that is required but absent
//! (an unknown key id or a missing session), and failures of the durable
//! store underneath.

use libsignal_protocol::{ProtocolAddress, SignalProtocolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The operation needs knowledge of the whole durable store, or belongs to
    /// the sending/registration path. Reaching it is a programming error.
    #[error("{operation} is not supported by a buffered store")]
    UnsupportedInBufferedMode { operation: &'static str },

    #[error("Missing one-time pre-key with id {0}")]
    InvalidPreKeyId(u32),

    #[error("Missing signed pre-key with id {0}")]
    InvalidSignedPreKeyId(u32),

    #[error("Missing kyber pre-key with id {0}")]
    InvalidKyberPreKeyId(u32),

    #[error("No session for {0}")]
    NoSession(ProtocolAddress),

    #[error("No store for local identity {0}")]
    UnknownIdentity(String),

    #[error("Failed to flush store for {service_id}: {source}")]
    Flush {
        service_id: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Signal Protocol error: {0}")]
    Protocol(#[from] SignalProtocolError),
}

impl StoreError {
    pub(crate) fn unsupported(operation: &'static str) -> Self {
        tracing::warn!(operation, "unsupported operation on buffered store");
        StoreError::UnsupportedInBufferedMode { operation }
    }

    /// True for the "required key or session is absent" kinds.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidPreKeyId(_)
                | StoreError::InvalidSignedPreKeyId(_)
                | StoreError::InvalidKyberPreKeyId(_)
                | StoreError::NoSession(_)
        )
    }
}

impl From<StoreError> for SignalProtocolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPreKeyId(_) => SignalProtocolError::InvalidPreKeyId,
            StoreError::InvalidSignedPreKeyId(_) => SignalProtocolError::InvalidSignedPreKeyId,
            StoreError::InvalidKyberPreKeyId(_) => SignalProtocolError::InvalidKyberPreKeyId,
            StoreError::NoSession(address) => SignalProtocolError::SessionNotFound(address),
            StoreError::Protocol(inner) => inner,
            other => SignalProtocolError::InvalidState("buffered_store", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsignal_protocol::DeviceId;

    #[test]
    fn test_not_found_kinds() -> Result<(), Box<dyn std::error::Error>> {
        let address = ProtocolAddress::new("bob".to_string(), DeviceId::new(1)?);

        assert!(StoreError::InvalidPreKeyId(1).is_not_found());
        assert!(StoreError::InvalidKyberPreKeyId(1).is_not_found());
        assert!(StoreError::NoSession(address).is_not_found());
        assert!(!StoreError::unsupported("save_pre_key").is_not_found());
        assert!(!StoreError::Storage("disk full".to_string()).is_not_found());

        Ok(())
    }

    #[test]
    fn test_conversion_to_protocol_error() -> Result<(), Box<dyn std::error::Error>> {
        assert!(matches!(
            SignalProtocolError::from(StoreError::InvalidPreKeyId(7)),
            SignalProtocolError::InvalidPreKeyId
        ));
        assert!(matches!(
            SignalProtocolError::from(StoreError::InvalidSignedPreKeyId(7)),
            SignalProtocolError::InvalidSignedPreKeyId
        ));
        assert!(matches!(
            SignalProtocolError::from(StoreError::InvalidKyberPreKeyId(7)),
            SignalProtocolError::InvalidKyberPreKeyId
        ));

        let address = ProtocolAddress::new("bob".to_string(), DeviceId::new(1)?);
        assert!(matches!(
            SignalProtocolError::from(StoreError::NoSession(address)),
            SignalProtocolError::SessionNotFound(_)
        ));

        match SignalProtocolError::from(StoreError::unsupported("archive_session")) {
            SignalProtocolError::InvalidState(origin, message) => {
                assert_eq!(origin, "buffered_store");
                assert!(message.contains("archive_session"));
            }
            other => panic!("unexpected error: {other}"),
        }

        Ok(())
    }
}
