//! Capability traits for the buffered stores
//!
//! libsignal's `SessionStore`, `SenderKeyStore`, `PreKeyStore`,
//! `SignedPreKeyStore` and `KyberPreKeyStore` cover what the ratchet itself
//! needs. These traits add the rest of what a client's key storage exposes,
//! one trait per key category. Several of the operations are unsupported in
//! buffered mode and fail with `StoreError::UnsupportedInBufferedMode`.

use crate::error::StoreError;
use async_trait::async_trait;
use libsignal_protocol::{
    DeviceId, KyberPreKeyId, KyberPreKeyRecord, PreKeyId, ProtocolAddress, SessionRecord,
    SignedPreKeyId, SignedPreKeyRecord,
};
use uuid::Uuid;

/// Extended operations for session storage beyond libsignal's SessionStore
#[async_trait(?Send)]
pub trait ExtendedSessionStore {
    /// All-or-nothing batch lookup: fails with `StoreError::NoSession` if any
    /// address has no session.
    async fn load_existing_sessions(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<Vec<SessionRecord>, StoreError>;

    async fn contains_session(&self, address: &ProtocolAddress) -> Result<bool, StoreError>;

    async fn delete_session(&mut self, address: &ProtocolAddress) -> Result<(), StoreError>;

    async fn archive_session(&mut self, address: &ProtocolAddress) -> Result<(), StoreError>;

    async fn delete_all_sessions(&mut self, name: &str) -> Result<(), StoreError>;

    async fn get_sub_device_sessions(&self, name: &str) -> Result<Vec<DeviceId>, StoreError>;

    async fn get_all_addresses_with_active_sessions(
        &self,
        names: &[String],
    ) -> Result<Vec<ProtocolAddress>, StoreError>;
}

/// Extended operations for sender key storage beyond libsignal's SenderKeyStore
#[async_trait(?Send)]
pub trait ExtendedSenderKeyStore {
    async fn get_sender_key_shared_with(
        &self,
        distribution_id: Uuid,
    ) -> Result<Vec<ProtocolAddress>, StoreError>;

    async fn mark_sender_key_shared_with(
        &mut self,
        distribution_id: Uuid,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError>;

    async fn clear_sender_key_shared_with(
        &mut self,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError>;
}

/// Extended operations for one-time pre-key storage beyond libsignal's PreKeyStore
#[async_trait(?Send)]
pub trait ExtendedPreKeyStore {
    async fn contains_pre_key(&self, id: PreKeyId) -> Result<bool, StoreError>;
}

/// Extended operations for signed pre-key storage beyond libsignal's SignedPreKeyStore
#[async_trait(?Send)]
pub trait ExtendedSignedPreKeyStore {
    async fn load_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError>;

    async fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> Result<bool, StoreError>;

    async fn remove_signed_pre_key(&mut self, id: SignedPreKeyId) -> Result<(), StoreError>;
}

/// Extended operations for Kyber post-quantum pre-key storage beyond libsignal's KyberPreKeyStore
#[async_trait(?Send)]
pub trait ExtendedKyberPreKeyStore {
    async fn load_kyber_pre_keys(&self) -> Result<Vec<KyberPreKeyRecord>, StoreError>;

    async fn load_last_resort_kyber_pre_keys(&self) -> Result<Vec<KyberPreKeyRecord>, StoreError>;

    async fn store_last_resort_kyber_pre_key(
        &mut self,
        id: KyberPreKeyId,
        record: &KyberPreKeyRecord,
    ) -> Result<(), StoreError>;

    async fn contains_kyber_pre_key(&self, id: KyberPreKeyId) -> Result<bool, StoreError>;

    async fn remove_kyber_pre_key(&mut self, id: KyberPreKeyId) -> Result<(), StoreError>;
}
