//! Durable store contract
//!
//! The buffered stores read through these traits on a cache miss and write
//! into them on flush. One trait per key category, so a backend (or a test
//! fake) only has to provide what a category needs. All methods take `&self`;
//! backends serialize their own writes.

use crate::error::StoreError;
use async_trait::async_trait;
use libsignal_protocol::{
    IdentityKey, KyberPreKeyId, KyberPreKeyRecord, PreKeyId, PreKeyRecord, ProtocolAddress,
    SenderKeyRecord, SessionRecord, SignedPreKeyId, SignedPreKeyRecord,
};
use uuid::Uuid;

/// A kyber pre-key as the durable store keeps it: the record plus whether it
/// is the reusable last-resort key.
#[derive(Clone)]
pub struct StoredKyberPreKey {
    pub id: KyberPreKeyId,
    pub record: KyberPreKeyRecord,
    pub last_resort: bool,
}

#[async_trait(?Send)]
pub trait DurableIdentityStore {
    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, StoreError>;

    async fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<(), StoreError>;
}

#[async_trait(?Send)]
pub trait DurableSessionStore {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Batched lookup. The result has one slot per requested address, in
    /// request order, `None` where no session exists.
    async fn load_sessions(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<Vec<Option<SessionRecord>>, StoreError>;

    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError>;

    async fn delete_session(&self, address: &ProtocolAddress) -> Result<(), StoreError>;
}

#[async_trait(?Send)]
pub trait DurableSenderKeyStore {
    async fn load_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, StoreError>;

    async fn store_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError>;

    /// Forget, for every distribution id, that our sender key was shared with
    /// these addresses.
    async fn clear_sender_key_shared_with(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError>;
}

#[async_trait(?Send)]
pub trait DurablePreKeyStore {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<Option<PreKeyRecord>, StoreError>;

    async fn remove_pre_key(&self, id: PreKeyId) -> Result<(), StoreError>;
}

#[async_trait(?Send)]
pub trait DurableSignedPreKeyStore {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError>;

    async fn get_all_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError>;

    async fn remove_signed_pre_key(&self, id: SignedPreKeyId) -> Result<(), StoreError>;
}

#[async_trait(?Send)]
pub trait DurableKyberPreKeyStore {
    async fn get_kyber_pre_key(
        &self,
        id: KyberPreKeyId,
    ) -> Result<Option<StoredKyberPreKey>, StoreError>;

    async fn get_all_kyber_pre_keys(&self) -> Result<Vec<StoredKyberPreKey>, StoreError>;

    /// Deletes a one-time kyber pre-key; a last-resort key is kept and only
    /// stamped as used.
    async fn mark_kyber_pre_key_used(&self, id: KyberPreKeyId) -> Result<(), StoreError>;
}

/// Everything one local identity's durable key storage provides.
pub trait DurableProtocolStore:
    DurableIdentityStore
    + DurableSessionStore
    + DurableSenderKeyStore
    + DurablePreKeyStore
    + DurableSignedPreKeyStore
    + DurableKyberPreKeyStore
{
}

impl<T> DurableProtocolStore for T where
    T: DurableIdentityStore
        + DurableSessionStore
        + DurableSenderKeyStore
        + DurablePreKeyStore
        + DurableSignedPreKeyStore
        + DurableKyberPreKeyStore
{
}
