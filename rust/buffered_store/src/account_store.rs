//! Per-identity façade over the buffered stores
//!
//! `AccountDataStore` owns one buffered store per key category and exposes
//! the full store surface by delegation. It is what the decryption pipeline
//! hands to libsignal for every envelope of a batch.

use crate::durable_trait::DurableProtocolStore;
use crate::error::StoreError;
use crate::identity_store::BufferedIdentityStore;
use crate::kyber_pre_key_store::BufferedKyberPreKeyStore;
use crate::pre_key_store::BufferedPreKeyStore;
use crate::sender_key_store::BufferedSenderKeyStore;
use crate::session_store::BufferedSessionStore;
use crate::signed_pre_key_store::BufferedSignedPreKeyStore;
use crate::storage_trait::*;
use async_trait::async_trait;
use libsignal_protocol::{
    group_decrypt, message_decrypt, process_sender_key_distribution_message, CiphertextMessage,
    DeviceId, Direction, IdentityChange, IdentityKey, IdentityKeyPair, IdentityKeyStore,
    KyberPreKeyId, KyberPreKeyRecord, KyberPreKeyStore, PreKeyId, PreKeyRecord, PreKeyStore,
    ProtocolAddress, SenderKeyDistributionMessage, SenderKeyRecord, SenderKeyStore,
    SessionRecord, SessionStore, SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord,
    SignedPreKeyStore, UsePQRatchet,
};
use std::sync::Arc;
use uuid::Uuid;

/// A local protocol identity: the service id it is addressed by, its
/// long-term key pair and its registration id.
#[derive(Clone)]
pub struct LocalAccount {
    pub service_id: String,
    pub identity_key_pair: IdentityKeyPair,
    pub registration_id: u32,
}

impl LocalAccount {
    pub fn new(
        service_id: impl Into<String>,
        identity_key_pair: IdentityKeyPair,
        registration_id: u32,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            identity_key_pair,
            registration_id,
        }
    }
}

pub struct AccountDataStore<D> {
    service_id: String,
    identity_store: BufferedIdentityStore<D>,
    session_store: BufferedSessionStore<D>,
    sender_key_store: BufferedSenderKeyStore<D>,
    pre_key_store: BufferedPreKeyStore<D>,
    signed_pre_key_store: BufferedSignedPreKeyStore<D>,
    kyber_pre_key_store: BufferedKyberPreKeyStore<D>,
}

impl<D: DurableProtocolStore> AccountDataStore<D> {
    pub fn new(account: &LocalAccount, durable: Arc<D>) -> Self {
        Self {
            service_id: account.service_id.clone(),
            identity_store: BufferedIdentityStore::new(account, Arc::clone(&durable)),
            session_store: BufferedSessionStore::new(Arc::clone(&durable)),
            sender_key_store: BufferedSenderKeyStore::new(Arc::clone(&durable)),
            pre_key_store: BufferedPreKeyStore::new(Arc::clone(&durable)),
            signed_pre_key_store: BufferedSignedPreKeyStore::new(Arc::clone(&durable)),
            kyber_pre_key_store: BufferedKyberPreKeyStore::new(durable),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Answering needs every session of the account.
    pub fn is_multi_device(&self) -> Result<bool, StoreError> {
        Err(StoreError::unsupported("is_multi_device"))
    }

    /// Decrypts one 1:1 envelope against the buffered stores.
    pub async fn decrypt_message(
        &mut self,
        remote_address: &ProtocolAddress,
        ciphertext: &CiphertextMessage,
    ) -> Result<Vec<u8>, SignalProtocolError> {
        let mut rng = rand::rng();

        message_decrypt(
            ciphertext,
            remote_address,
            &mut self.session_store,
            &mut self.identity_store,
            &mut self.pre_key_store,
            &mut self.signed_pre_key_store,
            &mut self.kyber_pre_key_store,
            &mut rng,
            UsePQRatchet::Yes,
        )
        .await
    }

    pub async fn process_sender_key_distribution(
        &mut self,
        sender: &ProtocolAddress,
        message: &SenderKeyDistributionMessage,
    ) -> Result<(), SignalProtocolError> {
        process_sender_key_distribution_message(sender, message, &mut self.sender_key_store).await
    }

    /// Decrypts one serialized sender key message from a group member.
    pub async fn group_decrypt_message(
        &mut self,
        sender: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SignalProtocolError> {
        group_decrypt(ciphertext, &mut self.sender_key_store, sender).await
    }

    /// Flushes identity, session, sender key, one-time, signed and kyber
    /// stores in that order, stopping at the first failure.
    pub async fn flush_to_disk(&mut self, durable: &D) -> Result<(), StoreError> {
        self.identity_store.flush_to_disk(durable).await?;
        self.session_store.flush_to_disk(durable).await?;
        self.sender_key_store.flush_to_disk(durable).await?;
        self.pre_key_store.flush_to_disk(durable).await?;
        self.signed_pre_key_store.flush_to_disk(durable).await?;
        self.kyber_pre_key_store.flush_to_disk(durable).await?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> IdentityKeyStore for AccountDataStore<D> {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        IdentityKeyStore::get_identity_key_pair(&self.identity_store).await
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        IdentityKeyStore::get_local_registration_id(&self.identity_store).await
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<IdentityChange, SignalProtocolError> {
        IdentityKeyStore::save_identity(&mut self.identity_store, address, identity_key).await
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        IdentityKeyStore::is_trusted_identity(&self.identity_store, address, identity_key, direction)
            .await
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        IdentityKeyStore::get_identity(&self.identity_store, address).await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> SessionStore for AccountDataStore<D> {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        SessionStore::load_session(&self.session_store, address).await
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        SessionStore::store_session(&mut self.session_store, address, record).await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> ExtendedSessionStore for AccountDataStore<D> {
    async fn load_existing_sessions(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.session_store.load_existing_sessions(addresses).await
    }

    async fn contains_session(&self, address: &ProtocolAddress) -> Result<bool, StoreError> {
        self.session_store.contains_session(address).await
    }

    async fn delete_session(&mut self, address: &ProtocolAddress) -> Result<(), StoreError> {
        self.session_store.delete_session(address).await
    }

    async fn archive_session(&mut self, address: &ProtocolAddress) -> Result<(), StoreError> {
        self.session_store.archive_session(address).await
    }

    async fn delete_all_sessions(&mut self, name: &str) -> Result<(), StoreError> {
        self.session_store.delete_all_sessions(name).await
    }

    async fn get_sub_device_sessions(&self, name: &str) -> Result<Vec<DeviceId>, StoreError> {
        self.session_store.get_sub_device_sessions(name).await
    }

    async fn get_all_addresses_with_active_sessions(
        &self,
        names: &[String],
    ) -> Result<Vec<ProtocolAddress>, StoreError> {
        self.session_store
            .get_all_addresses_with_active_sessions(names)
            .await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> SenderKeyStore for AccountDataStore<D> {
    async fn store_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        SenderKeyStore::store_sender_key(&mut self.sender_key_store, sender, distribution_id, record)
            .await
    }

    async fn load_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, SignalProtocolError> {
        SenderKeyStore::load_sender_key(&mut self.sender_key_store, sender, distribution_id).await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> ExtendedSenderKeyStore for AccountDataStore<D> {
    async fn get_sender_key_shared_with(
        &self,
        distribution_id: Uuid,
    ) -> Result<Vec<ProtocolAddress>, StoreError> {
        self.sender_key_store
            .get_sender_key_shared_with(distribution_id)
            .await
    }

    async fn mark_sender_key_shared_with(
        &mut self,
        distribution_id: Uuid,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError> {
        self.sender_key_store
            .mark_sender_key_shared_with(distribution_id, addresses)
            .await
    }

    async fn clear_sender_key_shared_with(
        &mut self,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError> {
        self.sender_key_store
            .clear_sender_key_shared_with(addresses)
            .await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> PreKeyStore for AccountDataStore<D> {
    async fn get_pre_key(&self, prekey_id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        PreKeyStore::get_pre_key(&self.pre_key_store, prekey_id).await
    }

    async fn save_pre_key(
        &mut self,
        prekey_id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        PreKeyStore::save_pre_key(&mut self.pre_key_store, prekey_id, record).await
    }

    async fn remove_pre_key(&mut self, prekey_id: PreKeyId) -> Result<(), SignalProtocolError> {
        PreKeyStore::remove_pre_key(&mut self.pre_key_store, prekey_id).await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> ExtendedPreKeyStore for AccountDataStore<D> {
    async fn contains_pre_key(&self, id: PreKeyId) -> Result<bool, StoreError> {
        self.pre_key_store.contains_pre_key(id).await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> SignedPreKeyStore for AccountDataStore<D> {
    async fn get_signed_pre_key(
        &self,
        signed_prekey_id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        SignedPreKeyStore::get_signed_pre_key(&self.signed_pre_key_store, signed_prekey_id).await
    }

    async fn save_signed_pre_key(
        &mut self,
        signed_prekey_id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        SignedPreKeyStore::save_signed_pre_key(
            &mut self.signed_pre_key_store,
            signed_prekey_id,
            record,
        )
        .await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> ExtendedSignedPreKeyStore for AccountDataStore<D> {
    async fn load_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError> {
        self.signed_pre_key_store.load_signed_pre_keys().await
    }

    async fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> Result<bool, StoreError> {
        self.signed_pre_key_store.contains_signed_pre_key(id).await
    }

    async fn remove_signed_pre_key(&mut self, id: SignedPreKeyId) -> Result<(), StoreError> {
        self.signed_pre_key_store.remove_signed_pre_key(id).await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> KyberPreKeyStore for AccountDataStore<D> {
    async fn get_kyber_pre_key(
        &self,
        kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        KyberPreKeyStore::get_kyber_pre_key(&self.kyber_pre_key_store, kyber_prekey_id).await
    }

    async fn save_kyber_pre_key(
        &mut self,
        kyber_prekey_id: KyberPreKeyId,
        record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        KyberPreKeyStore::save_kyber_pre_key(&mut self.kyber_pre_key_store, kyber_prekey_id, record)
            .await
    }

    async fn mark_kyber_pre_key_used(
        &mut self,
        kyber_prekey_id: KyberPreKeyId,
    ) -> Result<(), SignalProtocolError> {
        KyberPreKeyStore::mark_kyber_pre_key_used(&mut self.kyber_pre_key_store, kyber_prekey_id)
            .await
    }
}

#[async_trait(?Send)]
impl<D: DurableProtocolStore> ExtendedKyberPreKeyStore for AccountDataStore<D> {
    async fn load_kyber_pre_keys(&self) -> Result<Vec<KyberPreKeyRecord>, StoreError> {
        self.kyber_pre_key_store.load_kyber_pre_keys().await
    }

    async fn load_last_resort_kyber_pre_keys(&self) -> Result<Vec<KyberPreKeyRecord>, StoreError> {
        self.kyber_pre_key_store
            .load_last_resort_kyber_pre_keys()
            .await
    }

    async fn store_last_resort_kyber_pre_key(
        &mut self,
        id: KyberPreKeyId,
        record: &KyberPreKeyRecord,
    ) -> Result<(), StoreError> {
        self.kyber_pre_key_store
            .store_last_resort_kyber_pre_key(id, record)
            .await
    }

    async fn contains_kyber_pre_key(&self, id: KyberPreKeyId) -> Result<bool, StoreError> {
        self.kyber_pre_key_store.contains_kyber_pre_key(id).await
    }

    async fn remove_kyber_pre_key(&mut self, id: KyberPreKeyId) -> Result<(), StoreError> {
        self.kyber_pre_key_store.remove_kyber_pre_key(id).await
    }
}
