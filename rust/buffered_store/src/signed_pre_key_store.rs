//! Buffered signed pre-key storage
//!
//! Same shape as the one-time store, plus `load_signed_pre_keys`, which scans
//! the durable store at most once per batch.

use crate::durable_trait::DurableSignedPreKeyStore;
use crate::error::StoreError;
use crate::storage_trait::ExtendedSignedPreKeyStore;
use async_trait::async_trait;
use libsignal_protocol::{
    GenericSignedPreKey, SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord,
    SignedPreKeyStore,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct SignedPreKeyCache {
    records: HashMap<u32, SignedPreKeyRecord>,
    missing: HashSet<u32>,
    removed: VecDeque<u32>,
    has_loaded_all: bool,
}

pub struct BufferedSignedPreKeyStore<D> {
    durable: Arc<D>,
    cache: Mutex<SignedPreKeyCache>,
}

impl<D: DurableSignedPreKeyStore> BufferedSignedPreKeyStore<D> {
    pub fn new(durable: Arc<D>) -> Self {
        Self {
            durable,
            cache: Mutex::new(SignedPreKeyCache::default()),
        }
    }

    pub async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, StoreError> {
        let key = u32::from(id);
        let mut cache = self.cache.lock().await;
        if let Some(record) = cache.records.get(&key) {
            return Ok(record.clone());
        }
        // After a full scan every surviving key is cached.
        if cache.has_loaded_all || cache.missing.contains(&key) {
            return Err(StoreError::InvalidSignedPreKeyId(key));
        }

        match self.durable.get_signed_pre_key(id).await? {
            Some(record) => {
                cache.records.insert(key, record.clone());
                Ok(record)
            }
            None => {
                cache.missing.insert(key);
                Err(StoreError::InvalidSignedPreKeyId(key))
            }
        }
    }

    pub async fn save_signed_pre_key(
        &mut self,
        _id: SignedPreKeyId,
        _record: &SignedPreKeyRecord,
    ) -> Result<(), StoreError> {
        Err(StoreError::unsupported("save_signed_pre_key"))
    }

    pub async fn flush_to_disk(&mut self, durable: &D) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let writes = cache.removed.len();

        while let Some(&key) = cache.removed.front() {
            durable
                .remove_signed_pre_key(SignedPreKeyId::from(key))
                .await?;
            cache.removed.pop_front();
        }

        tracing::debug!(store = "signed_pre_key", writes, "flushed buffered store");
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurableSignedPreKeyStore> ExtendedSignedPreKeyStore for BufferedSignedPreKeyStore<D> {
    /// All signed pre-keys not removed in this batch, ordered by id.
    async fn load_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError> {
        let mut cache = self.cache.lock().await;
        if !cache.has_loaded_all {
            for record in self.durable.get_all_signed_pre_keys().await? {
                let key = u32::from(record.id()?);
                if cache.removed.contains(&key) {
                    continue;
                }
                cache.missing.remove(&key);
                cache.records.entry(key).or_insert(record);
            }
            cache.has_loaded_all = true;
        }

        let mut records: Vec<(u32, SignedPreKeyRecord)> = cache
            .records
            .iter()
            .map(|(key, record)| (*key, record.clone()))
            .collect();
        records.sort_by_key(|(key, _)| *key);
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    async fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> Result<bool, StoreError> {
        match self.get_signed_pre_key(id).await {
            Ok(_) => Ok(true),
            Err(StoreError::InvalidSignedPreKeyId(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove_signed_pre_key(&mut self, id: SignedPreKeyId) -> Result<(), StoreError> {
        let key = u32::from(id);
        let cache = self.cache.get_mut();
        cache.records.remove(&key);
        cache.missing.insert(key);
        if !cache.removed.contains(&key) {
            cache.removed.push_back(key);
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurableSignedPreKeyStore> SignedPreKeyStore for BufferedSignedPreKeyStore<D> {
    async fn get_signed_pre_key(
        &self,
        signed_prekey_id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        Ok(Self::get_signed_pre_key(self, signed_prekey_id).await?)
    }

    async fn save_signed_pre_key(
        &mut self,
        signed_prekey_id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(Self::save_signed_pre_key(self, signed_prekey_id, record).await?)
    }
}
