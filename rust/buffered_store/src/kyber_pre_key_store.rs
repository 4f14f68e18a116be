//! Buffered Kyber post-quantum pre-key storage
//!
//! Marking a key used evicts it unless it is the last-resort key. The durable
//! store gets one "mark used" call per marked id on flush and decides itself
//! whether to delete or keep the key.

use crate::durable_trait::{DurableKyberPreKeyStore, StoredKyberPreKey};
use crate::error::StoreError;
use crate::storage_trait::ExtendedKyberPreKeyStore;
use async_trait::async_trait;
use libsignal_protocol::{KyberPreKeyId, KyberPreKeyRecord, KyberPreKeyStore, SignalProtocolError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct KyberPreKeyCache {
    records: HashMap<u32, StoredKyberPreKey>,
    missing: HashSet<u32>,
    consumed: HashSet<u32>,
    pending_used: VecDeque<u32>,
    has_loaded_all: bool,
}

impl KyberPreKeyCache {
    async fn lookup<D: DurableKyberPreKeyStore>(
        &mut self,
        durable: &D,
        id: KyberPreKeyId,
    ) -> Result<StoredKyberPreKey, StoreError> {
        let key = u32::from(id);
        if let Some(stored) = self.records.get(&key) {
            return Ok(stored.clone());
        }
        if self.has_loaded_all || self.missing.contains(&key) || self.consumed.contains(&key) {
            return Err(StoreError::InvalidKyberPreKeyId(key));
        }

        match durable.get_kyber_pre_key(id).await? {
            Some(stored) => {
                self.records.insert(key, stored.clone());
                Ok(stored)
            }
            None => {
                self.missing.insert(key);
                Err(StoreError::InvalidKyberPreKeyId(key))
            }
        }
    }
}

pub struct BufferedKyberPreKeyStore<D> {
    durable: Arc<D>,
    cache: Mutex<KyberPreKeyCache>,
}

impl<D: DurableKyberPreKeyStore> BufferedKyberPreKeyStore<D> {
    pub fn new(durable: Arc<D>) -> Self {
        Self {
            durable,
            cache: Mutex::new(KyberPreKeyCache::default()),
        }
    }

    pub async fn get_kyber_pre_key(
        &self,
        id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, StoreError> {
        let mut cache = self.cache.lock().await;
        let stored = cache.lookup(self.durable.as_ref(), id).await?;
        Ok(stored.record)
    }

    pub async fn save_kyber_pre_key(
        &mut self,
        _id: KyberPreKeyId,
        _record: &KyberPreKeyRecord,
    ) -> Result<(), StoreError> {
        Err(StoreError::unsupported("save_kyber_pre_key"))
    }

    pub async fn mark_kyber_pre_key_used(&mut self, id: KyberPreKeyId) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let stored = cache.lookup(self.durable.as_ref(), id).await?;
        let key = u32::from(id);
        if !stored.last_resort {
            cache.records.remove(&key);
            cache.consumed.insert(key);
        }
        cache.pending_used.push_back(key);
        Ok(())
    }

    pub async fn flush_to_disk(&mut self, durable: &D) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let writes = cache.pending_used.len();

        while let Some(&key) = cache.pending_used.front() {
            durable
                .mark_kyber_pre_key_used(KyberPreKeyId::from(key))
                .await?;
            cache.pending_used.pop_front();
        }

        tracing::debug!(store = "kyber_pre_key", writes, "flushed buffered store");
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurableKyberPreKeyStore> ExtendedKyberPreKeyStore for BufferedKyberPreKeyStore<D> {
    /// Every kyber pre-key not consumed in this batch, ordered by id.
    async fn load_kyber_pre_keys(&self) -> Result<Vec<KyberPreKeyRecord>, StoreError> {
        let mut cache = self.cache.lock().await;
        if !cache.has_loaded_all {
            for stored in self.durable.get_all_kyber_pre_keys().await? {
                let key = u32::from(stored.id);
                if cache.consumed.contains(&key) {
                    continue;
                }
                cache.missing.remove(&key);
                cache.records.entry(key).or_insert(stored);
            }
            cache.has_loaded_all = true;
        }

        let mut records: Vec<(u32, KyberPreKeyRecord)> = cache
            .records
            .iter()
            .map(|(key, stored)| (*key, stored.record.clone()))
            .collect();
        records.sort_by_key(|(key, _)| *key);
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }

    async fn load_last_resort_kyber_pre_keys(&self) -> Result<Vec<KyberPreKeyRecord>, StoreError> {
        Err(StoreError::unsupported("load_last_resort_kyber_pre_keys"))
    }

    async fn store_last_resort_kyber_pre_key(
        &mut self,
        _id: KyberPreKeyId,
        _record: &KyberPreKeyRecord,
    ) -> Result<(), StoreError> {
        Err(StoreError::unsupported("store_last_resort_kyber_pre_key"))
    }

    async fn contains_kyber_pre_key(&self, id: KyberPreKeyId) -> Result<bool, StoreError> {
        match self.get_kyber_pre_key(id).await {
            Ok(_) => Ok(true),
            Err(StoreError::InvalidKyberPreKeyId(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove_kyber_pre_key(&mut self, _id: KyberPreKeyId) -> Result<(), StoreError> {
        Err(StoreError::unsupported("remove_kyber_pre_key"))
    }
}

#[async_trait(?Send)]
impl<D: DurableKyberPreKeyStore> KyberPreKeyStore for BufferedKyberPreKeyStore<D> {
    async fn get_kyber_pre_key(
        &self,
        kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        Ok(Self::get_kyber_pre_key(self, kyber_prekey_id).await?)
    }

    async fn save_kyber_pre_key(
        &mut self,
        kyber_prekey_id: KyberPreKeyId,
        record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(Self::save_kyber_pre_key(self, kyber_prekey_id, record).await?)
    }

    async fn mark_kyber_pre_key_used(
        &mut self,
        kyber_prekey_id: KyberPreKeyId,
    ) -> Result<(), SignalProtocolError> {
        Ok(Self::mark_kyber_pre_key_used(self, kyber_prekey_id).await?)
    }
}
