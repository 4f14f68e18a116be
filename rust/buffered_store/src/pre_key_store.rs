//! Buffered one-time pre-key storage

use crate::durable_trait::DurablePreKeyStore;
use crate::error::StoreError;
use crate::storage_trait::ExtendedPreKeyStore;
use async_trait::async_trait;
use libsignal_protocol::{PreKeyId, PreKeyRecord, PreKeyStore, SignalProtocolError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct PreKeyCache {
    records: HashMap<u32, PreKeyRecord>,
    /// Absent from the durable store, or removed in this batch.
    missing: HashSet<u32>,
    removed: VecDeque<u32>,
}

pub struct BufferedPreKeyStore<D> {
    durable: Arc<D>,
    cache: Mutex<PreKeyCache>,
}

impl<D: DurablePreKeyStore> BufferedPreKeyStore<D> {
    pub fn new(durable: Arc<D>) -> Self {
        Self {
            durable,
            cache: Mutex::new(PreKeyCache::default()),
        }
    }

    pub async fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, StoreError> {
        let key = u32::from(id);
        let mut cache = self.cache.lock().await;
        if let Some(record) = cache.records.get(&key) {
            return Ok(record.clone());
        }
        if cache.missing.contains(&key) {
            return Err(StoreError::InvalidPreKeyId(key));
        }

        match self.durable.get_pre_key(id).await? {
            Some(record) => {
                cache.records.insert(key, record.clone());
                Ok(record)
            }
            None => {
                cache.missing.insert(key);
                Err(StoreError::InvalidPreKeyId(key))
            }
        }
    }

    /// One-time pre-keys are only generated at registration or refill.
    pub async fn save_pre_key(
        &mut self,
        _id: PreKeyId,
        _record: &PreKeyRecord,
    ) -> Result<(), StoreError> {
        Err(StoreError::unsupported("save_pre_key"))
    }

    pub async fn remove_pre_key(&mut self, id: PreKeyId) -> Result<(), StoreError> {
        let key = u32::from(id);
        let cache = self.cache.get_mut();
        cache.records.remove(&key);
        cache.missing.insert(key);
        if !cache.removed.contains(&key) {
            cache.removed.push_back(key);
        }
        Ok(())
    }

    pub async fn flush_to_disk(&mut self, durable: &D) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let writes = cache.removed.len();

        while let Some(&key) = cache.removed.front() {
            durable.remove_pre_key(PreKeyId::from(key)).await?;
            cache.removed.pop_front();
        }

        tracing::debug!(store = "pre_key", writes, "flushed buffered store");
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurablePreKeyStore> ExtendedPreKeyStore for BufferedPreKeyStore<D> {
    async fn contains_pre_key(&self, id: PreKeyId) -> Result<bool, StoreError> {
        match self.get_pre_key(id).await {
            Ok(_) => Ok(true),
            Err(StoreError::InvalidPreKeyId(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait(?Send)]
impl<D: DurablePreKeyStore> PreKeyStore for BufferedPreKeyStore<D> {
    async fn get_pre_key(&self, prekey_id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        Ok(Self::get_pre_key(self, prekey_id).await?)
    }

    async fn save_pre_key(
        &mut self,
        prekey_id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(Self::save_pre_key(self, prekey_id, record).await?)
    }

    async fn remove_pre_key(&mut self, prekey_id: PreKeyId) -> Result<(), SignalProtocolError> {
        Ok(Self::remove_pre_key(self, prekey_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_pre_key;
    use crate::memory_storage::MemoryStorage;

    #[tokio::test]
    async fn test_get_pre_key_reads_through_once() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let (id, record) = generate_pre_key(7)?;
        storage.save_pre_key(id, &record).await;

        let store = BufferedPreKeyStore::new(Arc::clone(&storage));
        assert_eq!(store.get_pre_key(id).await?.serialize()?, record.serialize()?);
        assert_eq!(store.get_pre_key(id).await?.serialize()?, record.serialize()?);
        assert_eq!(storage.read_count(), 1);

        storage.fail_reads(true);
        assert!(store.contains_pre_key(id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_pre_key_is_invalid_id() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let store = BufferedPreKeyStore::new(Arc::clone(&storage));

        let result = store.get_pre_key(PreKeyId::from(99u32)).await;
        assert!(matches!(result, Err(StoreError::InvalidPreKeyId(99))));
        assert!(!store.contains_pre_key(PreKeyId::from(99u32)).await?);
        assert_eq!(storage.read_count(), 1);

        let result = PreKeyStore::get_pre_key(&store, PreKeyId::from(99u32)).await;
        assert!(matches!(result, Err(SignalProtocolError::InvalidPreKeyId)));
        Ok(())
    }

    #[tokio::test]
    async fn test_one_time_pre_key_is_single_use() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let (id, record) = generate_pre_key(3)?;
        storage.save_pre_key(id, &record).await;

        let mut store = BufferedPreKeyStore::new(Arc::clone(&storage));
        store.get_pre_key(id).await?;
        store.remove_pre_key(id).await?;
        assert!(matches!(
            store.get_pre_key(id).await,
            Err(StoreError::InvalidPreKeyId(3))
        ));
        assert_eq!(storage.pre_key_count().await, 1);

        store.flush_to_disk(&storage).await?;
        assert_eq!(storage.pre_key_count().await, 0);
        assert_eq!(storage.write_count(), 1);

        store.flush_to_disk(&storage).await?;
        assert_eq!(storage.write_count(), 1);

        let fresh = BufferedPreKeyStore::new(Arc::clone(&storage));
        assert!(matches!(
            fresh.get_pre_key(id).await,
            Err(StoreError::InvalidPreKeyId(3))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_save_pre_key_is_unsupported() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = BufferedPreKeyStore::new(Arc::clone(&storage));
        let (id, record) = generate_pre_key(1)?;

        assert!(matches!(
            store.save_pre_key(id, &record).await,
            Err(StoreError::UnsupportedInBufferedMode { .. })
        ));
        assert_eq!(storage.pre_key_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_removals() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let (first_id, first) = generate_pre_key(1)?;
        let (second_id, second) = generate_pre_key(2)?;
        storage.save_pre_key(first_id, &first).await;
        storage.save_pre_key(second_id, &second).await;

        let mut store = BufferedPreKeyStore::new(Arc::clone(&storage));
        store.remove_pre_key(first_id).await?;
        store.remove_pre_key(second_id).await?;

        storage.fail_writes(true);
        assert!(store.flush_to_disk(&storage).await.is_err());
        assert_eq!(storage.pre_key_count().await, 2);

        storage.fail_writes(false);
        store.flush_to_disk(&storage).await?;
        assert_eq!(storage.pre_key_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_flush_drains_many_removals() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        for id in 1..=500u32 {
            let (id, record) = generate_pre_key(id)?;
            storage.save_pre_key(id, &record).await;
        }

        let mut store = BufferedPreKeyStore::new(Arc::clone(&storage));
        for id in 1..=500u32 {
            store.remove_pre_key(PreKeyId::from(id)).await?;
            store.remove_pre_key(PreKeyId::from(id)).await?;
        }

        store.flush_to_disk(&storage).await?;
        assert_eq!(storage.pre_key_count().await, 0);
        assert_eq!(storage.write_count(), 500);

        store.flush_to_disk(&storage).await?;
        assert_eq!(storage.write_count(), 500);
        Ok(())
    }
}
