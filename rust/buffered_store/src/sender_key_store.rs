//! Buffered sender key storage
//!
//! Sender keys are keyed by sender address and distribution id. Clearing the
//! "shared with" markers is accumulated and sent to the durable store as a
//! single call on flush.

use crate::address_key;
use crate::durable_trait::DurableSenderKeyStore;
use crate::error::StoreError;
use crate::storage_trait::ExtendedSenderKeyStore;
use async_trait::async_trait;
use libsignal_protocol::{ProtocolAddress, SenderKeyRecord, SenderKeyStore, SignalProtocolError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

type SenderKeyId = (String, Uuid);

#[derive(Default)]
struct SenderKeyCache {
    records: HashMap<SenderKeyId, SenderKeyRecord>,
    missing: HashSet<SenderKeyId>,
    updated: HashMap<SenderKeyId, (ProtocolAddress, SenderKeyRecord)>,
    clear_shared: HashMap<String, ProtocolAddress>,
}

pub struct BufferedSenderKeyStore<D> {
    durable: Arc<D>,
    cache: Mutex<SenderKeyCache>,
}

impl<D: DurableSenderKeyStore> BufferedSenderKeyStore<D> {
    pub fn new(durable: Arc<D>) -> Self {
        Self {
            durable,
            cache: Mutex::new(SenderKeyCache::default()),
        }
    }

    pub async fn load_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, StoreError> {
        let mut cache = self.cache.lock().await;
        let id = (address_key(sender), distribution_id);
        if let Some(record) = cache.records.get(&id) {
            return Ok(Some(record.clone()));
        }
        if cache.missing.contains(&id) {
            return Ok(None);
        }

        let loaded = self.durable.load_sender_key(sender, distribution_id).await?;
        match &loaded {
            Some(record) => {
                cache.records.insert(id, record.clone());
            }
            None => {
                cache.missing.insert(id);
            }
        }
        Ok(loaded)
    }

    pub async fn store_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let id = (address_key(sender), distribution_id);
        cache.missing.remove(&id);
        cache.records.insert(id.clone(), record.clone());
        cache.updated.insert(id, (sender.clone(), record.clone()));
        Ok(())
    }

    pub async fn flush_to_disk(&mut self, durable: &D) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let writes = cache.updated.len() + usize::from(!cache.clear_shared.is_empty());

        let pending: Vec<SenderKeyId> = cache.updated.keys().cloned().collect();
        for id in pending {
            if let Some((sender, record)) = cache.updated.get(&id) {
                durable.store_sender_key(sender, id.1, record).await?;
            }
            cache.updated.remove(&id);
        }

        if !cache.clear_shared.is_empty() {
            let addresses: Vec<ProtocolAddress> = cache.clear_shared.values().cloned().collect();
            durable.clear_sender_key_shared_with(&addresses).await?;
            cache.clear_shared.clear();
        }

        tracing::debug!(store = "sender_key", writes, "flushed buffered store");
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurableSenderKeyStore> ExtendedSenderKeyStore for BufferedSenderKeyStore<D> {
    async fn get_sender_key_shared_with(
        &self,
        _distribution_id: Uuid,
    ) -> Result<Vec<ProtocolAddress>, StoreError> {
        Err(StoreError::unsupported("get_sender_key_shared_with"))
    }

    async fn mark_sender_key_shared_with(
        &mut self,
        _distribution_id: Uuid,
        _addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError> {
        Err(StoreError::unsupported("mark_sender_key_shared_with"))
    }

    async fn clear_sender_key_shared_with(
        &mut self,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        for address in addresses {
            cache
                .clear_shared
                .insert(address_key(address), address.clone());
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurableSenderKeyStore> SenderKeyStore for BufferedSenderKeyStore<D> {
    async fn store_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(Self::store_sender_key(self, sender, distribution_id, record).await?)
    }

    async fn load_sender_key(
        &mut self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, SignalProtocolError> {
        Ok(Self::load_sender_key(self, sender, distribution_id).await?)
    }
}
