//! Buffered session storage
//!
//! Sessions are cached per address. Updates and deletions are tracked
//! separately because they flush through different durable calls, and
//! updates are always applied first.

use crate::address_key;
use crate::durable_trait::DurableSessionStore;
use crate::error::StoreError;
use crate::storage_trait::ExtendedSessionStore;
use async_trait::async_trait;
use libsignal_protocol::{
    DeviceId, ProtocolAddress, SessionRecord, SessionStore, SessionUsabilityRequirements,
    SignalProtocolError,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

#[derive(Default)]
struct SessionCache {
    sessions: HashMap<String, SessionRecord>,
    /// Deleted this batch; reads never fall through to the durable store.
    missing: HashSet<String>,
    /// Absent from the durable store, with no placeholder cached yet.
    absent: HashSet<String>,
    updated: HashMap<String, (ProtocolAddress, SessionRecord)>,
    deleted: HashMap<String, ProtocolAddress>,
}

impl SessionCache {
    async fn lookup<D: DurableSessionStore>(
        &mut self,
        durable: &D,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let key = address_key(address);
        if let Some(record) = self.sessions.get(&key) {
            return Ok(Some(record.clone()));
        }
        if self.missing.contains(&key) {
            return Ok(None);
        }

        let record = if self.absent.remove(&key) {
            SessionRecord::new_fresh()
        } else {
            durable
                .load_session(address)
                .await?
                .unwrap_or_else(SessionRecord::new_fresh)
        };
        self.sessions.insert(key, record.clone());
        Ok(Some(record))
    }
}

fn is_usable(record: &SessionRecord) -> Result<bool, StoreError> {
    record
        .has_usable_sender_chain(SystemTime::now(), SessionUsabilityRequirements::empty())
        .map_err(|e| StoreError::Storage(format!("Invalid session record: {e}")))
}

pub struct BufferedSessionStore<D> {
    durable: Arc<D>,
    cache: Mutex<SessionCache>,
}

impl<D: DurableSessionStore> BufferedSessionStore<D> {
    pub fn new(durable: Arc<D>) -> Self {
        Self {
            durable,
            cache: Mutex::new(SessionCache::default()),
        }
    }

    /// Never absent: an address without a session yields a fresh record, which
    /// stays cached for the rest of the batch unless the session was deleted.
    pub async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<SessionRecord, StoreError> {
        let mut cache = self.cache.lock().await;
        let record = cache.lookup(self.durable.as_ref(), address).await?;
        Ok(record.unwrap_or_else(SessionRecord::new_fresh))
    }

    pub async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let key = address_key(address);
        cache.missing.remove(&key);
        cache.absent.remove(&key);
        cache.deleted.remove(&key);
        cache.sessions.insert(key.clone(), record.clone());
        cache.updated.insert(key, (address.clone(), record.clone()));
        Ok(())
    }

    pub async fn flush_to_disk(&mut self, durable: &D) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let writes = cache.updated.len() + cache.deleted.len();

        let pending: Vec<String> = cache.updated.keys().cloned().collect();
        for key in pending {
            if let Some((address, record)) = cache.updated.get(&key) {
                durable.store_session(address, record).await?;
            }
            cache.updated.remove(&key);
        }

        let pending: Vec<String> = cache.deleted.keys().cloned().collect();
        for key in pending {
            if let Some(address) = cache.deleted.get(&key) {
                durable.delete_session(address).await?;
            }
            cache.deleted.remove(&key);
        }

        tracing::debug!(store = "session", writes, "flushed buffered store");
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurableSessionStore> ExtendedSessionStore for BufferedSessionStore<D> {
    async fn load_existing_sessions(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let mut cache = self.cache.lock().await;
        let mut found: Vec<Option<SessionRecord>> = Vec::with_capacity(addresses.len());
        let mut misses: Vec<usize> = Vec::new();

        for (index, address) in addresses.iter().enumerate() {
            let key = address_key(address);
            match cache.sessions.get(&key) {
                Some(record) => found.push(Some(record.clone())),
                None => {
                    found.push(None);
                    if !cache.missing.contains(&key) && !cache.absent.contains(&key) {
                        misses.push(index);
                    }
                }
            }
        }

        if !misses.is_empty() {
            let lookup: Vec<ProtocolAddress> =
                misses.iter().map(|&index| addresses[index].clone()).collect();
            let loaded = self.durable.load_sessions(&lookup).await?;

            for (index, record) in misses.into_iter().zip(loaded) {
                let key = address_key(&addresses[index]);
                match record {
                    Some(record) => {
                        cache.sessions.insert(key, record.clone());
                        found[index] = Some(record);
                    }
                    None => {
                        cache.absent.insert(key);
                    }
                }
            }
        }

        found
            .into_iter()
            .zip(addresses)
            .map(|(record, address)| record.ok_or_else(|| StoreError::NoSession(address.clone())))
            .collect()
    }

    /// Any cached record counts. A session read from the durable store only
    /// counts when it has a sender chain.
    async fn contains_session(&self, address: &ProtocolAddress) -> Result<bool, StoreError> {
        let mut cache = self.cache.lock().await;
        let key = address_key(address);
        if cache.sessions.contains_key(&key) {
            return Ok(true);
        }
        if cache.missing.contains(&key) || cache.absent.contains(&key) {
            return Ok(false);
        }

        match self.durable.load_session(address).await? {
            Some(record) => {
                let usable = is_usable(&record)?;
                cache.sessions.insert(key, record);
                Ok(usable)
            }
            None => {
                cache.absent.insert(key);
                Ok(false)
            }
        }
    }

    async fn delete_session(&mut self, address: &ProtocolAddress) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let key = address_key(address);
        cache.sessions.remove(&key);
        cache.updated.remove(&key);
        cache.absent.remove(&key);
        cache.missing.insert(key.clone());
        cache.deleted.insert(key, address.clone());
        Ok(())
    }

    async fn archive_session(&mut self, _address: &ProtocolAddress) -> Result<(), StoreError> {
        Err(StoreError::unsupported("archive_session"))
    }

    async fn delete_all_sessions(&mut self, _name: &str) -> Result<(), StoreError> {
        Err(StoreError::unsupported("delete_all_sessions"))
    }

    async fn get_sub_device_sessions(&self, _name: &str) -> Result<Vec<DeviceId>, StoreError> {
        Err(StoreError::unsupported("get_sub_device_sessions"))
    }

    async fn get_all_addresses_with_active_sessions(
        &self,
        _names: &[String],
    ) -> Result<Vec<ProtocolAddress>, StoreError> {
        Err(StoreError::unsupported(
            "get_all_addresses_with_active_sessions",
        ))
    }
}

#[async_trait(?Send)]
impl<D: DurableSessionStore> SessionStore for BufferedSessionStore<D> {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        Ok(Some(Self::load_session(self, address).await?))
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(Self::store_session(self, address, record).await?)
    }
}
