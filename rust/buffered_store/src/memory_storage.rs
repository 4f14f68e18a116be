//! In-memory durable storage implementation
//!
//! This module provides an in-memory implementation of the durable store
//! traits. Data is lost when the process terminates. Every trait call is
//! counted, and reads or writes can be made to fail, so the buffered stores
//! can be checked for how often (and whether) they touch the durable layer.

use crate::address_key;
use crate::durable_trait::*;
use crate::error::StoreError;
use async_trait::async_trait;
use libsignal_protocol::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryTables {
    identities: HashMap<String, IdentityKey>,
    sessions: HashMap<String, SessionRecord>,
    sender_keys: HashMap<(String, Uuid), SenderKeyRecord>,
    sender_key_shared: HashMap<Uuid, HashMap<String, ProtocolAddress>>,
    pre_keys: HashMap<u32, PreKeyRecord>,
    signed_pre_keys: HashMap<u32, SignedPreKeyRecord>,
    kyber_pre_keys: HashMap<u32, StoredKyberPreKey>,
    kyber_used: HashSet<u32>,
}

pub struct MemoryStorage {
    tables: Mutex<MemoryTables>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(MemoryTables::default()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Number of durable read calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of durable write calls applied so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }

    /// Makes every read fail, as if the backing database were unreachable.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn begin_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("memory store is unreachable".to_string()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("memory store rejected the write".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    // Registration-side writes. These never go through a buffered store and
    // are not counted.

    pub async fn save_pre_key(&self, id: PreKeyId, record: &PreKeyRecord) {
        let mut tables = self.tables.lock().await;
        tables.pre_keys.insert(u32::from(id), record.clone());
    }

    pub async fn save_signed_pre_key(&self, id: SignedPreKeyId, record: &SignedPreKeyRecord) {
        let mut tables = self.tables.lock().await;
        tables.signed_pre_keys.insert(u32::from(id), record.clone());
    }

    pub async fn save_kyber_pre_key(
        &self,
        id: KyberPreKeyId,
        record: &KyberPreKeyRecord,
        last_resort: bool,
    ) {
        let mut tables = self.tables.lock().await;
        tables.kyber_pre_keys.insert(
            u32::from(id),
            StoredKyberPreKey {
                id,
                record: record.clone(),
                last_resort,
            },
        );
    }

    pub async fn mark_sender_key_shared_with(
        &self,
        distribution_id: Uuid,
        addresses: &[ProtocolAddress],
    ) {
        let mut tables = self.tables.lock().await;
        let shared = tables.sender_key_shared.entry(distribution_id).or_default();
        for address in addresses {
            shared.insert(address_key(address), address.clone());
        }
    }

    pub async fn sender_key_shared_with(&self, distribution_id: Uuid) -> Vec<ProtocolAddress> {
        let tables = self.tables.lock().await;
        let mut addresses: Vec<ProtocolAddress> = tables
            .sender_key_shared
            .get(&distribution_id)
            .map(|shared| shared.values().cloned().collect())
            .unwrap_or_default();
        addresses.sort_by_key(address_key);
        addresses
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }

    pub async fn identity_count(&self) -> usize {
        self.tables.lock().await.identities.len()
    }

    pub async fn pre_key_count(&self) -> usize {
        self.tables.lock().await.pre_keys.len()
    }

    pub async fn signed_pre_key_count(&self) -> usize {
        self.tables.lock().await.signed_pre_keys.len()
    }

    pub async fn kyber_pre_key_count(&self) -> usize {
        self.tables.lock().await.kyber_pre_keys.len()
    }

    pub async fn kyber_pre_key_was_used(&self, id: KyberPreKeyId) -> bool {
        self.tables.lock().await.kyber_used.contains(&u32::from(id))
    }
}

#[async_trait(?Send)]
impl DurableIdentityStore for MemoryStorage {
    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(tables.identities.get(&address_key(address)).copied())
    }

    async fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        tables.identities.insert(address_key(address), *identity_key);
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurableSessionStore for MemoryStorage {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(tables.sessions.get(&address_key(address)).cloned())
    }

    async fn load_sessions(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<Vec<Option<SessionRecord>>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(addresses
            .iter()
            .map(|address| tables.sessions.get(&address_key(address)).cloned())
            .collect())
    }

    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        tables.sessions.insert(address_key(address), record.clone());
        Ok(())
    }

    async fn delete_session(&self, address: &ProtocolAddress) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        tables.sessions.remove(&address_key(address));
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurableSenderKeyStore for MemoryStorage {
    async fn load_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .sender_keys
            .get(&(address_key(sender), distribution_id))
            .cloned())
    }

    async fn store_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        tables
            .sender_keys
            .insert((address_key(sender), distribution_id), record.clone());
        Ok(())
    }

    async fn clear_sender_key_shared_with(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        for shared in tables.sender_key_shared.values_mut() {
            for address in addresses {
                shared.remove(&address_key(address));
            }
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurablePreKeyStore for MemoryStorage {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<Option<PreKeyRecord>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(tables.pre_keys.get(&u32::from(id)).cloned())
    }

    async fn remove_pre_key(&self, id: PreKeyId) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        tables.pre_keys.remove(&u32::from(id));
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurableSignedPreKeyStore for MemoryStorage {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(tables.signed_pre_keys.get(&u32::from(id)).cloned())
    }

    async fn get_all_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(tables.signed_pre_keys.values().cloned().collect())
    }

    async fn remove_signed_pre_key(&self, id: SignedPreKeyId) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        tables.signed_pre_keys.remove(&u32::from(id));
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurableKyberPreKeyStore for MemoryStorage {
    async fn get_kyber_pre_key(
        &self,
        id: KyberPreKeyId,
    ) -> Result<Option<StoredKyberPreKey>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(tables.kyber_pre_keys.get(&u32::from(id)).cloned())
    }

    async fn get_all_kyber_pre_keys(&self) -> Result<Vec<StoredKyberPreKey>, StoreError> {
        self.begin_read()?;
        let tables = self.tables.lock().await;
        Ok(tables.kyber_pre_keys.values().cloned().collect())
    }

    async fn mark_kyber_pre_key_used(&self, id: KyberPreKeyId) -> Result<(), StoreError> {
        self.begin_write()?;
        let mut tables = self.tables.lock().await;
        let key = u32::from(id);
        tables.kyber_used.insert(key);
        let last_resort = tables
            .kyber_pre_keys
            .get(&key)
            .is_some_and(|stored| stored.last_resort);
        if !last_resort {
            tables.kyber_pre_keys.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_kyber_pre_key, generate_pre_key, test_address};

    #[tokio::test]
    async fn test_counts_reads_and_writes() -> Result<(), Box<dyn std::error::Error>> {
        let storage = MemoryStorage::new();
        let address = test_address("bob")?;

        assert!(storage.load_session(&address).await?.is_none());
        storage
            .store_session(&address, &SessionRecord::new_fresh())
            .await?;
        assert!(storage.load_session(&address).await?.is_some());

        assert_eq!(storage.read_count(), 2);
        assert_eq!(storage.write_count(), 1);

        storage.reset_counters();
        assert_eq!(storage.read_count(), 0);
        assert_eq!(storage.write_count(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_failure_switches() -> Result<(), Box<dyn std::error::Error>> {
        let storage = MemoryStorage::new();
        let address = test_address("bob")?;

        storage.fail_reads(true);
        assert!(storage.load_session(&address).await.is_err());
        storage.fail_reads(false);

        storage.fail_writes(true);
        assert!(storage.delete_session(&address).await.is_err());
        storage.fail_writes(false);
        storage.delete_session(&address).await?;

        assert_eq!(storage.read_count(), 0);
        assert_eq!(storage.write_count(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_batched_session_load_keeps_order() -> Result<(), Box<dyn std::error::Error>> {
        let storage = MemoryStorage::new();
        let alice = test_address("alice")?;
        let bob = test_address("bob")?;
        let carol = test_address("carol")?;

        storage
            .store_session(&alice, &SessionRecord::new_fresh())
            .await?;
        storage
            .store_session(&carol, &SessionRecord::new_fresh())
            .await?;

        let loaded = storage
            .load_sessions(&[carol.clone(), bob.clone(), alice.clone()])
            .await?;
        assert_eq!(loaded.len(), 3);
        assert!(loaded[0].is_some());
        assert!(loaded[1].is_none());
        assert!(loaded[2].is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_one_time_pre_key_removal() -> Result<(), Box<dyn std::error::Error>> {
        let storage = MemoryStorage::new();
        let (id, record) = generate_pre_key(5)?;
        storage.save_pre_key(id, &record).await;

        assert!(storage.get_pre_key(id).await?.is_some());
        storage.remove_pre_key(id).await?;
        assert!(storage.get_pre_key(id).await?.is_none());
        assert_eq!(storage.pre_key_count().await, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_mark_kyber_used_keeps_last_resort() -> Result<(), Box<dyn std::error::Error>> {
        let storage = MemoryStorage::new();
        let (one_time_id, one_time) = generate_kyber_pre_key(1)?;
        let (last_resort_id, last_resort) = generate_kyber_pre_key(2)?;
        storage
            .save_kyber_pre_key(one_time_id, &one_time, false)
            .await;
        storage
            .save_kyber_pre_key(last_resort_id, &last_resort, true)
            .await;

        storage.mark_kyber_pre_key_used(one_time_id).await?;
        storage.mark_kyber_pre_key_used(last_resort_id).await?;

        assert!(storage.get_kyber_pre_key(one_time_id).await?.is_none());
        let kept = storage.get_kyber_pre_key(last_resort_id).await?;
        assert!(kept.is_some_and(|stored| stored.last_resort));
        assert!(storage.kyber_pre_key_was_used(one_time_id).await);
        assert!(storage.kyber_pre_key_was_used(last_resort_id).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_clear_sender_key_shared_with() -> Result<(), Box<dyn std::error::Error>> {
        let storage = MemoryStorage::new();
        let alice = test_address("alice")?;
        let bob = test_address("bob")?;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        storage
            .mark_sender_key_shared_with(first, &[alice.clone(), bob.clone()])
            .await;
        storage
            .mark_sender_key_shared_with(second, &[bob.clone()])
            .await;

        storage
            .clear_sender_key_shared_with(std::slice::from_ref(&bob))
            .await?;

        assert_eq!(storage.sender_key_shared_with(first).await, vec![alice]);
        assert!(storage.sender_key_shared_with(second).await.is_empty());

        Ok(())
    }
}
