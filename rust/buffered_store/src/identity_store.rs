//! Buffered identity key storage
//!
//! Remote identity keys are read through from the durable store once per
//! batch and changes are held until `flush_to_disk`.

use crate::account_store::LocalAccount;
use crate::address_key;
use crate::durable_trait::DurableIdentityStore;
use crate::error::StoreError;
use async_trait::async_trait;
use libsignal_protocol::{
    Direction, IdentityChange, IdentityKey, IdentityKeyPair, IdentityKeyStore, ProtocolAddress,
    SignalProtocolError,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct IdentityCache {
    known: HashMap<String, IdentityKey>,
    missing: HashSet<String>,
    updated: HashMap<String, (ProtocolAddress, IdentityKey)>,
}

impl IdentityCache {
    async fn lookup<D: DurableIdentityStore>(
        &mut self,
        durable: &D,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, StoreError> {
        let key = address_key(address);
        if let Some(identity) = self.known.get(&key) {
            return Ok(Some(*identity));
        }
        if self.missing.contains(&key) {
            return Ok(None);
        }

        let loaded = durable.get_identity(address).await?;
        match loaded {
            Some(identity) => {
                self.known.insert(key, identity);
            }
            None => {
                self.missing.insert(key);
            }
        }
        Ok(loaded)
    }
}

enum SavedIdentity {
    Unchanged,
    New,
    Replaced,
}

pub struct BufferedIdentityStore<D> {
    service_id: String,
    identity_key_pair: IdentityKeyPair,
    registration_id: u32,
    durable: Arc<D>,
    cache: Mutex<IdentityCache>,
}

impl<D: DurableIdentityStore> BufferedIdentityStore<D> {
    pub fn new(account: &LocalAccount, durable: Arc<D>) -> Self {
        Self {
            service_id: account.service_id.clone(),
            identity_key_pair: account.identity_key_pair.clone(),
            registration_id: account.registration_id,
            durable,
            cache: Mutex::new(IdentityCache::default()),
        }
    }

    pub fn identity_key_pair(&self) -> IdentityKeyPair {
        self.identity_key_pair.clone()
    }

    pub fn local_registration_id(&self) -> u32 {
        self.registration_id
    }

    fn is_self(&self, address: &ProtocolAddress) -> bool {
        address.name() == self.service_id
    }

    pub async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, StoreError> {
        let mut cache = self.cache.lock().await;
        cache.lookup(self.durable.as_ref(), address).await
    }

    /// Returns `true` when the key differs from the one previously known
    /// (or none was known), `false` when it is unchanged.
    pub async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<bool, StoreError> {
        let saved = self.record_identity(address, identity_key).await?;
        Ok(!matches!(saved, SavedIdentity::Unchanged))
    }

    async fn record_identity(
        &mut self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<SavedIdentity, StoreError> {
        let cache = self.cache.get_mut();
        let previous = cache.lookup(self.durable.as_ref(), address).await?;
        if previous.as_ref() == Some(identity_key) {
            return Ok(SavedIdentity::Unchanged);
        }

        let key = address_key(address);
        cache.missing.remove(&key);
        cache.known.insert(key.clone(), *identity_key);
        cache.updated.insert(key, (address.clone(), *identity_key));

        Ok(match previous {
            Some(_) => SavedIdentity::Replaced,
            None => SavedIdentity::New,
        })
    }

    /// The self address is only trusted with our own key. Any other address
    /// is trusted when receiving; sending is never done from a buffered store.
    pub async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, StoreError> {
        if self.is_self(address) {
            return Ok(identity_key == self.identity_key_pair.identity_key());
        }

        match direction {
            Direction::Receiving => Ok(true),
            Direction::Sending => Err(StoreError::unsupported("is_trusted_identity(Sending)")),
        }
    }

    pub async fn flush_to_disk(&mut self, durable: &D) -> Result<(), StoreError> {
        let cache = self.cache.get_mut();
        let writes = cache.updated.len();

        let pending: Vec<String> = cache.updated.keys().cloned().collect();
        for key in pending {
            if let Some((address, identity_key)) = cache.updated.get(&key) {
                durable.save_identity(address, identity_key).await?;
            }
            cache.updated.remove(&key);
        }

        tracing::debug!(store = "identity", writes, "flushed buffered store");
        Ok(())
    }
}

#[async_trait(?Send)]
impl<D: DurableIdentityStore> IdentityKeyStore for BufferedIdentityStore<D> {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        Ok(self.identity_key_pair())
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        Ok(self.local_registration_id())
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<IdentityChange, SignalProtocolError> {
        match self.record_identity(address, identity_key).await? {
            SavedIdentity::Replaced => Ok(IdentityChange::ReplacedExisting),
            SavedIdentity::New | SavedIdentity::Unchanged => Ok(IdentityChange::NewOrUnchanged),
        }
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
        direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        Ok(Self::is_trusted_identity(self, address, identity_key, direction).await?)
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        Ok(Self::get_identity(self, address).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_identity_key_pair, test_account, test_address};
    use crate::memory_storage::MemoryStorage;

    fn new_store(storage: &Arc<MemoryStorage>) -> BufferedIdentityStore<MemoryStorage> {
        BufferedIdentityStore::new(&test_account("self-aci"), Arc::clone(storage))
    }

    #[tokio::test]
    async fn test_get_identity_reads_through_once() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let bob = test_address("bob")?;
        let carol = test_address("carol")?;
        let bob_key = *generate_identity_key_pair().identity_key();
        DurableIdentityStore::save_identity(storage.as_ref(), &bob, &bob_key).await?;
        storage.reset_counters();

        let store = new_store(&storage);
        assert_eq!(store.get_identity(&bob).await?, Some(bob_key));
        assert_eq!(store.get_identity(&bob).await?, Some(bob_key));
        assert_eq!(store.get_identity(&carol).await?, None);
        assert_eq!(store.get_identity(&carol).await?, None);

        assert_eq!(storage.read_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_save_identity_reports_changes() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = new_store(&storage);
        let bob = test_address("bob")?;
        let first = *generate_identity_key_pair().identity_key();
        let second = *generate_identity_key_pair().identity_key();

        assert!(store.save_identity(&bob, &first).await?);
        assert!(!store.save_identity(&bob, &first).await?);
        assert!(store.save_identity(&bob, &second).await?);
        assert_eq!(storage.write_count(), 0);

        store.flush_to_disk(&storage).await?;
        assert_eq!(storage.write_count(), 1);
        assert_eq!(
            DurableIdentityStore::get_identity(storage.as_ref(), &bob).await?,
            Some(second)
        );

        store.flush_to_disk(&storage).await?;
        assert_eq!(storage.write_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_durable_identity_is_not_rewritten(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let bob = test_address("bob")?;
        let bob_key = *generate_identity_key_pair().identity_key();
        DurableIdentityStore::save_identity(storage.as_ref(), &bob, &bob_key).await?;
        storage.reset_counters();

        let mut store = new_store(&storage);
        assert!(!store.save_identity(&bob, &bob_key).await?);
        store.flush_to_disk(&storage).await?;

        assert_eq!(storage.write_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_your_writes_without_durable() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = new_store(&storage);
        let bob = test_address("bob")?;
        let bob_key = *generate_identity_key_pair().identity_key();

        store.save_identity(&bob, &bob_key).await?;
        storage.fail_reads(true);

        assert_eq!(store.get_identity(&bob).await?, Some(bob_key));
        Ok(())
    }

    #[tokio::test]
    async fn test_self_identity_trust() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let store = new_store(&storage);
        let self_address = test_address("self-aci")?;
        let own_key = *store.identity_key_pair().identity_key();
        let other_key = *generate_identity_key_pair().identity_key();

        assert!(
            store
                .is_trusted_identity(&self_address, &own_key, Direction::Receiving)
                .await?
        );
        assert!(
            !store
                .is_trusted_identity(&self_address, &other_key, Direction::Receiving)
                .await?
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_trust_by_direction() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let store = new_store(&storage);
        let bob = test_address("bob")?;
        let bob_key = *generate_identity_key_pair().identity_key();

        assert!(
            store
                .is_trusted_identity(&bob, &bob_key, Direction::Receiving)
                .await?
        );
        let result = store
            .is_trusted_identity(&bob, &bob_key, Direction::Sending)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::UnsupportedInBufferedMode { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_identity_change_through_libsignal_trait(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = new_store(&storage);
        let bob = test_address("bob")?;
        let first = *generate_identity_key_pair().identity_key();
        let second = *generate_identity_key_pair().identity_key();

        let change = IdentityKeyStore::save_identity(&mut store, &bob, &first).await?;
        assert!(matches!(change, IdentityChange::NewOrUnchanged));
        let change = IdentityKeyStore::save_identity(&mut store, &bob, &second).await?;
        assert!(matches!(change, IdentityChange::ReplacedExisting));

        assert_eq!(IdentityKeyStore::get_local_registration_id(&store).await?, 1234);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_pending() -> Result<(), Box<dyn std::error::Error>> {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = new_store(&storage);
        let bob = test_address("bob")?;
        let bob_key = *generate_identity_key_pair().identity_key();
        store.save_identity(&bob, &bob_key).await?;

        storage.fail_writes(true);
        assert!(store.flush_to_disk(&storage).await.is_err());
        assert_eq!(storage.identity_count().await, 0);

        storage.fail_writes(false);
        store.flush_to_disk(&storage).await?;
        assert_eq!(storage.identity_count().await, 1);
        Ok(())
    }
}
