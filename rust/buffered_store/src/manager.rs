//! Buffered stores for both local identities of a device
//!
//! A device holds a primary and a secondary protocol identity that share one
//! registration. One manager is created per decryption batch, every envelope
//! is routed to the façade of the identity it is addressed to, and the batch
//! ends with a single `flush_to_disk`.

use crate::account_store::{AccountDataStore, LocalAccount};
use crate::durable_trait::DurableProtocolStore;
use crate::error::StoreError;
use std::sync::Arc;

struct ManagedAccount<D> {
    durable: Arc<D>,
    store: AccountDataStore<D>,
}

impl<D: DurableProtocolStore> ManagedAccount<D> {
    fn new(account: LocalAccount, durable: Arc<D>) -> Self {
        let store = AccountDataStore::new(&account, Arc::clone(&durable));
        Self { durable, store }
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        let service_id = self.store.service_id().to_string();
        tracing::debug!(%service_id, "flushing buffered protocol store");

        if let Err(source) = self.store.flush_to_disk(&self.durable).await {
            tracing::warn!(%service_id, error = %source, "failed to flush buffered protocol store");
            return Err(StoreError::Flush {
                service_id,
                source: Box::new(source),
            });
        }

        tracing::debug!(%service_id, "flushed buffered protocol store");
        Ok(())
    }
}

pub struct ProtocolStoreManager<D> {
    primary: ManagedAccount<D>,
    secondary: ManagedAccount<D>,
}

impl<D: DurableProtocolStore> ProtocolStoreManager<D> {
    pub fn new(primary: (LocalAccount, Arc<D>), secondary: (LocalAccount, Arc<D>)) -> Self {
        Self {
            primary: ManagedAccount::new(primary.0, primary.1),
            secondary: ManagedAccount::new(secondary.0, secondary.1),
        }
    }

    pub fn get(&self, service_id: &str) -> Result<&AccountDataStore<D>, StoreError> {
        [&self.primary, &self.secondary]
            .into_iter()
            .find(|managed| managed.store.service_id() == service_id)
            .map(|managed| &managed.store)
            .ok_or_else(|| StoreError::UnknownIdentity(service_id.to_string()))
    }

    pub fn get_mut(&mut self, service_id: &str) -> Result<&mut AccountDataStore<D>, StoreError> {
        [&mut self.primary, &mut self.secondary]
            .into_iter()
            .find(|managed| managed.store.service_id() == service_id)
            .map(|managed| &mut managed.store)
            .ok_or_else(|| StoreError::UnknownIdentity(service_id.to_string()))
    }

    /// Sender key distribution messages are always processed by the primary
    /// identity.
    pub fn primary(&self) -> &AccountDataStore<D> {
        &self.primary.store
    }

    pub fn primary_mut(&mut self) -> &mut AccountDataStore<D> {
        &mut self.primary.store
    }

    /// Flushes the primary identity, then the secondary one, each into its own
    /// durable store. Not transactional across identities: when the secondary
    /// fails, the primary's changes stay committed.
    pub async fn flush_to_disk(&mut self) -> Result<(), StoreError> {
        self.primary.flush().await?;
        self.secondary.flush().await
    }
}
