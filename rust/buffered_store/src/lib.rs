//! Buffered write-back protocol stores
//!
//! Decrypting a batch of envelopes touches the same sessions, identities and
//! pre-keys over and over. The stores in this crate serve those reads from an
//! in-memory cache filled on first access and hold every write in memory
//! until the batch ends with one `flush_to_disk` per identity.
//!
//! `ProtocolStoreManager` owns the primary and secondary identity of a
//! device; `AccountDataStore` is the per-identity façade handed to
//! libsignal. Durable persistence sits behind the `Durable*Store` traits,
//! implemented here by `SqliteStorage` and the in-memory `MemoryStorage`.

mod account_store;
mod durable_trait;
mod error;
mod identity_store;
mod kyber_pre_key_store;
mod manager;
mod memory_storage;
mod pre_key_store;
mod sender_key_store;
mod session_store;
mod signed_pre_key_store;
mod sqlite_storage;
mod storage_trait;

#[cfg(test)]
mod keys;

pub use account_store::{AccountDataStore, LocalAccount};
pub use durable_trait::{
    DurableIdentityStore, DurableKyberPreKeyStore, DurablePreKeyStore, DurableProtocolStore,
    DurableSenderKeyStore, DurableSessionStore, DurableSignedPreKeyStore, StoredKyberPreKey,
};
pub use error::StoreError;
pub use identity_store::BufferedIdentityStore;
pub use kyber_pre_key_store::BufferedKyberPreKeyStore;
pub use manager::ProtocolStoreManager;
pub use memory_storage::MemoryStorage;
pub use pre_key_store::BufferedPreKeyStore;
pub use sender_key_store::BufferedSenderKeyStore;
pub use session_store::BufferedSessionStore;
pub use signed_pre_key_store::BufferedSignedPreKeyStore;
pub use sqlite_storage::SqliteStorage;
pub use storage_trait::{
    ExtendedKyberPreKeyStore, ExtendedPreKeyStore, ExtendedSenderKeyStore, ExtendedSessionStore,
    ExtendedSignedPreKeyStore,
};

use libsignal_protocol::ProtocolAddress;

/// Map key for per-address cache entries: `name:device`.
pub(crate) fn address_key(address: &ProtocolAddress) -> String {
    format!("{}:{}", address.name(), u32::from(address.device_id()))
}
