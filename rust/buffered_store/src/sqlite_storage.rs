//! SQLite durable storage
//!
//! This module provides a SQLite-backed implementation of the durable store
//! traits. One database can hold the keys of several local identities: every
//! row carries the `account_id` of the identity it belongs to, and two
//! `SqliteStorage` handles can share one connection through
//! `with_connection`.

use crate::address_key;
use crate::durable_trait::*;
use crate::error::StoreError;
use async_trait::async_trait;
use libsignal_protocol::{
    DeviceId, GenericSignedPreKey, IdentityKey, KyberPreKeyId, KyberPreKeyRecord, PreKeyId,
    PreKeyRecord, ProtocolAddress, SenderKeyRecord, SessionRecord, SignedPreKeyId,
    SignedPreKeyRecord,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_VERSION: i32 = 1;

/// Addresses per batched session query; two bound parameters each.
const SESSION_BATCH_SIZE: usize = 200;

pub struct SqliteStorage {
    connection: Arc<Mutex<Connection>>,
    account_id: String,
}

impl SqliteStorage {
    pub fn open(db_path: &str, account_id: &str) -> Result<Self, StoreError> {
        let connection = Arc::new(Mutex::new(Connection::open(db_path)?));
        Ok(Self::with_connection(connection, account_id))
    }

    pub fn with_connection(connection: Arc<Mutex<Connection>>, account_id: &str) -> Self {
        Self {
            connection,
            account_id: account_id.to_string(),
        }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.connection.clone()
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.connection
            .lock()
            .map_err(|_| StoreError::Storage("SQLite connection lock poisoned".to_string()))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_info (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_info (id, version) VALUES (1, ?1)",
            [SCHEMA_VERSION],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS identity_keys (
                account_id TEXT NOT NULL,
                address TEXT NOT NULL,
                device_id INTEGER NOT NULL,
                public_key BLOB NOT NULL,
                last_seen INTEGER DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (account_id, address, device_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                account_id TEXT NOT NULL,
                address TEXT NOT NULL,
                device_id INTEGER NOT NULL,
                session_data BLOB NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (account_id, address, device_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sender_keys (
                account_id TEXT NOT NULL,
                address TEXT NOT NULL,
                device_id INTEGER NOT NULL,
                distribution_id TEXT NOT NULL,
                record BLOB NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (account_id, address, device_id, distribution_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sender_key_shared (
                account_id TEXT NOT NULL,
                distribution_id TEXT NOT NULL,
                address TEXT NOT NULL,
                device_id INTEGER NOT NULL,
                PRIMARY KEY (account_id, distribution_id, address, device_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pre_keys (
                account_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                key_data BLOB NOT NULL,
                PRIMARY KEY (account_id, id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS signed_pre_keys (
                account_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                key_data BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kyber_pre_keys (
                account_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                key_data BLOB NOT NULL,
                is_last_resort BOOLEAN NOT NULL DEFAULT FALSE,
                used_at INTEGER,
                PRIMARY KEY (account_id, id)
            )",
            [],
        )?;

        Ok(())
    }

    pub fn get_schema_version(&self) -> Result<i32, StoreError> {
        let conn = self.lock()?;
        let version: i32 =
            conn.query_row("SELECT version FROM schema_info WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(version)
    }

    // Registration-side writes that never pass through a buffered store.

    pub fn save_pre_key(&self, id: PreKeyId, record: &PreKeyRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO pre_keys (account_id, id, key_data) VALUES (?1, ?2, ?3)",
            params![self.account_id, u32::from(id), record.serialize()?],
        )?;
        Ok(())
    }

    pub fn save_signed_pre_key(
        &self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), StoreError> {
        let created_at = record.timestamp()?.epoch_millis() / 1000;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO signed_pre_keys (account_id, id, key_data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                self.account_id,
                u32::from(id),
                record.serialize()?,
                created_at as i64
            ],
        )?;
        Ok(())
    }

    pub fn save_kyber_pre_key(
        &self,
        id: KyberPreKeyId,
        record: &KyberPreKeyRecord,
        last_resort: bool,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kyber_pre_keys (account_id, id, key_data, is_last_resort, used_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![self.account_id, u32::from(id), record.serialize()?, last_resort],
        )?;
        Ok(())
    }

    pub fn mark_sender_key_shared_with(
        &self,
        distribution_id: Uuid,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        for address in addresses {
            conn.execute(
                "INSERT OR IGNORE INTO sender_key_shared (account_id, distribution_id, address, device_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    self.account_id,
                    distribution_id.to_string(),
                    address.name(),
                    u32::from(address.device_id())
                ],
            )?;
        }
        Ok(())
    }

    pub fn sender_key_shared_with(
        &self,
        distribution_id: Uuid,
    ) -> Result<Vec<ProtocolAddress>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT address, device_id FROM sender_key_shared
             WHERE account_id = ?1 AND distribution_id = ?2
             ORDER BY address, device_id",
        )?;
        let rows = stmt
            .query_map(params![self.account_id, distribution_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, device_id)| protocol_address(name, device_id))
            .collect()
    }

    fn count(&self, table: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE account_id = ?1"),
            [&self.account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn identity_count(&self) -> Result<usize, StoreError> {
        self.count("identity_keys")
    }

    pub fn session_count(&self) -> Result<usize, StoreError> {
        self.count("sessions")
    }

    pub fn pre_key_count(&self) -> Result<usize, StoreError> {
        self.count("pre_keys")
    }

    pub fn signed_pre_key_count(&self) -> Result<usize, StoreError> {
        self.count("signed_pre_keys")
    }

    pub fn kyber_pre_key_count(&self) -> Result<usize, StoreError> {
        self.count("kyber_pre_keys")
    }
}

fn protocol_address(name: String, device_id: u32) -> Result<ProtocolAddress, StoreError> {
    let device_id = u8::try_from(device_id)
        .ok()
        .and_then(|id| DeviceId::new(id).ok())
        .ok_or_else(|| StoreError::Storage(format!("Invalid device ID {device_id}")))?;
    Ok(ProtocolAddress::new(name, device_id))
}

fn stored_kyber_pre_key(
    id: u32,
    key_data: &[u8],
    last_resort: bool,
) -> Result<StoredKyberPreKey, StoreError> {
    Ok(StoredKyberPreKey {
        id: KyberPreKeyId::from(id),
        record: KyberPreKeyRecord::deserialize(key_data)?,
        last_resort,
    })
}

#[async_trait(?Send)]
impl DurableIdentityStore for SqliteStorage {
    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, StoreError> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT public_key FROM identity_keys
             WHERE account_id = ?1 AND address = ?2 AND device_id = ?3",
            params![
                self.account_id,
                address.name(),
                u32::from(address.device_id())
            ],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match result {
            Ok(key_data) => Ok(Some(IdentityKey::try_from(&key_data[..])?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &IdentityKey,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO identity_keys (account_id, address, device_id, public_key, last_seen)
             VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))",
            params![
                self.account_id,
                address.name(),
                u32::from(address.device_id()),
                identity_key.serialize().as_ref()
            ],
        )?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurableSessionStore for SqliteStorage {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT session_data FROM sessions
             WHERE account_id = ?1 AND address = ?2 AND device_id = ?3",
            params![
                self.account_id,
                address.name(),
                u32::from(address.device_id())
            ],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match result {
            Ok(data) => Ok(Some(SessionRecord::deserialize(&data)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_sessions(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<Vec<Option<SessionRecord>>, StoreError> {
        let conn = self.lock()?;
        let mut found: HashMap<String, SessionRecord> = HashMap::new();

        for chunk in addresses.chunks(SESSION_BATCH_SIZE) {
            let placeholders = vec!["(?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT address, device_id, session_data FROM sessions
                 WHERE account_id = ? AND (address, device_id) IN (VALUES {placeholders})"
            );

            let mut values = Vec::with_capacity(1 + chunk.len() * 2);
            values.push(Value::Text(self.account_id.clone()));
            for address in chunk {
                values.push(Value::Text(address.name().to_string()));
                values.push(Value::Integer(i64::from(u32::from(address.device_id()))));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (name, device_id, data) in rows {
                found.insert(format!("{name}:{device_id}"), SessionRecord::deserialize(&data)?);
            }
        }

        Ok(addresses
            .iter()
            .map(|address| found.get(&address_key(address)).cloned())
            .collect())
    }

    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let serialized = record.serialize()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO sessions (account_id, address, device_id, session_data, updated_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))",
            params![
                self.account_id,
                address.name(),
                u32::from(address.device_id()),
                serialized
            ],
        )?;
        Ok(())
    }

    async fn delete_session(&self, address: &ProtocolAddress) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sessions WHERE account_id = ?1 AND address = ?2 AND device_id = ?3",
            params![
                self.account_id,
                address.name(),
                u32::from(address.device_id())
            ],
        )?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurableSenderKeyStore for SqliteStorage {
    async fn load_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, StoreError> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT record FROM sender_keys
             WHERE account_id = ?1 AND address = ?2 AND device_id = ?3 AND distribution_id = ?4",
            params![
                self.account_id,
                sender.name(),
                u32::from(sender.device_id()),
                distribution_id.to_string()
            ],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match result {
            Ok(data) => Ok(Some(SenderKeyRecord::deserialize(&data)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError> {
        let serialized = record.serialize()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO sender_keys (account_id, address, device_id, distribution_id, record, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, strftime('%s', 'now'))",
            params![
                self.account_id,
                sender.name(),
                u32::from(sender.device_id()),
                distribution_id.to_string(),
                serialized
            ],
        )?;
        Ok(())
    }

    async fn clear_sender_key_shared_with(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for address in addresses {
            tx.execute(
                "DELETE FROM sender_key_shared WHERE account_id = ?1 AND address = ?2 AND device_id = ?3",
                params![
                    self.account_id,
                    address.name(),
                    u32::from(address.device_id())
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurablePreKeyStore for SqliteStorage {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<Option<PreKeyRecord>, StoreError> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT key_data FROM pre_keys WHERE account_id = ?1 AND id = ?2",
            params![self.account_id, u32::from(id)],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match result {
            Ok(data) => Ok(Some(PreKeyRecord::deserialize(&data)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_pre_key(&self, id: PreKeyId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pre_keys WHERE account_id = ?1 AND id = ?2",
            params![self.account_id, u32::from(id)],
        )?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurableSignedPreKeyStore for SqliteStorage {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT key_data FROM signed_pre_keys WHERE account_id = ?1 AND id = ?2",
            params![self.account_id, u32::from(id)],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match result {
            Ok(data) => Ok(Some(SignedPreKeyRecord::deserialize(&data)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_all_signed_pre_keys(&self) -> Result<Vec<SignedPreKeyRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key_data FROM signed_pre_keys WHERE account_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([&self.account_id], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|data| Ok(SignedPreKeyRecord::deserialize(data)?))
            .collect()
    }

    async fn remove_signed_pre_key(&self, id: SignedPreKeyId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM signed_pre_keys WHERE account_id = ?1 AND id = ?2",
            params![self.account_id, u32::from(id)],
        )?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl DurableKyberPreKeyStore for SqliteStorage {
    async fn get_kyber_pre_key(
        &self,
        id: KyberPreKeyId,
    ) -> Result<Option<StoredKyberPreKey>, StoreError> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT key_data, is_last_resort FROM kyber_pre_keys WHERE account_id = ?1 AND id = ?2",
            params![self.account_id, u32::from(id)],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, bool>(1)?)),
        );

        match result {
            Ok((data, last_resort)) => Ok(Some(stored_kyber_pre_key(
                u32::from(id),
                &data,
                last_resort,
            )?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_all_kyber_pre_keys(&self) -> Result<Vec<StoredKyberPreKey>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, key_data, is_last_resort FROM kyber_pre_keys WHERE account_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([&self.account_id], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|(id, data, last_resort)| stored_kyber_pre_key(*id, data, *last_resort))
            .collect()
    }

    async fn mark_kyber_pre_key_used(&self, id: KyberPreKeyId) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE kyber_pre_keys SET used_at = strftime('%s', 'now')
             WHERE account_id = ?1 AND id = ?2 AND is_last_resort",
            params![self.account_id, u32::from(id)],
        )?;
        tx.execute(
            "DELETE FROM kyber_pre_keys WHERE account_id = ?1 AND id = ?2 AND NOT is_last_resort",
            params![self.account_id, u32::from(id)],
        )?;
        tx.commit()?;
        Ok(())
    }
}
