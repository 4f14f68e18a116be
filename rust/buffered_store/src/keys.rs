//! Key material for tests
//!
//! Generates real libsignal identities, pre-keys and sessions so the buffered
//! stores are exercised with the same record types the ratchet produces.

use crate::account_store::LocalAccount;
use crate::memory_storage::MemoryStorage;
use libsignal_protocol::*;
use std::time::SystemTime;
use uuid::Uuid;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

pub fn test_address(name: &str) -> TestResult<ProtocolAddress> {
    Ok(ProtocolAddress::new(name.to_string(), DeviceId::new(1)?))
}

fn now_millis() -> TestResult<u64> {
    Ok(SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_millis() as u64)
}

pub fn generate_identity_key_pair() -> IdentityKeyPair {
    let mut rng = rand::rng();
    IdentityKeyPair::generate(&mut rng)
}

/// Local identity with a fresh key pair and registration id 1234.
pub fn test_account(service_id: &str) -> LocalAccount {
    LocalAccount::new(service_id, generate_identity_key_pair(), 1234)
}

pub fn generate_pre_key(id: u32) -> TestResult<(PreKeyId, PreKeyRecord)> {
    let mut rng = rand::rng();
    let key_pair = KeyPair::generate(&mut rng);
    Ok((id.into(), PreKeyRecord::new(id.into(), &key_pair)))
}

/// Generates a signed prekey with timestamp and signature
pub fn generate_signed_pre_key(
    identity_key_pair: &IdentityKeyPair,
    signed_pre_key_id: u32,
) -> TestResult<SignedPreKeyRecord> {
    let mut rng = rand::rng();
    let timestamp = Timestamp::from_epoch_millis(now_millis()?);
    let key_pair = KeyPair::generate(&mut rng);
    let signature = identity_key_pair
        .private_key()
        .calculate_signature(&key_pair.public_key.serialize(), &mut rng)?;

    Ok(SignedPreKeyRecord::new(
        signed_pre_key_id.into(),
        timestamp,
        &key_pair,
        &signature,
    ))
}

/// Kyber pre-key signed by a throwaway identity, for tests that only care
/// about storage.
pub fn generate_kyber_pre_key(id: u32) -> TestResult<(KyberPreKeyId, KyberPreKeyRecord)> {
    let (record, _, _) = signed_kyber_pre_key(&generate_identity_key_pair(), id)?;
    Ok((KyberPreKeyId::from(id), record))
}

fn signed_kyber_pre_key(
    identity_key_pair: &IdentityKeyPair,
    id: u32,
) -> TestResult<(KyberPreKeyRecord, kem::PublicKey, Vec<u8>)> {
    let mut rng = rand::rng();
    let kyber_keypair = kem::KeyPair::generate(kem::KeyType::Kyber1024, &mut rng);
    let kyber_signature = identity_key_pair
        .private_key()
        .calculate_signature(&kyber_keypair.public_key.serialize(), &mut rng)?;

    let record = KyberPreKeyRecord::new(
        KyberPreKeyId::from(id),
        Timestamp::from_epoch_millis(now_millis()?),
        &kyber_keypair,
        &kyber_signature,
    );
    Ok((record, kyber_keypair.public_key, kyber_signature.to_vec()))
}

/// Sender key record produced by libsignal for a fresh distribution.
pub async fn generate_sender_key_record(
    sender: &ProtocolAddress,
    distribution_id: Uuid,
) -> TestResult<SenderKeyRecord> {
    let mut rng = rand::rng();
    let mut scratch = InMemSenderKeyStore::new();
    create_sender_key_distribution_message(sender, distribution_id, &mut scratch, &mut rng)
        .await?;
    scratch
        .load_sender_key(sender, distribution_id)
        .await?
        .ok_or_else(|| Box::<dyn std::error::Error>::from("sender key was not created"))
}

/// Everything a peer publishes or keeps locally to receive a first message.
pub struct PeerKeys {
    pub identity: IdentityKeyPair,
    pub registration_id: u32,
    pub pre_key_id: PreKeyId,
    pub pre_key: PreKeyRecord,
    pub signed_pre_key: SignedPreKeyRecord,
    pub kyber_pre_key_id: KyberPreKeyId,
    pub kyber_pre_key: KyberPreKeyRecord,
    kyber_public: kem::PublicKey,
    kyber_signature: Vec<u8>,
}

impl PeerKeys {
    pub fn generate(registration_id: u32) -> TestResult<Self> {
        let identity = generate_identity_key_pair();
        let (pre_key_id, pre_key) = generate_pre_key(1)?;
        let signed_pre_key = generate_signed_pre_key(&identity, 1)?;
        let (kyber_pre_key, kyber_public, kyber_signature) = signed_kyber_pre_key(&identity, 1)?;

        Ok(Self {
            identity,
            registration_id,
            pre_key_id,
            pre_key,
            signed_pre_key,
            kyber_pre_key_id: KyberPreKeyId::from(1u32),
            kyber_pre_key,
            kyber_public,
            kyber_signature,
        })
    }

    pub fn bundle(&self, device_id: DeviceId) -> TestResult<PreKeyBundle> {
        Ok(PreKeyBundle::new(
            self.registration_id,
            device_id,
            Some((self.pre_key_id, self.pre_key.public_key()?)),
            self.signed_pre_key.id()?,
            self.signed_pre_key.public_key()?,
            self.signed_pre_key.signature()?.to_vec(),
            self.kyber_pre_key_id,
            self.kyber_public.clone(),
            self.kyber_signature.clone(),
            *self.identity.identity_key(),
        )?)
    }

    /// Writes the private halves into a durable store, as registration would.
    pub async fn seed(&self, storage: &MemoryStorage, kyber_last_resort: bool) {
        storage.save_pre_key(self.pre_key_id, &self.pre_key).await;
        if let Ok(id) = self.signed_pre_key.id() {
            storage.save_signed_pre_key(id, &self.signed_pre_key).await;
        }
        storage
            .save_kyber_pre_key(self.kyber_pre_key_id, &self.kyber_pre_key, kyber_last_resort)
            .await;
    }
}

/// A session with `address` as seen by a brand-new local identity that just
/// processed the peer's bundle. Every call yields a different record.
pub async fn established_session(address: &ProtocolAddress) -> TestResult<SessionRecord> {
    let mut rng = rand::rng();
    let peer = PeerKeys::generate(4242)?;
    let mut session_store = InMemSessionStore::new();
    let mut identity_store = InMemIdentityKeyStore::new(generate_identity_key_pair(), 1);

    process_prekey_bundle(
        address,
        &mut session_store,
        &mut identity_store,
        &peer.bundle(address.device_id())?,
        SystemTime::now(),
        &mut rng,
        UsePQRatchet::Yes,
    )
    .await?;

    session_store
        .load_session(address)
        .await?
        .ok_or_else(|| Box::<dyn std::error::Error>::from("session was not established"))
}

pub fn serialized(record: &SessionRecord) -> TestResult<Vec<u8>> {
    Ok(record.serialize()?)
}
