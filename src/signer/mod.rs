//! Signing capability used for verification tokens and certificates.
//!
//! A [`KeyManager`] turns a key id into a [`Signer`]. Handles are cached for a
//! bounded time: [`SigningKeyHandle`] for the system keys and [`SignerCache`]
//! per realm for realms with their own certificate key.

pub mod jwt;
mod local;
mod transit;

pub use local::LocalKeyManager;
pub use transit::VaultKeyManager;

use anyhow::Result;
use async_trait::async_trait;
use p256::ecdsa::{Signature, VerifyingKey};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait Signer: Send + Sync {
    fn key_id(&self) -> &str;

    fn public_key(&self) -> &VerifyingKey;

    /// ECDSA P-256 over SHA-256 of `message`.
    async fn sign(&self, message: &[u8]) -> Result<Signature>;
}

#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn new_signer(&self, key_id: &str) -> Result<Arc<dyn Signer>>;
}

#[derive(Clone)]
struct Cached {
    key_id: String,
    signer: Arc<dyn Signer>,
    fetched_at: Instant,
}

impl Cached {
    fn is_fresh(&self, key_id: &str, ttl: Duration) -> bool {
        self.key_id == key_id && self.fetched_at.elapsed() < ttl
    }
}

/// One cached signer for a fixed key id.
pub struct SigningKeyHandle {
    manager: Arc<dyn KeyManager>,
    key_id: String,
    ttl: Duration,
    cached: RwLock<Option<Cached>>,
}

impl SigningKeyHandle {
    #[must_use]
    pub fn new(manager: Arc<dyn KeyManager>, key_id: String, ttl: Duration) -> Self {
        Self {
            manager,
            key_id,
            ttl,
            cached: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// # Errors
    /// Returns an error if the key manager cannot produce a signer.
    pub async fn get(&self) -> Result<Arc<dyn Signer>> {
        if let Some(cached) = self.cached.read().await.as_ref()
            && cached.is_fresh(&self.key_id, self.ttl)
        {
            return Ok(cached.signer.clone());
        }

        let mut slot = self.cached.write().await;
        if let Some(cached) = slot.as_ref()
            && cached.is_fresh(&self.key_id, self.ttl)
        {
            return Ok(cached.signer.clone());
        }

        debug!(key_id = %self.key_id, "loading signer");
        let signer = self.manager.new_signer(&self.key_id).await?;
        *slot = Some(Cached {
            key_id: self.key_id.clone(),
            signer: signer.clone(),
            fetched_at: Instant::now(),
        });
        Ok(signer)
    }
}

/// Signers keyed by realm id. An entry is replaced when it ages out or the
/// realm's configured key id changes.
pub struct SignerCache {
    manager: Arc<dyn KeyManager>,
    ttl: Duration,
    entries: RwLock<HashMap<i64, Cached>>,
}

impl SignerCache {
    #[must_use]
    pub fn new(manager: Arc<dyn KeyManager>, ttl: Duration) -> Self {
        Self {
            manager,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// # Errors
    /// Returns an error if the key manager cannot produce a signer.
    pub async fn get(&self, realm_id: i64, key_id: &str) -> Result<Arc<dyn Signer>> {
        if let Some(cached) = self.entries.read().await.get(&realm_id)
            && cached.is_fresh(key_id, self.ttl)
        {
            return Ok(cached.signer.clone());
        }

        let signer = self.manager.new_signer(key_id).await?;
        debug!(realm_id, key_id, "cached realm signer");
        let mut entries = self.entries.write().await;
        entries.retain(|_, cached| cached.fetched_at.elapsed() < self.ttl);
        entries.insert(
            realm_id,
            Cached {
                key_id: key_id.to_string(),
                signer: signer.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(signer)
    }
}
