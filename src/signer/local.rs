//! In-process P-256 keys for development and tests.
//!
//! Keys are generated on first use and live as long as the manager, so every
//! restart publishes a fresh JWKS.

use super::{KeyManager, Signer};
use anyhow::Result;
use async_trait::async_trait;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey, signature::Signer as _};
use rand::rngs::OsRng;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

struct LocalSigner {
    key_id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

#[async_trait]
impl Signer for LocalSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn public_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature> {
        Ok(self.signing_key.sign(message))
    }
}

#[derive(Default)]
pub struct LocalKeyManager {
    keys: Mutex<HashMap<String, Arc<LocalSigner>>>,
}

impl LocalKeyManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyManager for LocalKeyManager {
    async fn new_signer(&self, key_id: &str) -> Result<Arc<dyn Signer>> {
        let mut keys = self.keys.lock().await;
        let signer: Arc<dyn Signer> = keys
            .entry(key_id.to_string())
            .or_insert_with(|| {
                let signing_key = SigningKey::random(&mut OsRng);
                let verifying_key = VerifyingKey::from(&signing_key);
                Arc::new(LocalSigner {
                    key_id: key_id.to_string(),
                    signing_key,
                    verifying_key,
                })
            })
            .clone();
        Ok(signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;

    #[tokio::test]
    async fn same_key_id_same_key() -> Result<()> {
        let manager = LocalKeyManager::new();
        let a = manager.new_signer("k").await?;
        let b = manager.new_signer("k").await?;
        let c = manager.new_signer("other").await?;
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());

        let signature = a.sign(b"payload").await?;
        assert!(b.public_key().verify(b"payload", &signature).is_ok());
        Ok(())
    }
}
