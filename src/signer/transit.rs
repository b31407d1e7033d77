//! Signers backed by Vault transit `ecdsa-p256` keys. Private keys never
//! leave Vault; the public key is read once per handle.

use super::{KeyManager, Signer};
use crate::vault::transit::{fetch_ecdsa_keys, sign_ecdsa};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use p256::{
    ecdsa::{Signature, VerifyingKey},
    pkcs8::DecodePublicKey,
};
use reqwest::Client;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::instrument;

struct VaultSigner {
    client: Client,
    vault_url: String,
    vault_token: SecretString,
    transit_mount: String,
    key_id: String,
    key_version: u32,
    public_key: VerifyingKey,
}

#[async_trait]
impl Signer for VaultSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signature = sign_ecdsa(
            &self.client,
            &self.vault_url,
            &self.vault_token,
            &self.transit_mount,
            &self.key_id,
            self.key_version,
            message,
        )
        .await?;
        let raw = Base64UrlUnpadded::decode_vec(&signature.signature_base64)
            .map_err(|_| anyhow!("transit signature is not base64url"))?;
        Signature::from_slice(&raw).context("transit signature is not a P-256 r||s pair")
    }
}

pub struct VaultKeyManager {
    client: Client,
    vault_url: String,
    vault_token: SecretString,
    transit_mount: String,
}

impl VaultKeyManager {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(vault_url: String, vault_token: SecretString, transit_mount: String) -> Result<Self> {
        Ok(Self {
            client: crate::vault::client()?,
            vault_url,
            vault_token,
            transit_mount,
        })
    }
}

#[async_trait]
impl KeyManager for VaultKeyManager {
    #[instrument(skip(self))]
    async fn new_signer(&self, key_id: &str) -> Result<Arc<dyn Signer>> {
        let keys = fetch_ecdsa_keys(
            &self.client,
            &self.vault_url,
            &self.vault_token,
            &self.transit_mount,
            key_id,
        )
        .await?;
        let pem = keys
            .latest()
            .ok_or_else(|| anyhow!("transit key {key_id} has no public key for latest version"))?;
        let public_key = VerifyingKey::from_public_key_pem(pem)
            .map_err(|err| anyhow!("invalid public key for {key_id}: {err}"))?;

        Ok(Arc::new(VaultSigner {
            client: self.client.clone(),
            vault_url: self.vault_url.clone(),
            vault_token: self.vault_token.clone(),
            transit_mount: self.transit_mount.clone(),
            key_id: key_id.to_string(),
            key_version: keys.latest_version,
            public_key,
        }))
    }
}
