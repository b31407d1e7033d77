//! Keyed digests for values that must never be stored in the clear.
//!
//! Verification codes and API keys are looked up by their HMAC-SHA256 under a
//! server secret; quota buckets are keyed the same way so realm ids cannot be
//! guessed from the limiter store.

use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct KeyedDigest {
    mac: HmacSha256,
}

impl KeyedDigest {
    /// # Errors
    /// Returns an error if the secret is empty.
    pub fn new(secret: &SecretString) -> Result<Self> {
        let key = secret.expose_secret().as_bytes();
        if key.is_empty() {
            return Err(anyhow!("HMAC secret must not be empty"));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|err| anyhow!("invalid HMAC secret: {err}"))?;
        Ok(Self { mac })
    }

    /// URL-safe, unpadded base64 of `HMAC-SHA256(secret, value)`.
    #[must_use]
    pub fn digest(&self, value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for KeyedDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyedDigest(REDACTED)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_keyed() -> Result<()> {
        let a = KeyedDigest::new(&SecretString::from("secret-a".to_string()))?;
        let b = KeyedDigest::new(&SecretString::from("secret-b".to_string()))?;

        assert_eq!(a.digest("12345678"), a.digest("12345678"));
        assert_ne!(a.digest("12345678"), b.digest("12345678"));
        assert_ne!(a.digest("12345678"), a.digest("12345679"));
        // 32 byte MAC, base64url without padding
        assert_eq!(a.digest("x").len(), 43);
        Ok(())
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(KeyedDigest::new(&SecretString::from(String::new())).is_err());
    }
}
