use crate::vault;
use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{error, instrument};

pub const KEY_TYPE_ECDSA_P256: &str = "ecdsa-p256";

#[derive(Debug, Clone)]
pub struct TransitKeySet {
    pub latest_version: u32,
    /// PEM encoded public keys by version.
    pub keys: BTreeMap<u32, String>,
}

impl TransitKeySet {
    #[must_use]
    pub fn latest(&self) -> Option<&str> {
        self.keys.get(&self.latest_version).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct VaultSignature {
    pub key_version: u32,
    pub signature_base64: String,
}

fn get_required_str<'a>(json_response: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = json_response;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str()
}

fn parse_key_version(version: u64) -> Result<u32> {
    u32::try_from(version).map_err(|_| anyhow!("invalid key version: {version}"))
}

/// Split a `vault:v<N>:<signature>` value.
pub(crate) fn parse_signature(signature: &str) -> Result<VaultSignature> {
    let mut parts = signature.split(':');
    let prefix = parts
        .next()
        .ok_or_else(|| anyhow!("invalid vault signature"))?;
    let version_part = parts
        .next()
        .ok_or_else(|| anyhow!("invalid vault signature"))?;
    let sig_b64 = parts
        .next()
        .ok_or_else(|| anyhow!("invalid vault signature"))?;
    if parts.next().is_some() {
        return Err(anyhow!("invalid vault signature"));
    }
    if prefix != "vault" {
        return Err(anyhow!("invalid vault signature prefix"));
    }
    let key_version = version_part
        .strip_prefix('v')
        .ok_or_else(|| anyhow!("invalid vault signature version"))?
        .parse::<u32>()
        .map_err(|_| anyhow!("invalid key version"))?;
    Ok(VaultSignature {
        key_version,
        signature_base64: sig_b64.to_string(),
    })
}

fn transit_path(mount: &str, suffix: &str) -> String {
    let mount = mount.trim_matches('/');
    format!("/v1/{mount}/{suffix}")
}

/// Fetch ECDSA P-256 public keys from Vault transit.
///
/// # Errors
/// Returns an error if the request fails, the key is not `ecdsa-p256`, or the
/// response has no public keys.
#[instrument(skip(client, vault_token))]
pub async fn fetch_ecdsa_keys(
    client: &Client,
    vault_url: &str,
    vault_token: &SecretString,
    transit_mount: &str,
    key_name: &str,
) -> Result<TransitKeySet> {
    let keys_url = vault::endpoint_url(
        vault_url,
        &transit_path(transit_mount, &format!("keys/{key_name}")),
    )?;

    let response = client
        .get(&keys_url)
        .header("X-Vault-Token", vault_token.expose_secret())
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let json_response: Value = response.json().await?;
        let error_message = vault::vault_error_message(&json_response);
        error!("Failed to fetch transit keys: {error_message}");
        return Err(anyhow!("{keys_url} - {status}, {error_message}"));
    }

    let json_response: Value = response.json().await?;
    let data = json_response
        .get("data")
        .ok_or_else(|| anyhow!("missing data in transit response"))?;

    let key_type = data.get("type").and_then(Value::as_str).unwrap_or("");
    if key_type != KEY_TYPE_ECDSA_P256 {
        return Err(anyhow!("unexpected transit key type: {key_type}"));
    }

    let latest_version = data
        .get("latest_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("missing latest_version in transit response"))?;
    let latest_version = parse_key_version(latest_version)?;

    let keys_obj = data
        .get("keys")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("missing keys in transit response"))?;

    let mut keys = BTreeMap::new();
    for (version_str, entry) in keys_obj {
        let version = version_str
            .parse::<u32>()
            .map_err(|_| anyhow!("invalid transit key version: {version_str}"))?;
        if let Some(public_key) = entry.get("public_key").and_then(Value::as_str) {
            keys.insert(version, public_key.to_string());
        }
    }

    if keys.is_empty() {
        return Err(anyhow!("no public keys found in transit response"));
    }

    Ok(TransitKeySet {
        latest_version,
        keys,
    })
}

/// Sign with a transit ECDSA key. The input is hashed by Vault with SHA-256
/// and the signature is returned as a raw `r || s` pair (JWS marshaling).
///
/// # Errors
/// Returns an error if the request fails or the signature is missing/invalid.
#[instrument(skip(client, vault_token, signing_input))]
pub async fn sign_ecdsa(
    client: &Client,
    vault_url: &str,
    vault_token: &SecretString,
    transit_mount: &str,
    key_name: &str,
    key_version: u32,
    signing_input: &[u8],
) -> Result<VaultSignature> {
    let sign_url = vault::endpoint_url(
        vault_url,
        &transit_path(transit_mount, &format!("sign/{key_name}")),
    )?;

    let payload = json!({
        "input": BASE64_STANDARD.encode(signing_input),
        "key_version": key_version,
        "hash_algorithm": "sha2-256",
        "marshaling_algorithm": "jws",
    });

    let response = client
        .post(&sign_url)
        .header("X-Vault-Token", vault_token.expose_secret())
        .json(&payload)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let json_response: Value = response.json().await?;
        let error_message = vault::vault_error_message(&json_response);
        error!("Failed to sign via transit: {error_message}");
        return Err(anyhow!("{sign_url} - {status}, {error_message}"));
    }

    let json_response: Value = response.json().await?;
    let signature = get_required_str(&json_response, &["data", "signature"]).ok_or_else(|| {
        error!("Missing signature in transit response");
        anyhow!("missing signature in transit response")
    })?;

    parse_signature(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parse_signature_accepts_vault_format() -> Result<()> {
        let sig = parse_signature("vault:v3:abc_-")?;
        assert_eq!(sig.key_version, 3);
        assert_eq!(sig.signature_base64, "abc_-");

        for bad in ["", "vault:v1", "other:v1:x", "vault:1:x", "vault:vx:x", "vault:v1:x:y"] {
            assert!(parse_signature(bad).is_err(), "{bad}");
        }
        Ok(())
    }

    #[test]
    fn transit_path_trims_mount() {
        assert_eq!(transit_path("/transit/enverify/", "keys/k"), "/v1/transit/enverify/keys/k");
    }

    #[tokio::test]
    async fn fetch_rejects_wrong_key_type() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transit/keys/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "type": "ed25519", "latest_version": 1, "keys": {} }
            })))
            .mount(&server)
            .await;

        let token = SecretString::from("vault-token".to_string());
        let result = fetch_ecdsa_keys(&Client::new(), &server.uri(), &token, "transit", "token").await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn fetch_reads_versions() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transit/keys/token"))
            .and(header("X-Vault-Token", "vault-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "type": "ecdsa-p256",
                    "latest_version": 2,
                    "keys": {
                        "1": { "public_key": "pem-1" },
                        "2": { "public_key": "pem-2" }
                    }
                }
            })))
            .mount(&server)
            .await;

        let token = SecretString::from("vault-token".to_string());
        let set = fetch_ecdsa_keys(&Client::new(), &server.uri(), &token, "transit", "token").await?;
        assert_eq!(set.latest_version, 2);
        assert_eq!(set.latest(), Some("pem-2"));
        assert_eq!(set.keys.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn sign_requests_jws_marshaling() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transit/sign/token"))
            .and(body_partial_json(json!({
                "input": BASE64_STANDARD.encode(b"payload"),
                "key_version": 2,
                "hash_algorithm": "sha2-256",
                "marshaling_algorithm": "jws"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "signature": "vault:v2:c2ln" }
            })))
            .mount(&server)
            .await;

        let token = SecretString::from("vault-token".to_string());
        let sig = sign_ecdsa(
            &Client::new(),
            &server.uri(),
            &token,
            "transit",
            "token",
            2,
            b"payload",
        )
        .await?;
        assert_eq!(sig.key_version, 2);
        assert_eq!(sig.signature_base64, "c2ln");
        Ok(())
    }
}
