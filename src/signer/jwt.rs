//! Compact ES256 JWS encoding over a [`Signer`].

use super::Signer;
use base64ct::{Base64UrlUnpadded, Encoding};
use p256::{
    ecdsa::{Signature, VerifyingKey, signature::Verifier},
    elliptic_curve::sec1::ToEncodedPoint,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use utoipa::ToSchema;

pub const ALG_ES256: &str = "ES256";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl Header {
    fn es256(kid: impl Into<String>) -> Self {
        Self {
            alg: ALG_ES256.to_string(),
            typ: "JWT".to_string(),
            kid: kid.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("signer failed: {0:#}")]
    Signer(anyhow::Error),
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: DeserializeOwned>(s: &str) -> Result<T, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| Error::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn split(token: &str) -> Result<(&str, &str, &str), Error> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(Error::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(Error::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(Error::TokenFormat)?;
    if parts.next().is_some() || header_b64.is_empty() || claims_b64.is_empty() {
        return Err(Error::TokenFormat);
    }
    Ok((header_b64, claims_b64, sig_b64))
}

/// Sign `claims` with the signer's current key.
///
/// # Errors
/// Returns an error if the claims cannot be encoded or the signer fails.
pub async fn sign_es256<T: Serialize + Sync>(
    signer: &dyn Signer,
    claims: &T,
) -> Result<String, Error> {
    let header = Header::es256(signer.key_id());
    let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(claims)?);
    let signature = signer
        .sign(signing_input.as_bytes())
        .await
        .map_err(Error::Signer)?;
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_bytes());
    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Read the header without checking the signature.
///
/// # Errors
/// Returns an error if the token is malformed.
pub fn decode_header(token: &str) -> Result<Header, Error> {
    let (header_b64, _, _) = split(token)?;
    b64d_json(header_b64)
}

/// Verify an ES256 token against `key` and return its claims.
///
/// Claim validation (issuer, audience, expiry) is left to the caller.
///
/// # Errors
/// Returns an error if the token is malformed, names another key, or the
/// signature does not verify.
pub fn verify_es256<T: DeserializeOwned>(
    token: &str,
    key: &VerifyingKey,
    expected_kid: &str,
) -> Result<T, Error> {
    let (header_b64, claims_b64, sig_b64) = split(token)?;

    let header: Header = b64d_json(header_b64)?;
    if header.alg != ALG_ES256 {
        return Err(Error::UnsupportedAlg(header.alg));
    }
    if header.kid != expected_kid {
        return Err(Error::UnknownKid(header.kid));
    }

    let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::Base64)?;
    let signature = Signature::from_slice(&signature_bytes).map_err(|_| Error::InvalidSignature)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| Error::InvalidSignature)?;

    b64d_json(claims_b64)
}

/// Public JSON Web Key for a P-256 verifying key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_: String,
}

impl Jwk {
    #[must_use]
    pub fn from_verifying_key(kid: &str, key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let x = point.x().map(|x| Base64UrlUnpadded::encode_string(x));
        let y = point.y().map(|y| Base64UrlUnpadded::encode_string(y));
        Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: x.unwrap_or_default(),
            y: y.unwrap_or_default(),
            kid: kid.to_string(),
            alg: ALG_ES256.to_string(),
            use_: "sig".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}
