//! Verification certificates.
//!
//! A certificate is an ES256 JWT handed to the key server together with the
//! diagnosis keys. It binds the report to `tekmac`, the caller's HMAC over
//! those keys, and carries dates as ten-minute interval numbers.

use crate::{
    config::ServiceConfig,
    error::VerifyError,
    realm::Realm,
    signer::{Signer, SignerCache, SigningKeyHandle, jwt},
    store::VerificationStore,
    token::TokenIssuer,
};
use anyhow::anyhow;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};

const HMAC_LENGTH: usize = 32;
const INTERVAL_SECONDS: i64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateClaims {
    pub report_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptom_onset_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_date_interval: Option<u32>,
    pub tekmac: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate: String,
    pub expires_at: DateTime<Utc>,
}

/// Ten-minute interval number of midnight UTC on `date`.
#[must_use]
pub fn interval_number(date: NaiveDate) -> Option<u32> {
    let midnight = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
    u32::try_from(midnight / INTERVAL_SECONDS).ok()
}

/// Validate `exposureKeyHMAC`: standard base64 of a 32 byte HMAC-SHA256.
///
/// # Errors
/// `HmacInvalid` otherwise.
pub fn decode_hmac(value: &str) -> Result<Vec<u8>, VerifyError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|_| VerifyError::HmacInvalid)?;
    if bytes.len() != HMAC_LENGTH {
        return Err(VerifyError::HmacInvalid);
    }
    Ok(bytes)
}

pub struct CertificateSigner {
    tokens: Arc<TokenIssuer>,
    store: Arc<dyn VerificationStore>,
    system: Arc<SigningKeyHandle>,
    realm_signers: SignerCache,
    config: Arc<ServiceConfig>,
}

impl CertificateSigner {
    #[must_use]
    pub fn new(
        tokens: Arc<TokenIssuer>,
        store: Arc<dyn VerificationStore>,
        system: Arc<SigningKeyHandle>,
        realm_signers: SignerCache,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            tokens,
            store,
            system,
            realm_signers,
            config,
        }
    }

    #[must_use]
    pub fn system_key(&self) -> &SigningKeyHandle {
        &self.system
    }

    async fn signer_for(&self, realm: &Realm) -> Result<Arc<dyn Signer>, VerifyError> {
        let signer = match realm.custom_certificate_key() {
            Some(key_id) => self.realm_signers.get(realm.id, key_id).await,
            None => self.system.get().await,
        };
        signer.map_err(|err| {
            error!(realm_id = realm.id, "certificate signer unavailable: {err:#}");
            VerifyError::Internal(err.context("certificate signer unavailable"))
        })
    }

    /// Consume the verification token and sign a certificate bound to `hmac`.
    ///
    /// The signer is resolved before the token is consumed.
    ///
    /// # Errors
    /// `HmacInvalid`, `TokenInvalid`, `TokenExpired`, `TokenUsed` or
    /// `Internal`.
    #[instrument(skip(self, realm, token, hmac), fields(realm_id = realm.id))]
    pub async fn issue(
        &self,
        realm: &Realm,
        token: &str,
        hmac: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate, VerifyError> {
        let hmac_bytes = decode_hmac(hmac)?;
        let presented = self.tokens.parse_token(token, now).await?;
        let signer = self.signer_for(realm).await?;

        let consumed = self
            .store
            .consume_token(realm.id, presented.id, &presented.subject, now)
            .await?;

        let expires_at = now + self.config.certificate_ttl();
        let claims = CertificateClaims {
            report_type: consumed.subject.test_type.to_string(),
            symptom_onset_interval: consumed.subject.symptom_date.and_then(interval_number),
            test_date_interval: consumed.subject.test_date.and_then(interval_number),
            tekmac: STANDARD.encode(hmac_bytes),
            iss: realm
                .certificate_issuer
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| self.config.certificate_issuer().to_string()),
            aud: realm
                .certificate_audience
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| self.config.certificate_audience().to_string()),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: consumed.id.to_string(),
        };

        let certificate = jwt::sign_es256(signer.as_ref(), &claims)
            .await
            .map_err(|err| {
                error!("certificate signing failed after token use: {err}");
                VerifyError::Internal(anyhow!("failed to sign certificate: {err}"))
            })?;
        info!(token_id = %consumed.id, key_id = signer.key_id(), "certificate issued");

        Ok(IssuedCertificate {
            certificate,
            expires_at,
        })
    }
}
