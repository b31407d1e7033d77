use super::{TokenClaims, TokenSubject};
use crate::{
    codes::CodeService,
    config::ServiceConfig,
    error::VerifyError,
    realm::{Realm, TestType, TestTypes},
    signer::{SigningKeyHandle, jwt},
};
use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, error, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct VerifyRequest {
    pub code: String,
    pub accept_test_types: Vec<String>,
    pub nonce: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub id: Uuid,
    pub token: String,
    pub test_type: TestType,
    pub symptom_date: Option<NaiveDate>,
    pub test_date: Option<NaiveDate>,
    pub expires_at: DateTime<Utc>,
}

/// A token whose signature and claims checked out. It may still be used or
/// revoked in the store.
#[derive(Debug, Clone)]
pub struct PresentedToken {
    pub id: Uuid,
    pub subject: TokenSubject,
}

/// Exchanges codes for signed verification tokens and validates them on the
/// way back in.
pub struct TokenIssuer {
    codes: Arc<CodeService>,
    signer: Arc<SigningKeyHandle>,
    config: Arc<ServiceConfig>,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(
        codes: Arc<CodeService>,
        signer: Arc<SigningKeyHandle>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            codes,
            signer,
            config,
        }
    }

    #[must_use]
    pub fn codes(&self) -> &CodeService {
        &self.codes
    }

    #[must_use]
    pub fn signing_key(&self) -> &SigningKeyHandle {
        &self.signer
    }

    /// Claim the code and sign a token for it.
    ///
    /// The signer is resolved before the claim so a key manager outage does
    /// not burn the code.
    ///
    /// # Errors
    /// Anything [`CodeService::claim`] returns, `InvalidTestType` for unknown
    /// accepted types, or `Internal` when signing fails.
    #[instrument(skip(self, realm, request), fields(realm_id = realm.id))]
    pub async fn verify_code(
        &self,
        realm: &Realm,
        request: &VerifyRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, VerifyError> {
        let accepted = TestTypes::accepted(&request.accept_test_types)?;
        let signer = self.signer.get().await.map_err(|err| {
            error!("token signer unavailable: {err:#}");
            VerifyError::Internal(err.context("token signer unavailable"))
        })?;

        let token = self
            .codes
            .claim(realm.id, &request.code, accepted, request.nonce.as_deref(), now)
            .await?;

        let claims = TokenClaims {
            iss: self.config.token_issuer().to_string(),
            aud: self.config.token_audience().to_string(),
            iat: now.timestamp(),
            exp: token.expires_at.timestamp(),
            jti: token.id.to_string(),
            sub: token.subject.to_string(),
        };
        let signed = jwt::sign_es256(signer.as_ref(), &claims)
            .await
            .map_err(|err| VerifyError::Internal(anyhow!("failed to sign token: {err}")))?;

        Ok(IssuedToken {
            id: token.id,
            token: signed,
            test_type: token.subject.test_type,
            symptom_date: token.subject.symptom_date,
            test_date: token.subject.test_date,
            expires_at: token.expires_at,
        })
    }

    /// Check signature, issuer, audience and expiry of a presented token.
    ///
    /// # Errors
    /// `TokenInvalid` for anything that is not a token minted here,
    /// `TokenExpired` past `exp`, `Internal` when the key is unavailable.
    pub async fn parse_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<PresentedToken, VerifyError> {
        let signer = self.signer.get().await.map_err(|err| {
            error!("token signer unavailable: {err:#}");
            VerifyError::Internal(err.context("token signer unavailable"))
        })?;

        let claims: TokenClaims =
            jwt::verify_es256(token.trim(), signer.public_key(), signer.key_id()).map_err(|err| {
                debug!("rejected verification token: {err}");
                VerifyError::TokenInvalid
            })?;

        if claims.iss != self.config.token_issuer() || claims.aud != self.config.token_audience() {
            return Err(VerifyError::TokenInvalid);
        }
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(VerifyError::TokenInvalid)?;
        if now >= expires_at {
            return Err(VerifyError::TokenExpired);
        }

        Ok(PresentedToken {
            id: Uuid::parse_str(&claims.jti).map_err(|_| VerifyError::TokenInvalid)?,
            subject: TokenSubject::parse(&claims.sub)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        codes::{IssueRequest, service::tests::service},
        signer::{KeyManager, LocalKeyManager},
        store::MemoryStore,
    };
    use anyhow::Result;
    use chrono::Duration;

    pub(crate) fn issuer(store: Arc<MemoryStore>, keys: Arc<dyn KeyManager>) -> Result<TokenIssuer> {
        let config = Arc::new(ServiceConfig::new("token".to_string(), "cert".to_string()));
        let handle = Arc::new(SigningKeyHandle::new(
            keys,
            "token".to_string(),
            std::time::Duration::from_secs(60),
        ));
        Ok(TokenIssuer::new(Arc::new(service(store)?), handle, config))
    }

    async fn issue(issuer: &TokenIssuer, realm: &Realm, test_type: &str) -> Result<String> {
        let request = IssueRequest {
            test_type: test_type.to_string(),
            symptom_date: Some(Utc::now().date_naive().format("%Y-%m-%d").to_string()),
            ..IssueRequest::default()
        };
        Ok(issuer.codes.issue(realm, None, &request, Utc::now()).await?.code)
    }

    #[tokio::test]
    async fn verify_code_returns_signed_token() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let issuer = issuer(store, Arc::new(LocalKeyManager::new()))?;
        let realm = Realm::new(1, "state");
        let code = issue(&issuer, &realm, "confirmed").await?;
        let now = Utc::now();

        let request = VerifyRequest {
            code,
            ..VerifyRequest::default()
        };
        let issued = issuer.verify_code(&realm, &request, now).await?;
        assert_eq!(issued.test_type, TestType::Confirmed);
        assert_eq!(issued.token.split('.').count(), 3);

        let presented = issuer.parse_token(&issued.token, now).await?;
        assert_eq!(presented.id, issued.id);
        assert_eq!(presented.subject.test_type, TestType::Confirmed);

        let later = now + Duration::minutes(31);
        assert!(matches!(
            issuer.parse_token(&issued.token, later).await,
            Err(VerifyError::TokenExpired)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn accepted_types_gate_the_claim() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let issuer = issuer(store, Arc::new(LocalKeyManager::new()))?;
        let realm = Realm::new(1, "state");
        let code = issue(&issuer, &realm, "likely").await?;

        let mut request = VerifyRequest {
            code,
            ..VerifyRequest::default()
        };
        let result = issuer.verify_code(&realm, &request, Utc::now()).await;
        assert!(matches!(result, Err(VerifyError::UnsupportedTestType(_))));

        request.accept_test_types = vec!["likely".to_string()];
        let issued = issuer.verify_code(&realm, &request, Utc::now()).await?;
        assert_eq!(issued.test_type, TestType::Likely);
        Ok(())
    }

    #[tokio::test]
    async fn foreign_tokens_are_invalid() -> Result<()> {
        let keys: Arc<dyn KeyManager> = Arc::new(LocalKeyManager::new());
        let issuer = issuer(Arc::new(MemoryStore::new()), keys)?;
        let other = issuer_with_other_keys()?;
        let realm = Realm::new(1, "state");
        let code = issue(&other, &realm, "confirmed").await?;
        let request = VerifyRequest {
            code,
            ..VerifyRequest::default()
        };
        let foreign = other.verify_code(&realm, &request, Utc::now()).await?;

        for bad in [foreign.token.as_str(), "garbage", "a.b.c"] {
            assert!(matches!(
                issuer.parse_token(bad, Utc::now()).await,
                Err(VerifyError::TokenInvalid)
            ));
        }
        Ok(())
    }

    fn issuer_with_other_keys() -> Result<TokenIssuer> {
        issuer(Arc::new(MemoryStore::new()), Arc::new(LocalKeyManager::new()))
    }
}
