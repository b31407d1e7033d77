//! Fixed-window rate limiting for the public API.
//!
//! Every request is first counted against its client address, before the API
//! key is looked up, so unknown keys cannot buy fresh buckets. Requests whose
//! key resolves to an app are then also counted against that app.

use crate::{digest::KeyedDigest, error::VerifyError, store::QuotaStore};
use anyhow::anyhow;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Limits requests per client address and per authorized app.
#[derive(Clone)]
pub struct ApiRateLimiter {
    store: Arc<dyn QuotaStore>,
    digest: KeyedDigest,
    limit: u64,
    window: Duration,
}

impl ApiRateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn QuotaStore>,
        digest: KeyedDigest,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            digest,
            limit,
            window,
        }
    }

    #[must_use]
    pub fn client_key(&self, client_ip: Option<&str>) -> String {
        client_ip.map_or_else(
            || "ip:unknown".to_string(),
            |ip| format!("ip:{}", self.digest.digest(ip)),
        )
    }

    #[must_use]
    pub fn app_key(&self, app_id: i64) -> String {
        format!("app:{}", self.digest.digest(&format!("app:{app_id}")))
    }

    /// Count the request against its client address. Runs before any API key
    /// lookup.
    ///
    /// # Errors
    /// Returns `Internal` when the store is unavailable.
    pub async fn check_client(
        &self,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, VerifyError> {
        let client_ip = extract_client_ip(headers);
        self.take(&self.client_key(client_ip.as_deref()), now).await
    }

    /// Count the request against an app whose key already resolved.
    ///
    /// # Errors
    /// Returns `Internal` when the store is unavailable.
    pub async fn check_app(
        &self,
        app_id: i64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, VerifyError> {
        self.take(&self.app_key(app_id), now).await
    }

    async fn take(&self, key: &str, now: DateTime<Utc>) -> Result<RateLimitDecision, VerifyError> {
        match self.store.take(key, self.limit, self.window, now).await {
            Ok((true, _)) => Ok(RateLimitDecision::Allowed),
            Ok((false, bucket)) => {
                debug!(reset_at = %bucket.reset_at, "API rate limit reached");
                Ok(RateLimitDecision::Limited)
            }
            Err(err) => {
                error!("rate limit store unavailable: {err}");
                Err(VerifyError::Internal(anyhow!(err).context("rate limit check failed")))
            }
        }
    }
}

/// Extract a client IP for rate limiting from common proxy headers.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::Result;
    use axum::http::HeaderValue;
    use secrecy::SecretString;

    fn limiter(limit: u64) -> Result<ApiRateLimiter> {
        let digest = KeyedDigest::new(&SecretString::from("rate-secret".to_string()))?;
        Ok(ApiRateLimiter::new(
            Arc::new(MemoryStore::new()),
            digest,
            limit,
            Duration::minutes(1),
        ))
    }

    #[test]
    fn extract_client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }

    #[test]
    fn bucket_keys_hide_addresses_and_ids() -> Result<()> {
        let limiter = limiter(1)?;
        let client = limiter.client_key(Some("1.2.3.4"));
        assert!(client.starts_with("ip:"));
        assert!(!client.contains("1.2.3.4"));
        assert_eq!(limiter.client_key(None), "ip:unknown");
        assert!(limiter.app_key(7).starts_with("app:"));
        assert_ne!(limiter.app_key(7), limiter.app_key(8));
        Ok(())
    }

    #[tokio::test]
    async fn varying_api_keys_share_the_client_bucket() -> Result<()> {
        let limiter = limiter(2)?;
        let now = Utc::now();

        let mut allowed = 0;
        for i in 0..50 {
            let mut headers = HeaderMap::new();
            headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
            headers.insert("x-api-key", HeaderValue::from_str(&format!("bogus-{i}"))?);
            if limiter.check_client(&headers, now).await? == RateLimitDecision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 2);

        let mut other = HeaderMap::new();
        other.insert("x-forwarded-for", HeaderValue::from_static("5.6.7.8"));
        assert_eq!(limiter.check_client(&other, now).await?, RateLimitDecision::Allowed);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        let later = now + Duration::minutes(2);
        assert_eq!(limiter.check_client(&headers, later).await?, RateLimitDecision::Allowed);
        Ok(())
    }

    #[tokio::test]
    async fn limits_per_app() -> Result<()> {
        let limiter = limiter(2)?;
        let now = Utc::now();

        assert_eq!(limiter.check_app(1, now).await?, RateLimitDecision::Allowed);
        assert_eq!(limiter.check_app(1, now).await?, RateLimitDecision::Allowed);
        assert_eq!(limiter.check_app(1, now).await?, RateLimitDecision::Limited);
        assert_eq!(limiter.check_app(2, now).await?, RateLimitDecision::Allowed);
        Ok(())
    }
}
