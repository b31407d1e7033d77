//! API key authentication for admin and device callers.
//!
//! Flow: rate limit the client address, resolve the `X-API-Key` digest to an
//! authorized app through a short-TTL cache, rate limit that app, check the key
//! type for the endpoint, then load the app's realm.

use crate::{
    api::{AppState, error::ApiError},
    digest::KeyedDigest,
    error::VerifyError,
    quota::RateLimitDecision,
    realm::{ApiKeyType, AuthorizedApp, Realm},
    store::RealmStore,
};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::debug;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Read-through cache of API key digests to apps. Only hits are cached, so a
/// newly provisioned key works on its first request.
pub struct ApiKeyCache {
    realms: Arc<dyn RealmStore>,
    digest: KeyedDigest,
    ttl: Duration,
    entries: RwLock<HashMap<String, (AuthorizedApp, Instant)>>,
}

impl ApiKeyCache {
    #[must_use]
    pub fn new(realms: Arc<dyn RealmStore>, digest: KeyedDigest, ttl: Duration) -> Self {
        Self {
            realms,
            digest,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// # Errors
    /// Returns `Internal` when the realm store is unavailable.
    pub async fn lookup(&self, api_key: &str) -> Result<Option<AuthorizedApp>, VerifyError> {
        let digest = self.digest.digest(api_key);
        if let Some((app, fetched_at)) = self.entries.read().await.get(&digest)
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(Some(app.clone()));
        }

        let app = self.realms.find_app_by_key(&digest).await?;
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, fetched_at)| fetched_at.elapsed() < self.ttl);
        if let Some(app) = &app {
            entries.insert(digest, (app.clone(), Instant::now()));
        }
        Ok(app)
    }
}

pub(crate) fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Authenticate the caller as `required` and return its realm.
///
/// # Errors
/// 429 when rate limited, 401 for a missing or unknown key, 403 for the wrong
/// key type or a missing realm, 500 when a backing store fails.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    required: ApiKeyType,
    now: DateTime<Utc>,
) -> Result<(AuthorizedApp, Realm), ApiError> {
    rate_limited(state.rate_limiter.check_client(headers, now).await)?;

    let key = api_key(headers).ok_or_else(ApiError::unauthorized)?;
    let app = state
        .api_keys
        .lookup(key)
        .await
        .map_err(ApiError::admin)?
        .ok_or_else(|| {
            debug!("unknown API key");
            ApiError::unauthorized()
        })?;

    rate_limited(state.rate_limiter.check_app(app.id, now).await)?;

    if app.key_type != required {
        debug!(app_id = app.id, "API key type not allowed here");
        return Err(ApiError::forbidden("API key not allowed for this endpoint"));
    }

    let realm = state
        .realms
        .find_realm(app.realm_id)
        .await
        .map_err(|err| ApiError::admin(err.into()))?
        .ok_or_else(|| ApiError::forbidden("realm unavailable"))?;

    Ok((app, realm))
}

fn rate_limited(decision: Result<RateLimitDecision, VerifyError>) -> Result<(), ApiError> {
    match decision {
        Ok(RateLimitDecision::Allowed) => Ok(()),
        Ok(RateLimitDecision::Limited) => Err(ApiError::admin(VerifyError::RateLimited)),
        Err(err) => Err(ApiError::admin(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::tests::{ADMIN_KEY, DEVICE_KEY, fixture, fixture_with},
        config::ServiceConfig,
        store::MemoryStore,
    };
    use anyhow::Result;
    use axum::http::{HeaderValue, StatusCode};
    use secrecy::SecretString;

    fn headers(key: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(key));
        headers
    }

    #[tokio::test]
    async fn key_type_is_enforced() -> Result<()> {
        let fixture = fixture().await?;
        let now = Utc::now();

        let (app, realm) =
            authenticate(&fixture.state, &headers(ADMIN_KEY), ApiKeyType::Admin, now)
                .await
                .map_err(|err| anyhow::anyhow!("{err:?}"))?;
        assert_eq!(app.key_type, ApiKeyType::Admin);
        assert_eq!(realm.id, app.realm_id);

        let Err(err) =
            authenticate(&fixture.state, &headers(DEVICE_KEY), ApiKeyType::Admin, now).await
        else {
            panic!("device key must not reach admin endpoints");
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn missing_and_unknown_keys_are_unauthorized() -> Result<()> {
        let fixture = fixture().await?;
        let now = Utc::now();

        for headers in [HeaderMap::new(), headers("nope")] {
            let Err(err) = authenticate(&fixture.state, &headers, ApiKeyType::Device, now).await
            else {
                panic!("request without a valid key must fail");
            };
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_keys_count_against_the_client_address() -> Result<()> {
        let config = ServiceConfig::new("t".to_string(), "c".to_string())
            .with_api_rate_limit(2, chrono::Duration::minutes(1));
        let fixture = fixture_with(config).await?;
        let now = Utc::now();

        let mut statuses = Vec::new();
        for i in 0..5 {
            let mut headers = headers(DEVICE_KEY);
            headers.insert(API_KEY_HEADER, HeaderValue::from_str(&format!("bogus-{i}"))?);
            headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
            let Err(err) = authenticate(&fixture.state, &headers, ApiKeyType::Device, now).await
            else {
                panic!("bogus key must not authenticate");
            };
            statuses.push(err.status());
        }
        assert_eq!(
            statuses,
            [
                StatusCode::UNAUTHORIZED,
                StatusCode::UNAUTHORIZED,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS,
            ]
        );

        let mut valid = headers(DEVICE_KEY);
        valid.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        let Err(err) = authenticate(&fixture.state, &valid, ApiKeyType::Device, now).await else {
            panic!("a limited address stays limited for valid keys");
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        Ok(())
    }

    #[tokio::test]
    async fn valid_keys_are_limited_per_app() -> Result<()> {
        let config = ServiceConfig::new("t".to_string(), "c".to_string())
            .with_api_rate_limit(2, chrono::Duration::minutes(1));
        let fixture = fixture_with(config).await?;
        let now = Utc::now();

        let mut statuses = Vec::new();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let mut headers = headers(DEVICE_KEY);
            headers.insert("x-forwarded-for", HeaderValue::from_str(ip)?);
            let status = match authenticate(&fixture.state, &headers, ApiKeyType::Device, now).await
            {
                Ok(_) => StatusCode::OK,
                Err(err) => err.status(),
            };
            statuses.push(status);
        }
        assert_eq!(
            statuses,
            [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
        );
        Ok(())
    }

    #[tokio::test]
    async fn cache_serves_hits_until_ttl() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let digest = KeyedDigest::new(&SecretString::from("cache".to_string()))?;
        let app = AuthorizedApp {
            id: 1,
            realm_id: 1,
            name: "app".to_string(),
            key_type: ApiKeyType::Device,
        };
        let cache = ApiKeyCache::new(store.clone(), digest.clone(), Duration::from_secs(60));

        assert!(cache.lookup("key").await?.is_none());
        store.add_app(digest.digest("key"), app).await;
        assert_eq!(cache.lookup("key").await?.map(|app| app.id), Some(1));
        assert_eq!(cache.entries.read().await.len(), 1);
        Ok(())
    }
}
