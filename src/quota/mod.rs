//! Issuance quota and API rate limiting.
//!
//! Both limiters share one [`QuotaStore`] and key their buckets by an HMAC of
//! the identifier, so raw realm ids, API keys and client addresses never
//! appear in the store. Any store failure denies the request.

mod rate_limit;

pub use rate_limit::{ApiRateLimiter, RateLimitDecision, extract_client_ip};

use crate::{
    digest::KeyedDigest,
    error::VerifyError,
    realm::Realm,
    store::{QuotaStore, RealmStore},
};
use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// A fixed window counter. `remaining` never goes below zero. `burst` is the
/// total added on top of `limit` in the current window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBucket {
    pub limit: u64,
    pub remaining: u64,
    pub burst: u64,
    pub window: Duration,
    pub reset_at: DateTime<Utc>,
}

impl QuotaBucket {
    #[must_use]
    pub fn fresh(limit: u64, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            remaining: limit,
            burst: 0,
            window,
            reset_at: now + window,
        }
    }

    /// Start a new window if the current one has ended. Burst additions do
    /// not survive a reset.
    pub fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.reset_at {
            self.remaining = self.limit;
            self.burst = 0;
            self.reset_at = now + self.window;
        }
    }

    /// Take one unit if any remain.
    pub fn take(&mut self, now: DateTime<Utc>) -> bool {
        self.roll(now);
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Add `amount` to the current window unless the window's burst total
    /// would pass `max_burst`.
    pub fn try_add(&mut self, amount: u64, max_burst: u64, now: DateTime<Utc>) -> bool {
        self.roll(now);
        match self.burst.checked_add(amount) {
            Some(total) if total <= max_burst => {
                self.burst = total;
                self.remaining = self.remaining.saturating_add(amount);
                true
            }
            _ => false,
        }
    }

    /// Return one unit taken in the window ending at `reset_at`.
    pub fn refund(&mut self, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.reset_at != reset_at || now >= self.reset_at {
            return false;
        }
        self.remaining = self.remaining.saturating_add(1);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Per-realm daily issuance quota.
#[derive(Clone)]
pub struct QuotaLimiter {
    store: Arc<dyn QuotaStore>,
    digest: KeyedDigest,
    default_limit: u64,
    window: Duration,
}

impl QuotaLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn QuotaStore>,
        digest: KeyedDigest,
        default_limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            digest,
            default_limit,
            window,
        }
    }

    #[must_use]
    pub fn realm_key(&self, realm_id: i64) -> String {
        format!("realm:{}", self.digest.digest(&format!("realm:{realm_id}")))
    }

    /// Consume one issuance unit for the realm.
    ///
    /// # Errors
    /// Returns `Internal` when the store is unavailable; callers must treat
    /// that as a denial.
    #[instrument(skip(self))]
    pub async fn check_and_consume(
        &self,
        realm_id: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, VerifyError> {
        let key = self.realm_key(realm_id);
        match self
            .store
            .take(&key, self.default_limit, self.window, now)
            .await
        {
            Ok((allowed, bucket)) => {
                if !allowed {
                    warn!(realm_id, "issuance quota exhausted");
                }
                Ok(QuotaDecision {
                    allowed,
                    remaining: bucket.remaining,
                    reset_at: bucket.reset_at,
                })
            }
            Err(err) => {
                error!("quota store unavailable: {err}");
                Err(VerifyError::Internal(anyhow!(err).context("quota check failed")))
            }
        }
    }

    /// Give back a unit consumed by `decision` when the issuance it paid for
    /// did not happen.
    ///
    /// # Errors
    /// Returns `Internal` on store failure.
    #[instrument(skip(self, decision))]
    pub async fn refund(
        &self,
        realm_id: i64,
        decision: &QuotaDecision,
        now: DateTime<Utc>,
    ) -> Result<bool, VerifyError> {
        if !decision.allowed {
            return Ok(false);
        }
        let key = self.realm_key(realm_id);
        Ok(self.store.refund(&key, decision.reset_at, now).await?)
    }

    /// Temporarily raise the realm's remaining count for the current window.
    /// All bursts in one window together may add at most `realm.max_burst`.
    ///
    /// # Errors
    /// `BurstExceeded` when `amount` is zero or would take the window's burst
    /// total above the realm's bound; `Internal` on store failure.
    #[instrument(skip(self, realm), fields(realm_id = realm.id))]
    pub async fn burst(
        &self,
        realm: &Realm,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<QuotaBucket, VerifyError> {
        if amount == 0 || amount > realm.max_burst {
            return Err(VerifyError::BurstExceeded {
                requested: amount,
                max: realm.max_burst,
            });
        }
        let key = self.realm_key(realm.id);
        let (added, bucket) = self
            .store
            .burst(
                &key,
                amount,
                realm.max_burst,
                self.default_limit,
                self.window,
                now,
            )
            .await?;
        if !added {
            warn!(amount, burst = bucket.burst, "quota burst refused");
            return Err(VerifyError::BurstExceeded {
                requested: amount,
                max: realm.max_burst.saturating_sub(bucket.burst),
            });
        }
        info!(amount, remaining = bucket.remaining, "quota burst applied");
        Ok(bucket)
    }

    /// Initialize a fresh bucket for the realm.
    ///
    /// # Errors
    /// Returns `Internal` on store failure.
    #[instrument(skip(self))]
    pub async fn set(
        &self,
        realm_id: i64,
        limit: u64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaBucket, VerifyError> {
        let key = self.realm_key(realm_id);
        Ok(self.store.set(&key, limit, ttl, now).await?)
    }

    /// # Errors
    /// Returns `Internal` on store failure.
    pub async fn status(
        &self,
        realm_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaBucket>, VerifyError> {
        let key = self.realm_key(realm_id);
        Ok(self.store.get(&key, now).await?)
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    #[must_use]
    pub fn default_limit(&self) -> u64 {
        self.default_limit
    }
}

/// Turn on abuse prevention for a realm.
///
/// The bucket is created before the realm flag is persisted so enforcement
/// never starts against the system default limit.
///
/// # Errors
/// Returns `Internal` if either write fails. A failure after the bucket was set
/// leaves the flag off, which is safe to retry.
pub async fn enable_abuse_prevention(
    limiter: &QuotaLimiter,
    realms: &dyn RealmStore,
    realm_id: i64,
    limit: u64,
    now: DateTime<Utc>,
) -> Result<QuotaBucket, VerifyError> {
    let bucket = limiter.set(realm_id, limit, limiter.window(), now).await?;
    realms.set_abuse_prevention(realm_id, true).await?;
    info!(realm_id, limit, "abuse prevention enabled");
    Ok(bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::Result;
    use secrecy::SecretString;

    fn limiter(store: Arc<MemoryStore>, default_limit: u64) -> Result<QuotaLimiter> {
        let digest = KeyedDigest::new(&SecretString::from("quota-secret".to_string()))?;
        Ok(QuotaLimiter::new(store, digest, default_limit, Duration::hours(24)))
    }

    #[test]
    fn bucket_never_goes_negative() {
        let now = Utc::now();
        let mut bucket = QuotaBucket::fresh(1, Duration::hours(24), now);
        assert!(bucket.take(now));
        assert!(!bucket.take(now));
        assert_eq!(bucket.remaining, 0);
    }

    #[test]
    fn bucket_resets_on_rolling_window() {
        let now = Utc::now();
        let mut bucket = QuotaBucket::fresh(2, Duration::hours(24), now);
        assert!(bucket.try_add(5, 5, now));
        assert!(bucket.take(now));
        assert_eq!(bucket.remaining, 6);

        let tomorrow = now + Duration::hours(25);
        assert!(bucket.take(tomorrow));
        assert_eq!(bucket.remaining, 1);
        assert_eq!(bucket.burst, 0);
        assert_eq!(bucket.reset_at, tomorrow + Duration::hours(24));
    }

    #[test]
    fn refund_only_applies_to_the_same_window() {
        let now = Utc::now();
        let mut bucket = QuotaBucket::fresh(1, Duration::hours(24), now);
        let window = bucket.reset_at;
        assert!(bucket.take(now));
        assert!(bucket.refund(window, now));
        assert_eq!(bucket.remaining, 1);

        let tomorrow = now + Duration::hours(25);
        assert!(bucket.take(tomorrow));
        assert!(!bucket.refund(window, tomorrow));
        assert_eq!(bucket.remaining, 0);
    }

    #[test]
    fn realm_key_hides_realm_id() -> Result<()> {
        let limiter = limiter(Arc::new(MemoryStore::new()), 10)?;
        let key = limiter.realm_key(42);
        assert!(key.starts_with("realm:"));
        assert!(!key.contains("42"));
        assert_ne!(key, limiter.realm_key(43));
        Ok(())
    }

    #[tokio::test]
    async fn burst_increases_remaining_by_amount() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 10)?;
        let realm = Realm::new(1, "state");
        let now = Utc::now();

        let before = limiter.check_and_consume(realm.id, now).await?;
        let bucket = limiter.burst(&realm, 5, now).await?;
        assert_eq!(bucket.remaining, before.remaining + 5);
        Ok(())
    }

    #[tokio::test]
    async fn burst_is_bounded_by_realm() -> Result<()> {
        let limiter = limiter(Arc::new(MemoryStore::new()), 10)?;
        let mut realm = Realm::new(1, "state");
        realm.max_burst = 3;

        let result = limiter.burst(&realm, 4, Utc::now()).await;
        assert!(matches!(
            result,
            Err(VerifyError::BurstExceeded {
                requested: 4,
                max: 3
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn repeated_bursts_share_the_window_bound() -> Result<()> {
        let limiter = limiter(Arc::new(MemoryStore::new()), 10)?;
        let mut realm = Realm::new(1, "state");
        realm.max_burst = 3;
        let now = Utc::now();

        let bucket = limiter.burst(&realm, 3, now).await?;
        assert_eq!(bucket.remaining, 13);

        let mut refused = 0;
        for _ in 0..100 {
            if matches!(
                limiter.burst(&realm, 3, now).await,
                Err(VerifyError::BurstExceeded { requested: 3, max: 0 })
            ) {
                refused += 1;
            }
        }
        assert_eq!(refused, 100);
        assert_eq!(limiter.status(1, now).await?.map(|b| b.remaining), Some(13));

        let tomorrow = now + Duration::hours(25);
        let bucket = limiter.burst(&realm, 2, tomorrow).await?;
        assert_eq!(bucket.remaining, 12);
        assert!(limiter.burst(&realm, 2, tomorrow).await.is_err());
        assert_eq!(limiter.burst(&realm, 1, tomorrow).await?.remaining, 13);
        Ok(())
    }

    #[tokio::test]
    async fn refund_restores_a_consumed_unit() -> Result<()> {
        let limiter = limiter(Arc::new(MemoryStore::new()), 2)?;
        let now = Utc::now();

        let decision = limiter.check_and_consume(4, now).await?;
        assert_eq!(decision.remaining, 1);
        assert!(limiter.refund(4, &decision, now).await?);
        assert_eq!(limiter.status(4, now).await?.map(|b| b.remaining), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn set_overrides_default_limit() -> Result<()> {
        let limiter = limiter(Arc::new(MemoryStore::new()), 100)?;
        let now = Utc::now();

        limiter.set(9, 1, Duration::hours(24), now).await?;
        let first = limiter.check_and_consume(9, now).await?;
        let second = limiter.check_and_consume(9, now).await?;

        assert!(first.allowed);
        assert_eq!(first.remaining, 0);
        assert!(!second.allowed);
        assert_eq!(second.remaining, 0);
        Ok(())
    }

    #[tokio::test]
    async fn enabling_sets_bucket_then_flag() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.add_realm(Realm::new(5, "county")).await;
        let limiter = limiter(store.clone(), 100)?;
        let now = Utc::now();

        let bucket = enable_abuse_prevention(&limiter, store.as_ref(), 5, 2, now).await?;
        assert_eq!(bucket.limit, 2);

        let realm = store.find_realm(5).await?;
        assert!(realm.is_some_and(|r| r.abuse_prevention_enabled));
        assert_eq!(limiter.status(5, now).await?.map(|b| b.remaining), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_consumers_never_overdraw() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(limiter(store, 5)?);
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_and_consume(1, now).await
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await??.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
        Ok(())
    }
}
