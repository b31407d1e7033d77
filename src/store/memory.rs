use super::{
    ClaimRequest, LockStore, PurgeCounts, QuotaStore, RealmStore, StoreError, VerificationStore,
};
use crate::{
    codes::{ClaimDecision, SmsStatus, VerificationCode, evaluate_claim},
    error::VerifyError,
    lock::LockStatus,
    quota::QuotaBucket,
    realm::{AuthorizedApp, Realm},
    token::{TokenSubject, VerificationToken},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    codes: HashMap<Uuid, VerificationCode>,
    digests: HashMap<String, Uuid>,
    sms: HashMap<Uuid, SmsStatus>,
    tokens: HashMap<Uuid, VerificationToken>,
    realms: HashMap<i64, Realm>,
    apps: HashMap<String, AuthorizedApp>,
    buckets: HashMap<String, QuotaBucket>,
    locks: HashMap<String, LockStatus>,
}

/// Single-process store. One mutex guards everything, which makes every
/// operation trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_realm(&self, realm: Realm) {
        self.inner.lock().await.realms.insert(realm.id, realm);
    }

    /// Register an app under the digest of its API key.
    pub async fn add_app(&self, key_digest: String, app: AuthorizedApp) {
        self.inner.lock().await.apps.insert(key_digest, app);
    }

    pub async fn sms_status(&self, id: Uuid) -> Option<SmsStatus> {
        self.inner.lock().await.sms.get(&id).copied()
    }

    pub async fn token(&self, id: Uuid) -> Option<VerificationToken> {
        self.inner.lock().await.tokens.get(&id).cloned()
    }

    pub async fn code_count(&self) -> usize {
        self.inner.lock().await.codes.len()
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_code(&self, code: &VerificationCode) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let long_taken = code
            .long_code_hash
            .as_ref()
            .is_some_and(|digest| inner.digests.contains_key(digest));
        if inner.digests.contains_key(&code.code_hash) || long_taken {
            return Err(StoreError::Conflict);
        }

        inner.digests.insert(code.code_hash.clone(), code.id);
        if let Some(digest) = &code.long_code_hash {
            inner.digests.insert(digest.clone(), code.id);
        }
        inner.codes.insert(code.id, code.clone());
        Ok(())
    }

    async fn find_code(
        &self,
        realm_id: i64,
        id: Uuid,
    ) -> Result<Option<VerificationCode>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .codes
            .get(&id)
            .filter(|code| code.realm_id == realm_id)
            .cloned())
    }

    async fn expire_code(
        &self,
        realm_id: i64,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationCode>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(code) = inner
            .codes
            .get_mut(&id)
            .filter(|code| code.realm_id == realm_id)
        else {
            return Ok(None);
        };
        code.expires_at = code.expires_at.min(now);
        code.long_expires_at = code.long_expires_at.min(now);
        Ok(Some(code.clone()))
    }

    async fn record_sms_status(&self, id: Uuid, status: SmsStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.codes.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        inner.sms.insert(id, status);
        Ok(())
    }

    async fn claim_code(&self, claim: &ClaimRequest) -> Result<VerificationToken, VerifyError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(id) = inner.digests.get(&claim.code_digest).copied() else {
            return Err(VerifyError::CodeNotFound);
        };
        let Some(code) = inner
            .codes
            .get_mut(&id)
            .filter(|code| code.realm_id == claim.realm_id)
        else {
            return Err(VerifyError::CodeNotFound);
        };
        let Some(kind) = code.kind_of(&claim.code_digest) else {
            return Err(VerifyError::CodeNotFound);
        };

        match evaluate_claim(
            code,
            kind,
            claim.now,
            claim.nonce.as_deref(),
            claim.accepted,
        ) {
            ClaimDecision::Reject { bind_nonce, error } => {
                if bind_nonce.is_some() {
                    code.nonce = bind_nonce;
                }
                Err(error)
            }
            ClaimDecision::Claim { bind_nonce } => {
                if bind_nonce.is_some() {
                    code.nonce = bind_nonce;
                }
                code.claimed = true;
                code.claimed_at = Some(claim.now);
                code.token_id = Some(claim.token_id);

                let token = VerificationToken {
                    id: claim.token_id,
                    realm_id: code.realm_id,
                    code_id: Some(code.id),
                    subject: TokenSubject {
                        test_type: code.test_type,
                        symptom_date: code.symptom_date,
                        test_date: code.test_date,
                    },
                    created_at: claim.now,
                    expires_at: claim.token_expires_at,
                    used: false,
                };
                inner.tokens.insert(token.id, token.clone());
                Ok(token)
            }
        }
    }

    async fn consume_token(
        &self,
        realm_id: i64,
        token_id: Uuid,
        subject: &TokenSubject,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, VerifyError> {
        let mut inner = self.inner.lock().await;
        let Some(token) = inner
            .tokens
            .get_mut(&token_id)
            .filter(|token| token.realm_id == realm_id)
        else {
            return Err(VerifyError::TokenInvalid);
        };
        token.check_consumable(now, subject)?;
        token.used = true;
        Ok(token.clone())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts, StoreError> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<VerificationCode> = inner
            .codes
            .values()
            .filter(|code| code.expires_at.max(code.long_expires_at) < cutoff)
            .cloned()
            .collect();
        for code in &expired {
            inner.codes.remove(&code.id);
            inner.sms.remove(&code.id);
            inner.digests.remove(&code.code_hash);
            if let Some(digest) = &code.long_code_hash {
                inner.digests.remove(digest);
            }
        }

        let before = inner.tokens.len();
        inner.tokens.retain(|_, token| token.expires_at >= cutoff);
        let tokens = before - inner.tokens.len();

        let before = inner.buckets.len();
        inner
            .buckets
            .retain(|key, bucket| key.starts_with("realm:") || bucket.reset_at >= cutoff);
        let buckets = before - inner.buckets.len();

        Ok(PurgeCounts {
            codes: expired.len() as u64,
            tokens: tokens as u64,
            buckets: buckets as u64,
        })
    }
}

#[async_trait]
impl RealmStore for MemoryStore {
    async fn find_app_by_key(&self, key_digest: &str) -> Result<Option<AuthorizedApp>, StoreError> {
        Ok(self.inner.lock().await.apps.get(key_digest).cloned())
    }

    async fn find_realm(&self, realm_id: i64) -> Result<Option<Realm>, StoreError> {
        Ok(self.inner.lock().await.realms.get(&realm_id).cloned())
    }

    async fn set_abuse_prevention(&self, realm_id: i64, enabled: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let realm = inner.realms.get_mut(&realm_id).ok_or(StoreError::NotFound)?;
        realm.abuse_prevention_enabled = enabled;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn take(
        &self,
        key: &str,
        default_limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(bool, QuotaBucket), StoreError> {
        let mut inner = self.inner.lock().await;
        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| QuotaBucket::fresh(default_limit, window, now));
        let taken = bucket.take(now);
        Ok((taken, bucket.clone()))
    }

    async fn burst(
        &self,
        key: &str,
        amount: u64,
        max_burst: u64,
        default_limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(bool, QuotaBucket), StoreError> {
        let mut inner = self.inner.lock().await;
        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| QuotaBucket::fresh(default_limit, window, now));
        let added = bucket.try_add(amount, max_burst, now);
        Ok((added, bucket.clone()))
    }

    async fn refund(
        &self,
        key: &str,
        reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .buckets
            .get_mut(key)
            .is_some_and(|bucket| bucket.refund(reset_at, now)))
    }

    async fn set(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaBucket, StoreError> {
        let bucket = QuotaBucket::fresh(limit, window, now);
        self.inner
            .lock()
            .await
            .buckets
            .insert(key.to_string(), bucket.clone());
        Ok(bucket)
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<QuotaBucket>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.buckets.get(key).cloned().map(|mut bucket| {
            bucket.roll(now);
            bucket
        }))
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_lock(
        &self,
        name: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .locks
            .entry(name.to_string())
            .or_insert_with(|| LockStatus::unclaimed(name));
        match current.acquire(duration, now) {
            Some(next) => {
                *current = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn lock_status(&self, name: &str) -> Result<Option<LockStatus>, StoreError> {
        Ok(self.inner.lock().await.locks.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::tests::sample_code;
    use crate::realm::TestTypes;
    use anyhow::Result;
    use std::sync::Arc;

    fn claim(digest: &str, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            realm_id: 1,
            code_digest: digest.to_string(),
            accepted: TestTypes::CONFIRMED,
            nonce: None,
            token_id: Uuid::new_v4(),
            token_expires_at: now + Duration::minutes(30),
            now,
        }
    }

    #[tokio::test]
    async fn duplicate_digest_conflicts() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_code(&sample_code(now)).await?;

        let mut again = sample_code(now);
        again.long_code_hash = None;
        assert!(matches!(
            store.insert_code(&again).await,
            Err(StoreError::Conflict)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn other_realm_cannot_claim() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_code(&sample_code(now)).await?;

        let mut request = claim("short-digest", now);
        request.realm_id = 2;
        assert!(matches!(
            store.claim_code(&request).await,
            Err(VerifyError::CodeNotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_claims_create_one_token() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store.insert_code(&sample_code(now)).await?;

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            let digest = if i % 2 == 0 { "short-digest" } else { "long-digest" };
            let request = claim(digest, now);
            handles.push(tokio::spawn(async move { store.claim_code(&request).await }));
        }

        let mut tokens = 0;
        let mut already_claimed = 0;
        for handle in handles {
            match handle.await? {
                Ok(_) => tokens += 1,
                Err(VerifyError::CodeClaimed) => already_claimed += 1,
                Err(other) => return Err(other.into()),
            }
        }
        assert_eq!(tokens, 1);
        assert_eq!(already_claimed, 9);
        assert_eq!(store.inner.lock().await.tokens.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn purge_removes_only_expired() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = sample_code(now - Duration::days(10));
        let mut fresh = sample_code(now);
        fresh.code_hash = "fresh-short".to_string();
        fresh.long_code_hash = None;
        store.insert_code(&old).await?;
        store.insert_code(&fresh).await?;

        let minute = Duration::minutes(1);
        let long_ago = now - Duration::days(10);
        store.take("ip:stale", 5, minute, long_ago).await?;
        store.take("app:stale", 5, minute, long_ago).await?;
        store.take("ip:current", 5, minute, now).await?;
        store.set("realm:stale", 5, Duration::hours(24), long_ago).await?;

        let counts = store.purge_expired(now - Duration::days(1)).await?;
        assert_eq!(counts.codes, 1);
        assert_eq!(counts.buckets, 2);
        assert_eq!(store.code_count().await, 1);
        assert!(store.get("ip:stale", now).await?.is_none());
        assert!(store.get("app:stale", now).await?.is_none());
        assert!(store.get("ip:current", now).await?.is_some());
        assert!(store.get("realm:stale", now).await?.is_some());

        // freed digests can be reused
        store.insert_code(&sample_code(now)).await?;
        Ok(())
    }
}
