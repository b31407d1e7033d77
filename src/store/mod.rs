//! Storage seams.
//!
//! Every piece of cross-request mutable state (codes, tokens, quota buckets,
//! lock rows) sits behind these traits. [`PgStore`] is the production backend
//! and relies on transactions with row locks for linearizability;
//! [`MemoryStore`] serializes through one mutex and backs tests and local runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::{
    codes::{SmsStatus, VerificationCode},
    error::VerifyError,
    lock::LockStatus,
    quota::QuotaBucket,
    realm::{AuthorizedApp, Realm, TestTypes},
    token::{TokenSubject, VerificationToken},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Everything needed to atomically claim a code and mint its token row.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub realm_id: i64,
    pub code_digest: String,
    pub accepted: TestTypes,
    pub nonce: Option<String>,
    pub token_id: Uuid,
    pub token_expires_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub codes: u64,
    pub tokens: u64,
    pub buckets: u64,
}

#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Cheap connectivity check for health endpoints.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert a new code. Fails with `Conflict` when either digest collides.
    async fn insert_code(&self, code: &VerificationCode) -> Result<(), StoreError>;

    async fn find_code(
        &self,
        realm_id: i64,
        id: Uuid,
    ) -> Result<Option<VerificationCode>, StoreError>;

    /// Force both expiries to `now`; returns the updated code.
    async fn expire_code(
        &self,
        realm_id: i64,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationCode>, StoreError>;

    async fn record_sms_status(&self, id: Uuid, status: SmsStatus) -> Result<(), StoreError>;

    /// Look up by short or long digest, apply the claim decision and, on
    /// success, mark the code claimed and create the token in one atomic step.
    async fn claim_code(&self, claim: &ClaimRequest) -> Result<VerificationToken, VerifyError>;

    /// Mark a token used exactly once.
    async fn consume_token(
        &self,
        realm_id: i64,
        token_id: Uuid,
        subject: &TokenSubject,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, VerifyError>;

    /// Delete codes and tokens whose expiry is before `cutoff`, and rate limit
    /// buckets whose window ended before it. Realm quota buckets are kept.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts, StoreError>;
}

#[async_trait]
pub trait RealmStore: Send + Sync {
    async fn find_app_by_key(&self, key_digest: &str) -> Result<Option<AuthorizedApp>, StoreError>;

    async fn find_realm(&self, realm_id: i64) -> Result<Option<Realm>, StoreError>;

    async fn set_abuse_prevention(&self, realm_id: i64, enabled: bool) -> Result<(), StoreError>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Consume one unit from `key`, creating a bucket of `default_limit` over
    /// `window` when none exists. Returns the bucket after the attempt and
    /// whether a unit was taken.
    async fn take(
        &self,
        key: &str,
        default_limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(bool, QuotaBucket), StoreError>;

    /// Add `amount` to the remaining count of the current window, unless the
    /// window's total burst would exceed `max_burst`. Returns whether the
    /// amount was added and the bucket after the attempt.
    async fn burst(
        &self,
        key: &str,
        amount: u64,
        max_burst: u64,
        default_limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(bool, QuotaBucket), StoreError>;

    /// Give back one unit taken in the window ending at `reset_at`. Does
    /// nothing once that window has rolled over or the bucket was replaced.
    async fn refund(
        &self,
        key: &str,
        reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Replace the bucket with a fresh one of `limit` over `window`.
    async fn set(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaBucket, StoreError>;

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<QuotaBucket>, StoreError>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Non-blocking; `true` only for the single caller that advanced the
    /// generation while the lock was free.
    async fn try_lock(
        &self,
        name: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn lock_status(&self, name: &str) -> Result<Option<LockStatus>, StoreError>;
}
