//! `PostgreSQL` backend.
//!
//! Claims, token consumption, quota updates and lock acquisition each run in a
//! single transaction that first takes a row lock (`SELECT ... FOR UPDATE`),
//! so concurrent replicas serialize on the row rather than on process memory.
//! A dropped future rolls its transaction back.

use super::{
    ClaimRequest, LockStore, PurgeCounts, QuotaStore, RealmStore, StoreError, VerificationStore,
};
use crate::{
    codes::{ClaimDecision, SmsStatus, VerificationCode, evaluate_claim},
    error::VerifyError,
    lock::LockStatus,
    quota::QuotaBucket,
    realm::{ApiKeyType, AuthorizedApp, DatePolicy, Realm, TestType, TestTypes},
    token::{TokenSubject, VerificationToken},
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Connection, PgPool, Row, postgres::PgRow};
use tracing::{Instrument, Span, info_span};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} out of range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("negative value {value} in store"))
}

fn code_from_row(row: &PgRow) -> Result<VerificationCode> {
    let test_type: String = row.try_get("test_type")?;
    Ok(VerificationCode {
        id: row.try_get("id")?,
        realm_id: row.try_get("realm_id")?,
        code_hash: row.try_get("code_digest")?,
        long_code_hash: row.try_get("long_code_digest")?,
        test_type: TestType::parse(&test_type)
            .map_err(|_| anyhow!("stored test type {test_type} is invalid"))?,
        symptom_date: row.try_get("symptom_date")?,
        test_date: row.try_get("test_date")?,
        issuing_app_id: row.try_get("issuing_app_id")?,
        external_issuer_id: row.try_get("external_issuer_id")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        long_expires_at: row.try_get("long_expires_at")?,
        claimed: row.try_get("claimed")?,
        claimed_at: row.try_get("claimed_at")?,
        token_id: row.try_get("token_id")?,
        nonce: row.try_get("nonce")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<VerificationToken> {
    let test_type: String = row.try_get("test_type")?;
    Ok(VerificationToken {
        id: row.try_get("id")?,
        realm_id: row.try_get("realm_id")?,
        code_id: row.try_get("code_id")?,
        subject: TokenSubject {
            test_type: TestType::parse(&test_type)
                .map_err(|_| anyhow!("stored test type {test_type} is invalid"))?,
            symptom_date: row.try_get("symptom_date")?,
            test_date: row.try_get("test_date")?,
        },
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        used: row.try_get("used")?,
    })
}

fn realm_from_row(row: &PgRow) -> Result<Realm> {
    let short_length: i32 = row.try_get("short_code_length")?;
    let short_minutes: i32 = row.try_get("short_code_minutes")?;
    let long_length: i32 = row.try_get("long_code_length")?;
    let long_hours: i32 = row.try_get("long_code_hours")?;
    let max_burst: i64 = row.try_get("max_burst")?;
    let require_date: bool = row.try_get("require_date")?;

    Ok(Realm {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        allowed_test_types: TestTypes::from_bits(row.try_get("allowed_test_types")?),
        date_policy: if require_date {
            DatePolicy::Required
        } else {
            DatePolicy::Optional
        },
        short_code_length: usize::try_from(short_length).context("short_code_length")?,
        short_code_ttl: Duration::minutes(i64::from(short_minutes)),
        long_code_length: usize::try_from(long_length).context("long_code_length")?,
        long_code_ttl: Duration::hours(i64::from(long_hours)),
        sms_enabled: row.try_get("sms_enabled")?,
        abuse_prevention_enabled: row.try_get("abuse_prevention_enabled")?,
        max_burst: to_u64(max_burst)?,
        use_realm_certificate_key: row.try_get("use_realm_certificate_key")?,
        certificate_key_id: row.try_get("certificate_key_id")?,
        certificate_issuer: row.try_get("certificate_issuer")?,
        certificate_audience: row.try_get("certificate_audience")?,
    })
}

fn bucket_from_row(row: &PgRow) -> Result<QuotaBucket> {
    let limit: i64 = row.try_get("quota_limit")?;
    let remaining: i64 = row.try_get("remaining")?;
    let burst: i64 = row.try_get("burst")?;
    let window_seconds: i64 = row.try_get("window_seconds")?;
    Ok(QuotaBucket {
        limit: to_u64(limit)?,
        remaining: to_u64(remaining)?,
        burst: to_u64(burst)?,
        window: Duration::seconds(window_seconds),
        reset_at: row.try_get("reset_at")?,
    })
}

const SELECT_CODE: &str = r"
    SELECT id, realm_id, code_digest, long_code_digest, test_type, symptom_date, test_date,
           issuing_app_id, external_issuer_id, created_at, expires_at, long_expires_at,
           claimed, claimed_at, token_id, nonce
    FROM verification_codes
    WHERE realm_id = $1 AND id = $2
";

const SELECT_CODE_FOR_CLAIM: &str = r"
    SELECT id, realm_id, code_digest, long_code_digest, test_type, symptom_date, test_date,
           issuing_app_id, external_issuer_id, created_at, expires_at, long_expires_at,
           claimed, claimed_at, token_id, nonce
    FROM verification_codes
    WHERE realm_id = $1 AND (code_digest = $2 OR long_code_digest = $2)
    FOR UPDATE
";

#[async_trait]
impl VerificationStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire database connection")?;
        conn.ping()
            .instrument(span)
            .await
            .context("failed to ping database")?;
        Ok(())
    }

    async fn insert_code(&self, code: &VerificationCode) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO verification_codes
                (id, realm_id, code_digest, long_code_digest, test_type, symptom_date, test_date,
                 issuing_app_id, external_issuer_id, created_at, expires_at, long_expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ";
        let result = sqlx::query(query)
            .bind(code.id)
            .bind(code.realm_id)
            .bind(&code.code_hash)
            .bind(&code.long_code_hash)
            .bind(code.test_type.as_str())
            .bind(code.symptom_date)
            .bind(code.test_date)
            .bind(code.issuing_app_id)
            .bind(&code.external_issuer_id)
            .bind(code.created_at)
            .bind(code.expires_at)
            .bind(code.long_expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict),
            Err(err) => Err(anyhow!(err).context("failed to insert verification code").into()),
        }
    }

    async fn find_code(
        &self,
        realm_id: i64,
        id: Uuid,
    ) -> Result<Option<VerificationCode>, StoreError> {
        let row = sqlx::query(SELECT_CODE)
            .bind(realm_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", SELECT_CODE))
            .await
            .context("failed to lookup verification code")?;

        Ok(row.as_ref().map(code_from_row).transpose()?)
    }

    async fn expire_code(
        &self,
        realm_id: i64,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationCode>, StoreError> {
        let query = r"
            UPDATE verification_codes
            SET expires_at = LEAST(expires_at, $3),
                long_expires_at = LEAST(long_expires_at, $3)
            WHERE realm_id = $1 AND id = $2
            RETURNING id, realm_id, code_digest, long_code_digest, test_type, symptom_date,
                      test_date, issuing_app_id, external_issuer_id, created_at, expires_at,
                      long_expires_at, claimed, claimed_at, token_id, nonce
        ";
        let row = sqlx::query(query)
            .bind(realm_id)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to expire verification code")?;

        Ok(row.as_ref().map(code_from_row).transpose()?)
    }

    async fn record_sms_status(&self, id: Uuid, status: SmsStatus) -> Result<(), StoreError> {
        let query = "UPDATE verification_codes SET sms_status = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to record sms status")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn claim_code(&self, claim: &ClaimRequest) -> Result<VerificationToken, VerifyError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin claim transaction")?;

        let row = sqlx::query(SELECT_CODE_FOR_CLAIM)
            .bind(claim.realm_id)
            .bind(&claim.code_digest)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", SELECT_CODE_FOR_CLAIM))
            .await
            .context("failed to lock verification code")?;

        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Err(VerifyError::CodeNotFound);
        };
        let code = code_from_row(&row)?;
        let Some(kind) = code.kind_of(&claim.code_digest) else {
            let _ = tx.rollback().await;
            return Err(VerifyError::CodeNotFound);
        };

        match evaluate_claim(
            &code,
            kind,
            claim.now,
            claim.nonce.as_deref(),
            claim.accepted,
        ) {
            ClaimDecision::Reject {
                bind_nonce: Some(nonce),
                error,
            } => {
                let query = "UPDATE verification_codes SET nonce = $2 WHERE id = $1 AND nonce IS NULL";
                sqlx::query(query)
                    .bind(code.id)
                    .bind(&nonce)
                    .execute(&mut *tx)
                    .instrument(db_span("UPDATE", query))
                    .await
                    .context("failed to bind nonce")?;
                tx.commit().await.context("commit nonce binding")?;
                Err(error)
            }
            ClaimDecision::Reject {
                bind_nonce: None,
                error,
            } => {
                let _ = tx.rollback().await;
                Err(error)
            }
            ClaimDecision::Claim { bind_nonce } => {
                let query = r"
                    UPDATE verification_codes
                    SET claimed = TRUE, claimed_at = $2, token_id = $3, nonce = COALESCE($4, nonce)
                    WHERE id = $1 AND claimed = FALSE
                ";
                let updated = sqlx::query(query)
                    .bind(code.id)
                    .bind(claim.now)
                    .bind(claim.token_id)
                    .bind(&bind_nonce)
                    .execute(&mut *tx)
                    .instrument(db_span("UPDATE", query))
                    .await
                    .context("failed to mark code claimed")?;

                if updated.rows_affected() != 1 {
                    let _ = tx.rollback().await;
                    return Err(VerifyError::CodeClaimed);
                }

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

                let query = r"
                    INSERT INTO tokens
                        (id, realm_id, code_id, test_type, symptom_date, test_date, created_at, expires_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ";
                sqlx::query(query)
                    .bind(token.id)
                    .bind(token.realm_id)
                    .bind(token.code_id)
                    .bind(token.subject.test_type.as_str())
                    .bind(token.subject.symptom_date)
                    .bind(token.subject.test_date)
                    .bind(token.created_at)
                    .bind(token.expires_at)
                    .execute(&mut *tx)
                    .instrument(db_span("INSERT", query))
                    .await
                    .context("failed to insert verification token")?;

                tx.commit().await.context("commit claim transaction")?;
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
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin token transaction")?;

        let query = r"
            SELECT id, realm_id, code_id, test_type, symptom_date, test_date, created_at,
                   expires_at, used
            FROM tokens
            WHERE id = $1 AND realm_id = $2
            FOR UPDATE
        ";
        let row = sqlx::query(query)
            .bind(token_id)
            .bind(realm_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lock verification token")?;

        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Err(VerifyError::TokenInvalid);
        };
        let mut token = token_from_row(&row)?;
        if let Err(err) = token.check_consumable(now, subject) {
            let _ = tx.rollback().await;
            return Err(err);
        }

        let query = "UPDATE tokens SET used = TRUE, used_at = $2 WHERE id = $1 AND used = FALSE";
        let updated = sqlx::query(query)
            .bind(token_id)
            .bind(now)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to mark token used")?;

        if updated.rows_affected() != 1 {
            let _ = tx.rollback().await;
            return Err(VerifyError::TokenUsed);
        }

        tx.commit().await.context("commit token transaction")?;
        token.used = true;
        Ok(token)
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts, StoreError> {
        let query = "DELETE FROM tokens WHERE expires_at < $1";
        let tokens = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge tokens")?
            .rows_affected();

        let query = "DELETE FROM verification_codes WHERE GREATEST(expires_at, long_expires_at) < $1";
        let codes = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge verification codes")?
            .rows_affected();

        let query = "DELETE FROM quota_buckets WHERE key NOT LIKE 'realm:%' AND reset_at < $1";
        let buckets = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to purge rate limit buckets")?
            .rows_affected();

        Ok(PurgeCounts {
            codes,
            tokens,
            buckets,
        })
    }
}

#[async_trait]
impl RealmStore for PgStore {
    async fn find_app_by_key(&self, key_digest: &str) -> Result<Option<AuthorizedApp>, StoreError> {
        let query = r"
            SELECT id, realm_id, name, api_key_type
            FROM authorized_apps
            WHERE api_key_digest = $1 AND disabled_at IS NULL
        ";
        let row = sqlx::query(query)
            .bind(key_digest)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup authorized app")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let key_type: i16 = row.try_get("api_key_type").context("api_key_type")?;
        let key_type = ApiKeyType::from_db(key_type)
            .ok_or_else(|| anyhow!("unknown api key type {key_type}"))?;

        Ok(Some(AuthorizedApp {
            id: row.try_get("id").context("id")?,
            realm_id: row.try_get("realm_id").context("realm_id")?,
            name: row.try_get("name").context("name")?,
            key_type,
        }))
    }

    async fn find_realm(&self, realm_id: i64) -> Result<Option<Realm>, StoreError> {
        let query = r"
            SELECT id, name, allowed_test_types, require_date, short_code_length,
                   short_code_minutes, long_code_length, long_code_hours, sms_enabled,
                   abuse_prevention_enabled, max_burst, use_realm_certificate_key,
                   certificate_key_id, certificate_issuer, certificate_audience
            FROM realms
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(realm_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup realm")?;

        Ok(row.as_ref().map(realm_from_row).transpose()?)
    }

    async fn set_abuse_prevention(&self, realm_id: i64, enabled: bool) -> Result<(), StoreError> {
        let query = "UPDATE realms SET abuse_prevention_enabled = $2 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(realm_id)
            .bind(enabled)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update realm")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

const LOCK_BUCKET: &str = r"
    SELECT quota_limit, remaining, burst, window_seconds, reset_at
    FROM quota_buckets
    WHERE key = $1
    FOR UPDATE
";

const UPDATE_BUCKET: &str = r"
    UPDATE quota_buckets
    SET quota_limit = $2, remaining = $3, burst = $4, window_seconds = $5, reset_at = $6
    WHERE key = $1
";

impl PgStore {
    /// Lock the bucket row for `key`, creating it first if needed.
    async fn lock_bucket(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: &str,
        default: &QuotaBucket,
    ) -> Result<QuotaBucket> {
        let query = r"
            INSERT INTO quota_buckets (key, quota_limit, remaining, window_seconds, reset_at)
            VALUES ($1, $2, $2, $3, $4)
            ON CONFLICT (key) DO NOTHING
        ";
        sqlx::query(query)
            .bind(key)
            .bind(to_i64(default.limit)?)
            .bind(default.window.num_seconds())
            .bind(default.reset_at)
            .execute(&mut **tx)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to create quota bucket")?;

        let row = sqlx::query(LOCK_BUCKET)
            .bind(key)
            .fetch_one(&mut **tx)
            .instrument(db_span("SELECT", LOCK_BUCKET))
            .await
            .context("failed to lock quota bucket")?;
        bucket_from_row(&row)
    }

    async fn write_bucket(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: &str,
        bucket: &QuotaBucket,
    ) -> Result<()> {
        sqlx::query(UPDATE_BUCKET)
            .bind(key)
            .bind(to_i64(bucket.limit)?)
            .bind(to_i64(bucket.remaining)?)
            .bind(to_i64(bucket.burst)?)
            .bind(bucket.window.num_seconds())
            .bind(bucket.reset_at)
            .execute(&mut **tx)
            .instrument(db_span("UPDATE", UPDATE_BUCKET))
            .await
            .context("failed to update quota bucket")?;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn take(
        &self,
        key: &str,
        default_limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(bool, QuotaBucket), StoreError> {
        let mut tx = self.pool.begin().await.context("begin quota transaction")?;
        let default = QuotaBucket::fresh(default_limit, window, now);
        let mut bucket = Self::lock_bucket(&mut tx, key, &default).await?;
        let taken = bucket.take(now);
        Self::write_bucket(&mut tx, key, &bucket).await?;
        tx.commit().await.context("commit quota transaction")?;
        Ok((taken, bucket))
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
        let mut tx = self.pool.begin().await.context("begin quota transaction")?;
        let default = QuotaBucket::fresh(default_limit, window, now);
        let mut bucket = Self::lock_bucket(&mut tx, key, &default).await?;
        let added = bucket.try_add(amount, max_burst, now);
        Self::write_bucket(&mut tx, key, &bucket).await?;
        tx.commit().await.context("commit quota transaction")?;
        Ok((added, bucket))
    }

    async fn refund(
        &self,
        key: &str,
        reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // reset_at is stored with microsecond precision
        let query = r"
            UPDATE quota_buckets
            SET remaining = remaining + 1
            WHERE key = $1
              AND reset_at BETWEEN $2 - INTERVAL '1 millisecond' AND $2 + INTERVAL '1 millisecond'
              AND reset_at > $3
        ";
        let refunded = sqlx::query(query)
            .bind(key)
            .bind(reset_at)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to refund quota unit")?
            .rows_affected();
        Ok(refunded > 0)
    }

    async fn set(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<QuotaBucket, StoreError> {
        let bucket = QuotaBucket::fresh(limit, window, now);
        let query = r"
            INSERT INTO quota_buckets (key, quota_limit, remaining, window_seconds, reset_at)
            VALUES ($1, $2, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET quota_limit = EXCLUDED.quota_limit,
                remaining = EXCLUDED.remaining,
                burst = 0,
                window_seconds = EXCLUDED.window_seconds,
                reset_at = EXCLUDED.reset_at
        ";
        sqlx::query(query)
            .bind(key)
            .bind(to_i64(limit)?)
            .bind(window.num_seconds())
            .bind(bucket.reset_at)
            .execute(&self.pool)
            .instrument(db_span("UPSERT", query))
            .await
            .context("failed to set quota bucket")?;
        Ok(bucket)
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<QuotaBucket>, StoreError> {
        let query = r"
            SELECT quota_limit, remaining, burst, window_seconds, reset_at
            FROM quota_buckets
            WHERE key = $1
        ";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to read quota bucket")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut bucket = bucket_from_row(&row)?;
        bucket.roll(now);
        Ok(Some(bucket))
    }
}

#[async_trait]
impl LockStore for PgStore {
    async fn try_lock(
        &self,
        name: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = r"
            INSERT INTO lock_status (lock_type, generation, not_before)
            VALUES ($1, 0, to_timestamp(0))
            ON CONFLICT (lock_type) DO NOTHING
        ";
        sqlx::query(query)
            .bind(name)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to create lock row")?;

        let mut tx = self.pool.begin().await.context("begin lock transaction")?;
        let query = "SELECT generation, not_before FROM lock_status WHERE lock_type = $1 FOR UPDATE";
        let row = sqlx::query(query)
            .bind(name)
            .fetch_one(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lock lock row")?;

        let current = LockStatus {
            name: name.to_string(),
            generation: row.try_get("generation").context("generation")?,
            not_before: row.try_get("not_before").context("not_before")?,
        };
        let Some(next) = current.acquire(duration, now) else {
            let _ = tx.rollback().await;
            return Ok(false);
        };

        let query = r"
            UPDATE lock_status
            SET generation = $2, not_before = $3
            WHERE lock_type = $1 AND generation = $4
        ";
        let updated = sqlx::query(query)
            .bind(name)
            .bind(next.generation)
            .bind(next.not_before)
            .bind(current.generation)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to advance lock generation")?;

        if updated.rows_affected() != 1 {
            let _ = tx.rollback().await;
            return Ok(false);
        }
        tx.commit().await.context("commit lock transaction")?;
        Ok(true)
    }

    async fn lock_status(&self, name: &str) -> Result<Option<LockStatus>, StoreError> {
        let query = "SELECT generation, not_before FROM lock_status WHERE lock_type = $1";
        let row = sqlx::query(query)
            .bind(name)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to read lock row")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(LockStatus {
            name: name.to_string(),
            generation: row.try_get("generation").context("generation")?,
            not_before: row.try_get("not_before").context("not_before")?,
        }))
    }
}
