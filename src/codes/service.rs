//! Issue, inspect, expire and claim verification codes.

use super::{CodeState, SmsStatus, VerificationCode, generator};
use crate::{
    config::ServiceConfig,
    digest::KeyedDigest,
    error::VerifyError,
    quota::{QuotaDecision, QuotaLimiter},
    realm::{DatePolicy, Realm, TestType, TestTypes},
    sms::{SmsMessage, SmsSender},
    store::{ClaimRequest, StoreError, VerificationStore},
    token::VerificationToken,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";
const MAX_TZ_OFFSET_MINUTES: i32 = 14 * 60;

#[derive(Debug, Clone, Default)]
pub struct IssueRequest {
    pub test_type: String,
    pub symptom_date: Option<String>,
    pub test_date: Option<String>,
    /// Minutes east of UTC at the issuer, used to find "today".
    pub tz_offset: i32,
    pub external_issuer_id: Option<String>,
    pub phone: Option<String>,
}

/// Plaintext codes are only ever returned here, once.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub id: Uuid,
    pub code: String,
    pub long_code: Option<String>,
    pub test_type: TestType,
    pub expires_at: DateTime<Utc>,
    pub long_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CodeStatus {
    pub state: CodeState,
    pub claimed: bool,
    pub expires_at: DateTime<Utc>,
    pub long_expires_at: DateTime<Utc>,
}

impl CodeStatus {
    fn of(code: &VerificationCode, now: DateTime<Utc>) -> Self {
        Self {
            state: code.state(now),
            claimed: code.claimed,
            expires_at: code.expires_at,
            long_expires_at: code.long_expires_at,
        }
    }
}

fn valid_phone(phone: &str) -> bool {
    Regex::new(r"^\+?[1-9][0-9]{6,14}$").is_ok_and(|re| re.is_match(phone))
}

fn normalize_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '(' && *c != ')')
        .collect()
}

/// Parse an ISO date and check it against the issuer's local "today".
///
/// # Errors
/// `InvalidDate` when unparsable, older than `max_age` or later than
/// `tolerance` past today.
pub fn validate_date(
    value: &str,
    now: DateTime<Utc>,
    tz_offset: i32,
    max_age: Duration,
    tolerance: Duration,
) -> Result<NaiveDate, VerifyError> {
    let date = NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|_| VerifyError::InvalidDate(format!("{value} is not YYYY-MM-DD")))?;
    let today = (now + Duration::minutes(i64::from(tz_offset))).date_naive();

    if date < today - max_age {
        return Err(VerifyError::InvalidDate(format!("{value} is too old")));
    }
    if date > today + tolerance {
        return Err(VerifyError::InvalidDate(format!("{value} is in the future")));
    }
    Ok(date)
}

pub struct CodeService {
    store: Arc<dyn VerificationStore>,
    quota: QuotaLimiter,
    digest: KeyedDigest,
    sms: Arc<dyn SmsSender>,
    config: Arc<ServiceConfig>,
}

impl CodeService {
    #[must_use]
    pub fn new(
        store: Arc<dyn VerificationStore>,
        quota: QuotaLimiter,
        digest: KeyedDigest,
        sms: Arc<dyn SmsSender>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            quota,
            digest,
            sms,
            config,
        }
    }

    #[must_use]
    pub fn quota(&self) -> &QuotaLimiter {
        &self.quota
    }

    /// Issue a new code for `realm`.
    ///
    /// Validation runs first, then the quota is consumed, then the code is
    /// generated and inserted, retrying on digest collisions.
    ///
    /// # Errors
    /// Validation errors, `QuotaExceeded`, `CodeGenerationExhausted` or
    /// `Internal`.
    #[instrument(skip(self, realm, request), fields(realm_id = realm.id))]
    pub async fn issue(
        &self,
        realm: &Realm,
        app_id: Option<i64>,
        request: &IssueRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, VerifyError> {
        let test_type = TestType::parse(&request.test_type)?;
        if !realm.allowed_test_types.contains(test_type) {
            return Err(VerifyError::UnsupportedTestType(test_type.to_string()));
        }

        if request.tz_offset.abs() > MAX_TZ_OFFSET_MINUTES {
            return Err(VerifyError::InvalidDate(format!(
                "tzOffset {} out of range",
                request.tz_offset
            )));
        }

        let symptom_date = self.optional_date(request.symptom_date.as_deref(), request.tz_offset, now)?;
        let test_date = self.optional_date(request.test_date.as_deref(), request.tz_offset, now)?;
        if realm.date_policy == DatePolicy::Required && symptom_date.is_none() && test_date.is_none() {
            return Err(VerifyError::MissingDate);
        }

        let phone = request
            .phone
            .as_deref()
            .map(normalize_phone)
            .filter(|p| !p.is_empty());
        let phone = match phone {
            Some(phone) if realm.sms_enabled => {
                if !valid_phone(&phone) {
                    return Err(VerifyError::InvalidPhone);
                }
                Some(phone)
            }
            Some(_) => {
                debug!("sms not enabled for realm, ignoring phone");
                None
            }
            None => None,
        };

        let consumed = if realm.abuse_prevention_enabled {
            let decision = self.quota.check_and_consume(realm.id, now).await?;
            if !decision.allowed {
                return Err(VerifyError::QuotaExceeded);
            }
            Some(decision)
        } else {
            None
        };

        let issued = match self
            .insert_unique(realm, app_id, request, test_type, symptom_date, test_date, now)
            .await
        {
            Ok(issued) => issued,
            Err(err) => {
                if let Some(decision) = consumed {
                    self.refund_quota(realm.id, &decision, now).await;
                }
                return Err(err);
            }
        };
        info!(code_id = %issued.id, test_type = %test_type, "verification code issued");

        if let Some(phone) = phone {
            self.send_sms(realm, phone, &issued);
        }

        Ok(issued)
    }

    /// Return the unit of a failed issuance. Refund failures are logged only.
    async fn refund_quota(&self, realm_id: i64, decision: &QuotaDecision, now: DateTime<Utc>) {
        match self.quota.refund(realm_id, decision, now).await {
            Ok(true) => debug!(realm_id, "quota unit refunded"),
            Ok(false) => debug!(realm_id, "quota window rolled over, nothing to refund"),
            Err(err) => warn!(realm_id, "quota refund failed: {err}"),
        }
    }

    fn optional_date(
        &self,
        value: Option<&str>,
        tz_offset: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<NaiveDate>, VerifyError> {
        value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| {
                validate_date(
                    v,
                    now,
                    tz_offset,
                    self.config.max_date_age(),
                    self.config.future_tolerance(),
                )
            })
            .transpose()
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_unique(
        &self,
        realm: &Realm,
        app_id: Option<i64>,
        request: &IssueRequest,
        test_type: TestType,
        symptom_date: Option<NaiveDate>,
        test_date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, VerifyError> {
        let retries = self.config.code_retries();
        for attempt in 1..=retries {
            let code = generator::short_code(realm.short_code_length)?;
            let long_code = if realm.long_code_length > 0 {
                Some(generator::long_code(realm.long_code_length)?)
            } else {
                None
            };

            let record = VerificationCode {
                id: Uuid::new_v4(),
                realm_id: realm.id,
                code_hash: self.digest.digest(&code),
                long_code_hash: long_code.as_deref().map(|c| self.digest.digest(c)),
                test_type,
                symptom_date,
                test_date,
                issuing_app_id: app_id,
                external_issuer_id: request.external_issuer_id.clone(),
                created_at: now,
                expires_at: now + realm.short_code_ttl,
                long_expires_at: now + realm.long_code_ttl.max(realm.short_code_ttl),
                claimed: false,
                claimed_at: None,
                token_id: None,
                nonce: None,
            };

            match self.store.insert_code(&record).await {
                Ok(()) => {
                    return Ok(IssuedCode {
                        id: record.id,
                        code,
                        long_code,
                        test_type,
                        expires_at: record.expires_at,
                        long_expires_at: record.long_expires_at,
                    });
                }
                Err(StoreError::Conflict) => {
                    warn!(attempt, "verification code collision, regenerating");
                }
                Err(err) => return Err(err.into()),
            }
        }
        error!(retries, "could not generate a unique verification code");
        Err(VerifyError::CodeGenerationExhausted(retries))
    }

    fn send_sms(&self, realm: &Realm, phone: String, issued: &IssuedCode) {
        let link = issued.long_code.as_deref().map(|c| format!("ens://v?c={c}"));
        let message = SmsMessage::for_code(realm.id, phone, &realm.name, &issued.code, link.as_deref());
        let sender = self.sms.clone();
        let store = self.store.clone();
        let code_id = issued.id;

        tokio::spawn(async move {
            let status = match sender.send(&message).await {
                Ok(()) => SmsStatus::Sent,
                Err(err) => {
                    error!(%code_id, "sms delivery failed: {err:#}");
                    SmsStatus::Failed
                }
            };
            if let Err(err) = store.record_sms_status(code_id, status).await {
                error!(%code_id, "failed to record sms status: {err:#}");
            }
        });
    }

    /// Claim status of a code issued in `realm_id`. Never returns code values.
    ///
    /// # Errors
    /// `UuidNotFound` for unknown ids or ids of another realm.
    #[instrument(skip(self))]
    pub async fn check_status(
        &self,
        realm_id: i64,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CodeStatus, VerifyError> {
        let code = self
            .store
            .find_code(realm_id, id)
            .await?
            .ok_or(VerifyError::UuidNotFound)?;
        Ok(CodeStatus::of(&code, now))
    }

    /// Force an unclaimed code to expire on both paths.
    ///
    /// # Errors
    /// `UuidNotFound`, `CodeClaimed` or `CodeExpired` when there is nothing to
    /// expire.
    #[instrument(skip(self))]
    pub async fn expire(
        &self,
        realm_id: i64,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CodeStatus, VerifyError> {
        let code = self
            .store
            .find_code(realm_id, id)
            .await?
            .ok_or(VerifyError::UuidNotFound)?;
        match code.state(now) {
            CodeState::Claimed => return Err(VerifyError::CodeClaimed),
            CodeState::Expired => return Err(VerifyError::CodeExpired),
            CodeState::Created => {}
        }

        let code = self
            .store
            .expire_code(realm_id, id, now)
            .await?
            .ok_or(VerifyError::UuidNotFound)?;
        info!(code_id = %id, "verification code expired by admin");
        Ok(CodeStatus::of(&code, now))
    }

    /// Exchange a short or long code for a token row. The caller signs it.
    ///
    /// # Errors
    /// `CodeNotFound`, `CodeExpired`, `CodeClaimed`, `NonceMismatch`,
    /// `UnsupportedTestType` or `Internal`.
    #[instrument(skip(self, code, nonce))]
    pub async fn claim(
        &self,
        realm_id: i64,
        code: &str,
        accepted: TestTypes,
        nonce: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<VerificationToken, VerifyError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(VerifyError::CodeNotFound);
        }

        let request = ClaimRequest {
            realm_id,
            code_digest: self.digest.digest(code),
            accepted,
            nonce: nonce.map(str::to_string).filter(|n| !n.is_empty()),
            token_id: Uuid::new_v4(),
            token_expires_at: now + self.config.token_ttl(),
            now,
        };
        let token = self.store.claim_code(&request).await?;
        info!(token_id = %token.id, "verification code claimed");
        Ok(token)
    }
}
