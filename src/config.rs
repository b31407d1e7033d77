//! Runtime tunables for the verification flows.

use chrono::Duration;

const DEFAULT_TOKEN_TTL_MINUTES: i64 = 30;
const DEFAULT_CERTIFICATE_TTL_MINUTES: i64 = 15;
const DEFAULT_CODE_RETRIES: usize = 6;
const DEFAULT_MAX_DATE_AGE_DAYS: i64 = 14;
const DEFAULT_FUTURE_TOLERANCE_DAYS: i64 = 1;
const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;
const DEFAULT_DAILY_QUOTA: u64 = 1000;
const DEFAULT_API_RATE_LIMIT: u64 = 60;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    token_issuer: String,
    token_audience: String,
    token_ttl: Duration,
    token_signing_key: String,
    certificate_issuer: String,
    certificate_audience: String,
    certificate_ttl: Duration,
    certificate_signing_key: String,
    code_retries: usize,
    max_date_age: Duration,
    future_tolerance: Duration,
    signer_cache_ttl: std::time::Duration,
    api_key_cache_ttl: std::time::Duration,
    default_daily_quota: u64,
    quota_window: Duration,
    api_rate_limit: u64,
    api_rate_window: Duration,
}

impl ServiceConfig {
    #[must_use]
    pub fn new(token_signing_key: String, certificate_signing_key: String) -> Self {
        Self {
            token_issuer: "enverify".to_string(),
            token_audience: "enverify".to_string(),
            token_ttl: Duration::minutes(DEFAULT_TOKEN_TTL_MINUTES),
            token_signing_key,
            certificate_issuer: "enverify".to_string(),
            certificate_audience: "exposure-notifications-server".to_string(),
            certificate_ttl: Duration::minutes(DEFAULT_CERTIFICATE_TTL_MINUTES),
            certificate_signing_key,
            code_retries: DEFAULT_CODE_RETRIES,
            max_date_age: Duration::days(DEFAULT_MAX_DATE_AGE_DAYS),
            future_tolerance: Duration::days(DEFAULT_FUTURE_TOLERANCE_DAYS),
            signer_cache_ttl: std::time::Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
            api_key_cache_ttl: std::time::Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
            default_daily_quota: DEFAULT_DAILY_QUOTA,
            quota_window: Duration::hours(24),
            api_rate_limit: DEFAULT_API_RATE_LIMIT,
            api_rate_window: Duration::minutes(1),
        }
    }

    #[must_use]
    pub fn with_token_issuer(mut self, issuer: String, audience: String) -> Self {
        self.token_issuer = issuer;
        self.token_audience = audience;
        self
    }

    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_certificate_issuer(mut self, issuer: String, audience: String) -> Self {
        self.certificate_issuer = issuer;
        self.certificate_audience = audience;
        self
    }

    #[must_use]
    pub fn with_certificate_ttl(mut self, ttl: Duration) -> Self {
        self.certificate_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_code_retries(mut self, retries: usize) -> Self {
        self.code_retries = retries.max(1);
        self
    }

    #[must_use]
    pub fn with_max_date_age(mut self, age: Duration) -> Self {
        self.max_date_age = age;
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.signer_cache_ttl = ttl;
        self.api_key_cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_default_daily_quota(mut self, limit: u64) -> Self {
        self.default_daily_quota = limit;
        self
    }

    #[must_use]
    pub fn with_api_rate_limit(mut self, per_window: u64, window: Duration) -> Self {
        self.api_rate_limit = per_window;
        self.api_rate_window = window;
        self
    }

    #[must_use]
    pub fn token_issuer(&self) -> &str {
        &self.token_issuer
    }

    #[must_use]
    pub fn token_audience(&self) -> &str {
        &self.token_audience
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    #[must_use]
    pub fn token_signing_key(&self) -> &str {
        &self.token_signing_key
    }

    #[must_use]
    pub fn certificate_issuer(&self) -> &str {
        &self.certificate_issuer
    }

    #[must_use]
    pub fn certificate_audience(&self) -> &str {
        &self.certificate_audience
    }

    #[must_use]
    pub fn certificate_ttl(&self) -> Duration {
        self.certificate_ttl
    }

    #[must_use]
    pub fn certificate_signing_key(&self) -> &str {
        &self.certificate_signing_key
    }

    #[must_use]
    pub fn code_retries(&self) -> usize {
        self.code_retries
    }

    #[must_use]
    pub fn max_date_age(&self) -> Duration {
        self.max_date_age
    }

    #[must_use]
    pub fn future_tolerance(&self) -> Duration {
        self.future_tolerance
    }

    #[must_use]
    pub fn signer_cache_ttl(&self) -> std::time::Duration {
        self.signer_cache_ttl
    }

    #[must_use]
    pub fn api_key_cache_ttl(&self) -> std::time::Duration {
        self.api_key_cache_ttl
    }

    #[must_use]
    pub fn default_daily_quota(&self) -> u64 {
        self.default_daily_quota
    }

    #[must_use]
    pub fn quota_window(&self) -> Duration {
        self.quota_window
    }

    #[must_use]
    pub fn api_rate_limit(&self) -> u64 {
        self.api_rate_limit
    }

    #[must_use]
    pub fn api_rate_window(&self) -> Duration {
        self.api_rate_window
    }
}
