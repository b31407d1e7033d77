//! Realm policy and authorized apps.
//!
//! A realm is one health authority. Everything that varies per tenant (allowed
//! test types, code lengths and lifetimes, date policy, quota bounds, signing
//! key) lives on [`Realm`] and is passed explicitly into the issuance and
//! claim paths.

use crate::error::VerifyError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum TestType {
    Confirmed,
    Likely,
    Negative,
    UserReport,
}

impl TestType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Likely => "likely",
            Self::Negative => "negative",
            Self::UserReport => "user-report",
        }
    }

    /// Parse the wire name of a test type (case-insensitive).
    ///
    /// # Errors
    /// Returns `InvalidTestType` for unknown names.
    pub fn parse(value: &str) -> Result<Self, VerifyError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "confirmed" => Ok(Self::Confirmed),
            "likely" => Ok(Self::Likely),
            "negative" => Ok(Self::Negative),
            "user-report" => Ok(Self::UserReport),
            other => Err(VerifyError::InvalidTestType(other.to_string())),
        }
    }

    #[must_use]
    pub fn flag(self) -> TestTypes {
        match self {
            Self::Confirmed => TestTypes::CONFIRMED,
            Self::Likely => TestTypes::LIKELY,
            Self::Negative => TestTypes::NEGATIVE,
            Self::UserReport => TestTypes::USER_REPORT,
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bit set of test types, stored as a small integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TestTypes(u8);

impl TestTypes {
    pub const CONFIRMED: Self = Self(1);
    pub const LIKELY: Self = Self(1 << 1);
    pub const NEGATIVE: Self = Self(1 << 2);
    pub const USER_REPORT: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    #[must_use]
    pub fn from_bits(bits: i16) -> Self {
        Self(u8::try_from(bits).unwrap_or(0) & Self::ALL.0)
    }

    #[must_use]
    pub fn bits(self) -> i16 {
        i16::from(self.0)
    }

    #[must_use]
    pub fn contains(self, test_type: TestType) -> bool {
        self.0 & test_type.flag().0 != 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Resolve the test types a device is willing to accept.
    ///
    /// Accepting a weaker diagnosis implies accepting every stronger one:
    /// nothing (or `confirmed`) means confirmed only, `likely` adds likely,
    /// `negative` adds likely and negative. `user-report` only adds itself.
    ///
    /// # Errors
    /// Returns `InvalidTestType` when an entry is not a known test type.
    pub fn accepted<S: AsRef<str>>(requested: &[S]) -> Result<Self, VerifyError> {
        let mut accepted = Self::CONFIRMED;
        for name in requested {
            accepted = match TestType::parse(name.as_ref())? {
                TestType::Confirmed => accepted,
                TestType::Likely => accepted.union(Self::LIKELY),
                TestType::Negative => accepted.union(Self::LIKELY).union(Self::NEGATIVE),
                TestType::UserReport => accepted.union(Self::USER_REPORT),
            };
        }
        Ok(accepted)
    }
}

/// Whether symptom/test dates must be supplied at issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatePolicy {
    #[default]
    Optional,
    Required,
}

#[derive(Debug, Clone)]
pub struct Realm {
    pub id: i64,
    pub name: String,
    pub allowed_test_types: TestTypes,
    pub date_policy: DatePolicy,
    pub short_code_length: usize,
    pub short_code_ttl: Duration,
    pub long_code_length: usize,
    pub long_code_ttl: Duration,
    pub sms_enabled: bool,
    pub abuse_prevention_enabled: bool,
    pub max_burst: u64,
    pub use_realm_certificate_key: bool,
    pub certificate_key_id: Option<String>,
    pub certificate_issuer: Option<String>,
    pub certificate_audience: Option<String>,
}

impl Realm {
    /// Realm with the stock policy used by new tenants.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            allowed_test_types: TestTypes::CONFIRMED.union(TestTypes::LIKELY),
            date_policy: DatePolicy::Optional,
            short_code_length: 8,
            short_code_ttl: Duration::minutes(15),
            long_code_length: 16,
            long_code_ttl: Duration::hours(24),
            sms_enabled: false,
            abuse_prevention_enabled: false,
            max_burst: 100,
            use_realm_certificate_key: false,
            certificate_key_id: None,
            certificate_issuer: None,
            certificate_audience: None,
        }
    }

    /// Key id of the realm's own certificate signer, when it opted in.
    #[must_use]
    pub fn custom_certificate_key(&self) -> Option<&str> {
        if self.use_realm_certificate_key {
            self.certificate_key_id.as_deref().filter(|id| !id.is_empty())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyType {
    Admin,
    Device,
}

impl ApiKeyType {
    #[must_use]
    pub fn from_db(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Admin),
            1 => Some(Self::Device),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_db(self) -> i16 {
        match self {
            Self::Admin => 0,
            Self::Device => 1,
        }
    }
}

/// An API key holder bound to a single realm.
#[derive(Debug, Clone)]
pub struct AuthorizedApp {
    pub id: i64,
    pub realm_id: i64,
    pub name: String,
    pub key_type: ApiKeyType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn accepted_defaults_to_confirmed() -> Result<()> {
        let accepted = TestTypes::accepted::<&str>(&[])?;
        assert!(accepted.contains(TestType::Confirmed));
        assert!(!accepted.contains(TestType::Likely));
        Ok(())
    }

    #[test]
    fn accepted_negative_implies_likely() -> Result<()> {
        let accepted = TestTypes::accepted(&["negative"])?;
        assert!(accepted.contains(TestType::Confirmed));
        assert!(accepted.contains(TestType::Likely));
        assert!(accepted.contains(TestType::Negative));
        assert!(!accepted.contains(TestType::UserReport));
        Ok(())
    }

    #[test]
    fn accepted_user_report_is_additive() -> Result<()> {
        let accepted = TestTypes::accepted(&["user-report"])?;
        assert!(accepted.contains(TestType::Confirmed));
        assert!(accepted.contains(TestType::UserReport));
        assert!(!accepted.contains(TestType::Likely));
        Ok(())
    }

    #[test]
    fn accepted_rejects_unknown() {
        let result = TestTypes::accepted(&["positive"]);
        assert!(matches!(result, Err(VerifyError::InvalidTestType(_))));
    }

    #[test]
    fn bits_round_trip_through_column() {
        let set = TestTypes::CONFIRMED.union(TestTypes::NEGATIVE);
        assert_eq!(TestTypes::from_bits(set.bits()), set);
        assert_eq!(TestTypes::from_bits(0x7f), TestTypes::ALL);
    }

    #[test]
    fn custom_key_requires_opt_in() {
        let mut realm = Realm::new(1, "state");
        realm.certificate_key_id = Some("realm-1".to_string());
        assert_eq!(realm.custom_certificate_key(), None);
        realm.use_realm_certificate_key = true;
        assert_eq!(realm.custom_certificate_key(), Some("realm-1"));
    }
}
