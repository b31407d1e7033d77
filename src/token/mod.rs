//! Verification tokens: single-use, short-lived proof that a code was claimed.

pub(crate) mod issuer;

pub use issuer::{IssuedToken, PresentedToken, TokenIssuer, VerifyRequest};

use crate::{error::VerifyError, realm::TestType};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// What a token attests to. Encoded as the JWT `sub`:
/// `<test type>.<symptom date>.<test date>`, with empty segments for absent
/// dates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub test_type: TestType,
    pub symptom_date: Option<NaiveDate>,
    pub test_date: Option<NaiveDate>,
}

impl TokenSubject {
    /// # Errors
    /// Returns `TokenInvalid` when the subject is not in the expected shape.
    pub fn parse(subject: &str) -> Result<Self, VerifyError> {
        let mut parts = subject.split('.');
        let test_type = parts.next().ok_or(VerifyError::TokenInvalid)?;
        let symptom = parts.next().ok_or(VerifyError::TokenInvalid)?;
        let test = parts.next().ok_or(VerifyError::TokenInvalid)?;
        if parts.next().is_some() {
            return Err(VerifyError::TokenInvalid);
        }

        Ok(Self {
            test_type: TestType::parse(test_type).map_err(|_| VerifyError::TokenInvalid)?,
            symptom_date: parse_optional_date(symptom)?,
            test_date: parse_optional_date(test)?,
        })
    }
}

fn parse_optional_date(value: &str) -> Result<Option<NaiveDate>, VerifyError> {
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map(Some)
        .map_err(|_| VerifyError::TokenInvalid)
}

impl fmt::Display for TokenSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symptom = self
            .symptom_date
            .map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_default();
        let test = self
            .test_date
            .map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_default();
        write!(f, "{}.{symptom}.{test}", self.test_type)
    }
}

#[derive(Debug, Clone)]
pub struct VerificationToken {
    pub id: Uuid,
    pub realm_id: i64,
    pub code_id: Option<Uuid>,
    pub subject: TokenSubject,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl VerificationToken {
    /// Check a locked token row before marking it used.
    ///
    /// # Errors
    /// `TokenUsed` if already consumed, `TokenExpired` past expiry, and
    /// `TokenInvalid` when the presented subject differs from the stored one.
    pub fn check_consumable(
        &self,
        now: DateTime<Utc>,
        presented: &TokenSubject,
    ) -> Result<(), VerifyError> {
        if self.used {
            return Err(VerifyError::TokenUsed);
        }
        if now >= self.expires_at {
            return Err(VerifyError::TokenExpired);
        }
        if &self.subject != presented {
            return Err(VerifyError::TokenInvalid);
        }
        Ok(())
    }
}

/// Claims carried by the signed verification token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub sub: String,
}
