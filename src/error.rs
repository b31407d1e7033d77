//! Domain error taxonomy shared by the code, token and certificate flows.
//!
//! Variants fall into four classes: validation (rejected before any state
//! mutation), policy, protocol state, and infrastructure. Only the last class
//! carries an underlying cause; it is logged server-side and surfaced to
//! callers as a generic internal error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("unparsable request: {0}")]
    Unparsable(String),
    #[error("invalid test type: {0}")]
    InvalidTestType(String),
    #[error("test type not allowed: {0}")]
    UnsupportedTestType(String),
    #[error("missing date")]
    MissingDate,
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("invalid phone number")]
    InvalidPhone,

    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("burst of {requested} exceeds remaining realm allowance of {max}")]
    BurstExceeded { requested: u64, max: u64 },
    #[error("rate limited")]
    RateLimited,

    #[error("verification code not found")]
    CodeNotFound,
    #[error("verification code expired")]
    CodeExpired,
    #[error("verification code already claimed")]
    CodeClaimed,
    #[error("nonce does not match the one bound to this code")]
    NonceMismatch,
    #[error("verification token invalid")]
    TokenInvalid,
    #[error("verification token expired")]
    TokenExpired,
    #[error("verification token already used")]
    TokenUsed,
    #[error("exposure key HMAC invalid")]
    HmacInvalid,
    #[error("uuid not found")]
    UuidNotFound,

    #[error("code generation exhausted after {0} attempts")]
    CodeGenerationExhausted(usize),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl VerifyError {
    /// Stable machine-readable code for the error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unparsable(_) => "unparsable_request",
            Self::InvalidTestType(_) => "invalid_test_type",
            Self::UnsupportedTestType(_) => "unsupported_test_type",
            Self::MissingDate => "missing_date",
            Self::InvalidDate(_) => "invalid_date",
            Self::InvalidPhone => "invalid_phone",
            Self::QuotaExceeded => "quota_exceeded",
            Self::BurstExceeded { .. } => "burst_exceeded",
            Self::RateLimited => "rate_limited",
            Self::CodeNotFound => "code_not_found",
            Self::CodeExpired => "code_expired",
            Self::CodeClaimed => "code_claimed",
            Self::NonceMismatch => "nonce_mismatch",
            Self::TokenInvalid => "token_invalid",
            Self::TokenExpired => "token_expired",
            Self::TokenUsed => "token_used",
            Self::HmacInvalid => "hmac_invalid",
            Self::UuidNotFound => "uuid_not_found",
            Self::CodeGenerationExhausted(_) | Self::Internal(_) => "internal_server_error",
        }
    }

    /// Infrastructure failures are never shown to callers in detail.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::CodeGenerationExhausted(_) | Self::Internal(_))
    }
}

impl From<crate::store::StoreError> for VerifyError {
    fn from(err: crate::store::StoreError) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_share_a_code() {
        let exhausted = VerifyError::CodeGenerationExhausted(6);
        let internal = VerifyError::Internal(anyhow::anyhow!("db down"));
        assert_eq!(exhausted.code(), "internal_server_error");
        assert_eq!(internal.code(), "internal_server_error");
        assert!(exhausted.is_internal());
        assert!(internal.is_internal());
    }

    #[test]
    fn protocol_errors_are_user_safe() {
        for err in [
            VerifyError::CodeExpired,
            VerifyError::CodeClaimed,
            VerifyError::TokenUsed,
            VerifyError::QuotaExceeded,
        ] {
            assert!(!err.is_internal());
        }
        assert_eq!(VerifyError::TokenUsed.to_string(), "verification token already used");
    }
}
