//! Verification code lifecycle.
//!
//! A code is `Created` when issued, becomes `Claimed` exactly once when it is
//! exchanged for a verification token, and is otherwise `Expired` once the
//! window of every path has passed. Stores apply [`evaluate_claim`] inside the
//! same transaction that marks the code claimed, so the decision and the write
//! are linearizable per code.

pub mod generator;
pub mod service;

use crate::{
    error::VerifyError,
    realm::{TestType, TestTypes},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub use service::{CodeService, IssueRequest, IssuedCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CodeState {
    Created,
    Claimed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsStatus {
    Sent,
    Failed,
}

impl SmsStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// A persisted code. Only HMAC digests of the code values are kept.
#[derive(Debug, Clone)]
pub struct VerificationCode {
    pub id: Uuid,
    pub realm_id: i64,
    pub code_hash: String,
    pub long_code_hash: Option<String>,
    pub test_type: TestType,
    pub symptom_date: Option<NaiveDate>,
    pub test_date: Option<NaiveDate>,
    pub issuing_app_id: Option<i64>,
    pub external_issuer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub long_expires_at: DateTime<Utc>,
    pub claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub token_id: Option<Uuid>,
    pub nonce: Option<String>,
}

impl VerificationCode {
    #[must_use]
    pub fn expiry(&self, kind: CodeKind) -> DateTime<Utc> {
        match kind {
            CodeKind::Short => self.expires_at,
            CodeKind::Long => self.long_expires_at,
        }
    }

    /// Which path a presented digest matched, if any.
    #[must_use]
    pub fn kind_of(&self, digest: &str) -> Option<CodeKind> {
        if self.code_hash == digest {
            Some(CodeKind::Short)
        } else if self.long_code_hash.as_deref() == Some(digest) {
            Some(CodeKind::Long)
        } else {
            None
        }
    }

    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> CodeState {
        if self.claimed {
            CodeState::Claimed
        } else if now >= self.expires_at && now >= self.long_expires_at {
            CodeState::Expired
        } else {
            CodeState::Created
        }
    }
}

/// Outcome of a claim attempt against a locked code row.
#[derive(Debug)]
pub enum ClaimDecision {
    /// Mark claimed and create the token, binding `bind_nonce` if present.
    Claim { bind_nonce: Option<String> },
    /// Reject, but still persist `bind_nonce` so later attempts from another
    /// device are refused.
    Reject {
        bind_nonce: Option<String>,
        error: VerifyError,
    },
}

/// Decide whether `code`, presented through `kind`, may be claimed now.
///
/// Checks run in order: the path's own expiry, prior claim, device nonce,
/// then the caller's accepted test types.
#[must_use]
pub fn evaluate_claim(
    code: &VerificationCode,
    kind: CodeKind,
    now: DateTime<Utc>,
    nonce: Option<&str>,
    accepted: TestTypes,
) -> ClaimDecision {
    if now >= code.expiry(kind) {
        return ClaimDecision::Reject {
            bind_nonce: None,
            error: VerifyError::CodeExpired,
        };
    }

    if code.claimed {
        return ClaimDecision::Reject {
            bind_nonce: None,
            error: VerifyError::CodeClaimed,
        };
    }

    let bind_nonce = match (code.nonce.as_deref(), nonce) {
        (Some(bound), presented) if presented != Some(bound) => {
            return ClaimDecision::Reject {
                bind_nonce: None,
                error: VerifyError::NonceMismatch,
            };
        }
        (None, Some(presented)) => Some(presented.to_string()),
        _ => None,
    };

    if !accepted.contains(code.test_type) {
        return ClaimDecision::Reject {
            bind_nonce,
            error: VerifyError::UnsupportedTestType(code.test_type.to_string()),
        };
    }

    ClaimDecision::Claim { bind_nonce }
}
