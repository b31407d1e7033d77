//! The uniform `{"error", "errorCode"}` envelope.
//!
//! Device and admin callers see different detail for the same domain error:
//! devices never learn whether a code was unknown or merely expired.

use crate::error::VerifyError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

pub const CODE_INVALID: &str = "code_invalid";
pub const UNAUTHORIZED: &str = "unauthorized";

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub error_code: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, UNAUTHORIZED, "invalid API key")
    }

    #[must_use]
    pub fn forbidden(message: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, UNAUTHORIZED, message)
    }

    #[must_use]
    pub fn missing_payload() -> Self {
        Self::from_error(&VerifyError::Unparsable("missing payload".to_string()))
    }

    /// Mapping for device-facing endpoints. Unknown and expired codes share
    /// one envelope.
    #[must_use]
    pub fn device(err: VerifyError) -> Self {
        match err {
            VerifyError::CodeNotFound | VerifyError::CodeExpired => Self::new(
                StatusCode::BAD_REQUEST,
                CODE_INVALID,
                "verification code invalid or expired",
            ),
            other => Self::from_error(&other),
        }
    }

    /// Mapping for admin endpoints, which report every state distinctly.
    #[must_use]
    pub fn admin(err: VerifyError) -> Self {
        Self::from_error(&err)
    }

    fn from_error(err: &VerifyError) -> Self {
        if err.is_internal() {
            error!("request failed: {err:#}");
            return Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.code(),
                "internal server error",
            );
        }

        let status = match err {
            VerifyError::QuotaExceeded | VerifyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.code(), err.to_string())
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            error_code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use http_body_util::BodyExt;

    #[test]
    fn device_merges_unknown_and_expired_codes() {
        for err in [VerifyError::CodeNotFound, VerifyError::CodeExpired] {
            let mapped = ApiError::device(err);
            assert_eq!(mapped.status(), StatusCode::BAD_REQUEST);
            assert_eq!(mapped.code(), CODE_INVALID);
        }
        assert_eq!(ApiError::device(VerifyError::TokenUsed).code(), "token_used");
    }

    #[test]
    fn admin_keeps_states_distinct() {
        assert_eq!(ApiError::admin(VerifyError::CodeExpired).code(), "code_expired");
        assert_eq!(ApiError::admin(VerifyError::CodeClaimed).code(), "code_claimed");
        assert_eq!(
            ApiError::admin(VerifyError::UuidNotFound).code(),
            "uuid_not_found"
        );
    }

    #[test]
    fn statuses_follow_error_class() {
        assert_eq!(
            ApiError::admin(VerifyError::QuotaExceeded).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::device(VerifyError::RateLimited).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::admin(VerifyError::MissingDate).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::unauthorized().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::forbidden("no").status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn internal_errors_hide_detail() -> Result<()> {
        let response =
            ApiError::device(VerifyError::Internal(anyhow!("password=hunter2"))).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await?.to_bytes();
        let body: ErrorBody = serde_json::from_slice(&bytes)?;
        assert_eq!(body.error, "internal server error");
        assert_eq!(body.error_code, "internal_server_error");
        Ok(())
    }
}
