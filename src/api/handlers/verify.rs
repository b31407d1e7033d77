use crate::{
    api::{
        AppState,
        error::{ApiError, ErrorBody},
        handlers::auth::authenticate,
    },
    realm::ApiKeyType,
    token::VerifyRequest,
};
use axum::{
    extract::{Extension, Json},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCodeRequest {
    pub verification_code: String,
    #[serde(default)]
    pub accept_test_types: Vec<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCodeResponse {
    pub verification_token: String,
    pub test_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptom_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_date: Option<NaiveDate>,
    pub expires_at: DateTime<Utc>,
}

#[utoipa::path(
    post,
    path = "/api/verify",
    request_body = VerifyCodeRequest,
    responses(
        (status = 200, description = "Code exchanged for a verification token", body = VerifyCodeResponse),
        (status = 400, description = "Code invalid, expired, claimed or not accepted", body = ErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 403, description = "Not a device key", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
        (status = 500, description = "Internal error", body = ErrorBody),
    ),
    tag = "device"
)]
#[instrument(skip(state, headers, payload))]
pub async fn verify(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<VerifyCodeRequest>>,
) -> impl IntoResponse {
    let now = Utc::now();
    let (_app, realm) = match authenticate(&state, &headers, ApiKeyType::Device, now).await {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };
    let Some(Json(request)) = payload else {
        return ApiError::missing_payload().into_response();
    };

    let request = VerifyRequest {
        code: request.verification_code,
        accept_test_types: request.accept_test_types,
        nonce: request.nonce,
    };

    match state.tokens.verify_code(&realm, &request, now).await {
        Ok(issued) => {
            let response = VerifyCodeResponse {
                verification_token: issued.token,
                test_type: issued.test_type.as_str().to_string(),
                symptom_date: issued.symptom_date,
                test_date: issued.test_date,
                expires_at: issued.expires_at,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => ApiError::device(err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        error::CODE_INVALID,
        tests::{DEVICE_KEY, fixture, issue_code, json_body, key_headers},
    };
    use anyhow::Result;

    fn request(code: &str) -> Option<Json<VerifyCodeRequest>> {
        Some(Json(VerifyCodeRequest {
            verification_code: code.to_string(),
            ..VerifyCodeRequest::default()
        }))
    }

    #[tokio::test]
    async fn device_exchanges_code_once() -> Result<()> {
        let fixture = fixture().await?;
        let issued = issue_code(&fixture, "confirmed").await?;

        let response = verify(
            key_headers(DEVICE_KEY),
            Extension(fixture.state.clone()),
            request(&issued.verification_code),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body: VerifyCodeResponse = json_body(response).await?;
        assert_eq!(body.test_type, "confirmed");
        assert!(body.symptom_date.is_some());

        let response = verify(
            key_headers(DEVICE_KEY),
            Extension(fixture.state.clone()),
            request(&issued.verification_code),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = json_body(response).await?;
        assert_eq!(body.error_code, "code_claimed");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_code_is_merged_with_expired() -> Result<()> {
        let fixture = fixture().await?;
        let response = verify(
            key_headers(DEVICE_KEY),
            Extension(fixture.state.clone()),
            request("00000000"),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = json_body(response).await?;
        assert_eq!(body.error_code, CODE_INVALID);
        Ok(())
    }

    #[tokio::test]
    async fn long_code_also_verifies() -> Result<()> {
        let fixture = fixture().await?;
        let issued = issue_code(&fixture, "confirmed").await?;
        let Some(long_code) = issued.long_code else {
            panic!("realm issues long codes");
        };

        let response = verify(
            key_headers(DEVICE_KEY),
            Extension(fixture.state.clone()),
            request(&long_code),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }
}
