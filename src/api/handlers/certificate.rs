use crate::{
    api::{
        AppState,
        error::{ApiError, ErrorBody},
        handlers::auth::authenticate,
    },
    realm::ApiKeyType,
};
use axum::{
    extract::{Extension, Json},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    pub verification_token: String,
    /// Standard base64 of the 32-byte HMAC over the exposure keys.
    #[serde(rename = "exposureKeyHMAC")]
    pub exposure_key_hmac: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CertificateResponse {
    pub certificate: String,
    pub expires_at: DateTime<Utc>,
}

#[utoipa::path(
    post,
    path = "/api/certificate",
    request_body = CertificateRequest,
    responses(
        (status = 200, description = "Signed verification certificate", body = CertificateResponse),
        (status = 400, description = "Token invalid, expired or already used, or HMAC invalid", body = ErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 403, description = "Not a device key", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
        (status = 500, description = "Internal error", body = ErrorBody),
    ),
    tag = "device"
)]
#[instrument(skip(state, headers, payload))]
pub async fn certificate(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<CertificateRequest>>,
) -> impl IntoResponse {
    let now = Utc::now();
    let (_app, realm) = match authenticate(&state, &headers, ApiKeyType::Device, now).await {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };
    let Some(Json(request)) = payload else {
        return ApiError::missing_payload().into_response();
    };

    match state
        .certificates
        .issue(
            &realm,
            &request.verification_token,
            &request.exposure_key_hmac,
            now,
        )
        .await
    {
        Ok(issued) => {
            let response = CertificateResponse {
                certificate: issued.certificate,
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
    use crate::api::tests::{DEVICE_KEY, fixture, issue_code, json_body, key_headers, verify_code};
    use anyhow::Result;
    use base64::{Engine, engine::general_purpose::STANDARD};

    fn request(token: &str, hmac: &str) -> Option<Json<CertificateRequest>> {
        Some(Json(CertificateRequest {
            verification_token: token.to_string(),
            exposure_key_hmac: hmac.to_string(),
        }))
    }

    #[tokio::test]
    async fn certificate_is_issued_once() -> Result<()> {
        let fixture = fixture().await?;
        let issued = issue_code(&fixture, "confirmed").await?;
        let token = verify_code(&fixture, &issued.verification_code).await?;
        let hmac = STANDARD.encode([7u8; 32]);

        let response = certificate(
            key_headers(DEVICE_KEY),
            Extension(fixture.state.clone()),
            request(&token, &hmac),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body: CertificateResponse = json_body(response).await?;
        assert_eq!(body.certificate.split('.').count(), 3);

        let response = certificate(
            key_headers(DEVICE_KEY),
            Extension(fixture.state.clone()),
            request(&token, &hmac),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = json_body(response).await?;
        assert_eq!(body.error_code, "token_used");
        Ok(())
    }

    #[tokio::test]
    async fn bad_hmac_is_rejected() -> Result<()> {
        let fixture = fixture().await?;
        let issued = issue_code(&fixture, "confirmed").await?;
        let token = verify_code(&fixture, &issued.verification_code).await?;

        let response = certificate(
            key_headers(DEVICE_KEY),
            Extension(fixture.state.clone()),
            request(&token, "c2hvcnQ="),
        )
        .await
        .into_response();
        let body: ErrorBody = json_body(response).await?;
        assert_eq!(body.error_code, "hmac_invalid");
        Ok(())
    }
}
