use crate::{
    api::{
        AppState,
        error::{ApiError, ErrorBody},
        handlers::auth::authenticate,
    },
    codes::IssueRequest,
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
use uuid::Uuid;

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct IssueCodeRequest {
    pub test_type: String,
    #[serde(default)]
    pub symptom_date: Option<String>,
    #[serde(default)]
    pub test_date: Option<String>,
    /// Minutes east of UTC of the caller's local time.
    #[serde(default)]
    pub tz_offset: i32,
    #[serde(default, rename = "externalIssuerID")]
    pub external_issuer_id: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IssueCodeResponse {
    pub uuid: Uuid,
    pub verification_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_code: Option<String>,
    pub test_type: String,
    pub expires_at: DateTime<Utc>,
    pub long_expires_at: DateTime<Utc>,
}

#[utoipa::path(
    post,
    path = "/api/issue",
    request_body = IssueCodeRequest,
    responses(
        (status = 200, description = "Code issued", body = IssueCodeResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 403, description = "Not an admin key", body = ErrorBody),
        (status = 429, description = "Quota exceeded or rate limited", body = ErrorBody),
        (status = 500, description = "Internal error", body = ErrorBody),
    ),
    tag = "admin"
)]
#[instrument(skip(state, headers, payload))]
pub async fn issue(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<IssueCodeRequest>>,
) -> impl IntoResponse {
    let now = Utc::now();
    let (app, realm) = match authenticate(&state, &headers, ApiKeyType::Admin, now).await {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };
    let Some(Json(request)) = payload else {
        return ApiError::missing_payload().into_response();
    };

    let request = IssueRequest {
        test_type: request.test_type,
        symptom_date: request.symptom_date,
        test_date: request.test_date,
        tz_offset: request.tz_offset,
        external_issuer_id: request.external_issuer_id,
        phone: request.phone,
    };

    match state.codes.issue(&realm, Some(app.id), &request, now).await {
        Ok(issued) => {
            let response = IssueCodeResponse {
                uuid: issued.id,
                verification_code: issued.code,
                long_code: issued.long_code,
                test_type: issued.test_type.as_str().to_string(),
                expires_at: issued.expires_at,
                long_expires_at: issued.long_expires_at,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => ApiError::admin(err).into_response(),
    }
}
