use crate::{
    api::{
        AppState,
        error::{ApiError, ErrorBody},
        handlers::auth::authenticate,
    },
    codes::{CodeState, service::CodeStatus},
    error::VerifyError,
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

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CodeLookupRequest {
    pub uuid: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CodeStatusResponse {
    pub claimed: bool,
    pub state: CodeState,
    pub expires_at: DateTime<Utc>,
    pub long_expires_at: DateTime<Utc>,
}

impl From<CodeStatus> for CodeStatusResponse {
    fn from(status: CodeStatus) -> Self {
        Self {
            claimed: status.claimed,
            state: status.state,
            expires_at: status.expires_at,
            long_expires_at: status.long_expires_at,
        }
    }
}

fn parse_uuid(payload: Option<Json<CodeLookupRequest>>) -> Result<Uuid, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::missing_payload());
    };
    Uuid::parse_str(request.uuid.trim())
        .map_err(|_| ApiError::admin(VerifyError::Unparsable("invalid uuid".to_string())))
}

#[utoipa::path(
    post,
    path = "/api/checkcodestatus",
    request_body = CodeLookupRequest,
    responses(
        (status = 200, description = "Code status", body = CodeStatusResponse),
        (status = 400, description = "Unknown or malformed uuid", body = ErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 403, description = "Not an admin key", body = ErrorBody),
    ),
    tag = "admin"
)]
#[instrument(skip(state, headers, payload))]
pub async fn check_code_status(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<CodeLookupRequest>>,
) -> impl IntoResponse {
    let now = Utc::now();
    let (_app, realm) = match authenticate(&state, &headers, ApiKeyType::Admin, now).await {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };
    let id = match parse_uuid(payload) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    match state.codes.check_status(realm.id, id, now).await {
        Ok(status) => (StatusCode::OK, Json(CodeStatusResponse::from(status))).into_response(),
        Err(err) => ApiError::admin(err).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/api/expirecode",
    request_body = CodeLookupRequest,
    responses(
        (status = 200, description = "Code expired", body = CodeStatusResponse),
        (status = 400, description = "Unknown, claimed or already expired code", body = ErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 403, description = "Not an admin key", body = ErrorBody),
    ),
    tag = "admin"
)]
#[instrument(skip(state, headers, payload))]
pub async fn expire_code(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<CodeLookupRequest>>,
) -> impl IntoResponse {
    let now = Utc::now();
    let (_app, realm) = match authenticate(&state, &headers, ApiKeyType::Admin, now).await {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };
    let id = match parse_uuid(payload) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    match state.codes.expire(realm.id, id, now).await {
        Ok(status) => (StatusCode::OK, Json(CodeStatusResponse::from(status))).into_response(),
        Err(err) => ApiError::admin(err).into_response(),
    }
}
