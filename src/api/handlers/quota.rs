//! Realm quota administration.

use crate::{
    api::{
        AppState,
        error::{ApiError, ErrorBody},
        handlers::auth::authenticate,
    },
    quota::{QuotaBucket, enable_abuse_prevention},
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

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct QuotaResponse {
    pub limit: u64,
    pub remaining: u64,
    pub burst: u64,
    pub reset_at: DateTime<Utc>,
    pub abuse_prevention_enabled: bool,
}

impl QuotaResponse {
    fn new(bucket: &QuotaBucket, abuse_prevention_enabled: bool) -> Self {
        Self {
            limit: bucket.limit,
            remaining: bucket.remaining,
            burst: bucket.burst,
            reset_at: bucket.reset_at,
            abuse_prevention_enabled,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct BurstRequest {
    pub amount: u64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EnableRequest {
    pub limit: u64,
}

#[utoipa::path(
    get,
    path = "/api/quota",
    responses(
        (status = 200, description = "Current issuance quota", body = QuotaResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 403, description = "Not an admin key", body = ErrorBody),
    ),
    tag = "admin"
)]
#[instrument(skip(state, headers))]
pub async fn quota(headers: HeaderMap, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let now = Utc::now();
    let (_app, realm) = match authenticate(&state, &headers, ApiKeyType::Admin, now).await {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };

    let limiter = state.codes.quota();
    match limiter.status(realm.id, now).await {
        Ok(bucket) => {
            let bucket = bucket.unwrap_or_else(|| {
                QuotaBucket::fresh(limiter.default_limit(), limiter.window(), now)
            });
            let response = QuotaResponse::new(&bucket, realm.abuse_prevention_enabled);
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => ApiError::admin(err).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/api/quota/burst",
    request_body = BurstRequest,
    responses(
        (status = 200, description = "Burst applied", body = QuotaResponse),
        (status = 400, description = "Burst above the realm bound", body = ErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 403, description = "Not an admin key", body = ErrorBody),
    ),
    tag = "admin"
)]
#[instrument(skip(state, headers, payload))]
pub async fn burst(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<BurstRequest>>,
) -> impl IntoResponse {
    let now = Utc::now();
    let (_app, realm) = match authenticate(&state, &headers, ApiKeyType::Admin, now).await {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };
    let Some(Json(request)) = payload else {
        return ApiError::missing_payload().into_response();
    };

    match state.codes.quota().burst(&realm, request.amount, now).await {
        Ok(bucket) => {
            let response = QuotaResponse::new(&bucket, realm.abuse_prevention_enabled);
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => ApiError::admin(err).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/api/quota/enable",
    request_body = EnableRequest,
    responses(
        (status = 200, description = "Abuse prevention enabled", body = QuotaResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 403, description = "Not an admin key", body = ErrorBody),
        (status = 500, description = "Internal error", body = ErrorBody),
    ),
    tag = "admin"
)]
#[instrument(skip(state, headers, payload))]
pub async fn enable(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<EnableRequest>>,
) -> impl IntoResponse {
    let now = Utc::now();
    let (_app, realm) = match authenticate(&state, &headers, ApiKeyType::Admin, now).await {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };
    let Some(Json(request)) = payload else {
        return ApiError::missing_payload().into_response();
    };

    match enable_abuse_prevention(
        state.codes.quota(),
        state.realms.as_ref(),
        realm.id,
        request.limit,
        now,
    )
    .await
    {
        Ok(bucket) => (StatusCode::OK, Json(QuotaResponse::new(&bucket, true))).into_response(),
        Err(err) => ApiError::admin(err).into_response(),
    }
}
