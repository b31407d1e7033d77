use crate::{
    api::AppState,
    signer::jwt::{Jwk, JwkSet},
};
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header::CACHE_CONTROL},
    response::{IntoResponse, Json},
};
use std::sync::Arc;
use tracing::error;

#[utoipa::path(
    get,
    path= "/jwks.json",
    responses (
        (status = 200, description = "Public keys of the token and certificate signers", body = JwkSet),
        (status = 500, description = "A signing key could not be loaded"),
    ),
    tag= "jwks"
)]
pub async fn jwks(state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let handles = [
        state.tokens.signing_key(),
        state.certificates.system_key(),
    ];

    let mut keys = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.get().await {
            Ok(signer) => {
                let jwk = Jwk::from_verifying_key(signer.key_id(), signer.public_key());
                if !keys.contains(&jwk) {
                    keys.push(jwk);
                }
            }
            Err(e) => {
                error!("Failed to load signing key {}: {e:#}", handle.key_id());
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=300"));
    (StatusCode::OK, headers, Json(JwkSet { keys })).into_response()
}
