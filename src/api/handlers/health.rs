use crate::{GIT_COMMIT_HASH, api::AppState};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, warn};
use utoipa::ToSchema;

const HEALTH_DB_TIMEOUT_SECONDS: u64 = 2;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Database connection is healthy", body = Health),
        (status = 503, description = "Database connection is unhealthy", body = Health)
    ),
    tag = "health",
)]
/// Report name, version, commit and database status. `OPTIONS` gets the
/// same status and `X-App` header without a body.
pub async fn health(method: Method, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let db_healthy = match timeout(
        Duration::from_secs(HEALTH_DB_TIMEOUT_SECONDS),
        state.store.ping(),
    )
    .await
    {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!("Failed to ping database: {err}");
            false
        }
        Err(_) => {
            warn!("Database health check timed out");
            false
        }
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if db_healthy {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let headers = format!("{}:{}:{}", health.name, health.version, short_hash)
        .parse::<HeaderValue>()
        .map(|x_app_header_value| {
            let mut headers = HeaderMap::new();
            headers.insert("X-App", x_app_header_value);
            headers
        })
        .map_err(|err| {
            debug!("Failed to parse X-App header: {}", err);
        })
        .unwrap_or_else(|()| HeaderMap::new());

    if db_healthy {
        (StatusCode::OK, headers, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::fixture;
    use anyhow::Result;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn health_reports_database_ok() -> Result<()> {
        let fixture = fixture().await?;
        let response = health(Method::GET, Extension(fixture.state.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("X-App"));

        let bytes = response.into_body().collect().await?.to_bytes();
        let body: Health = serde_json::from_slice(&bytes)?;
        assert_eq!(body.name, env!("CARGO_PKG_NAME"));
        assert_eq!(body.database, "ok");
        Ok(())
    }

    #[tokio::test]
    async fn options_has_no_body() -> Result<()> {
        let fixture = fixture().await?;
        let response = health(Method::OPTIONS, Extension(fixture.state.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await?.to_bytes();
        assert!(bytes.is_empty());
        Ok(())
    }
}
