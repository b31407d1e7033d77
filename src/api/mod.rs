use crate::{
    api::handlers::{ApiKeyCache, health},
    certificate::CertificateSigner,
    cli::globals::GlobalArgs,
    codes::CodeService,
    config::ServiceConfig,
    digest::KeyedDigest,
    lock::{CleanupConfig, spawn_cleanup_worker},
    quota::{ApiRateLimiter, QuotaLimiter},
    signer::{KeyManager, LocalKeyManager, SignerCache, SigningKeyHandle, VaultKeyManager},
    sms::{LogSmsSender, SmsSender},
    store::{LockStore, MemoryStore, PgStore, QuotaStore, RealmStore, VerificationStore},
    token::TokenIssuer,
    vault,
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Method, Request},
    routing::options,
};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span, warn};
use ulid::Ulid;

pub mod error;
pub mod handlers;
mod openapi;

pub use openapi::openapi;

/// Where signing keys live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningBackend {
    /// Vault transit keys under the given mount.
    Vault { transit_mount: String },
    /// Keys generated in process memory, for development only.
    Local,
}

/// Everything `new` needs besides the Vault session.
#[derive(Debug)]
pub struct ServerSettings {
    pub port: u16,
    pub dsn: String,
    pub signing: SigningBackend,
    pub service: ServiceConfig,
    pub key_hmac_secret: SecretString,
    pub quota_hmac_secret: SecretString,
    pub cleanup: CleanupConfig,
}

/// The storage handles the request path uses.
#[derive(Clone)]
pub struct Backends {
    pub codes: Arc<dyn VerificationStore>,
    pub realms: Arc<dyn RealmStore>,
    pub quota: Arc<dyn QuotaStore>,
}

impl Backends {
    #[must_use]
    pub fn postgres(store: &Arc<PgStore>) -> Self {
        Self {
            codes: store.clone(),
            realms: store.clone(),
            quota: store.clone(),
        }
    }

    #[must_use]
    pub fn memory(store: &Arc<MemoryStore>) -> Self {
        Self {
            codes: store.clone(),
            realms: store.clone(),
            quota: store.clone(),
        }
    }
}

/// Shared state handed to every handler through `Extension<Arc<AppState>>`.
pub struct AppState {
    pub codes: Arc<CodeService>,
    pub tokens: Arc<TokenIssuer>,
    pub certificates: Arc<CertificateSigner>,
    pub realms: Arc<dyn RealmStore>,
    pub store: Arc<dyn VerificationStore>,
    pub api_keys: ApiKeyCache,
    pub rate_limiter: ApiRateLimiter,
}

impl AppState {
    /// Wire the services over `backends`.
    ///
    /// `key_secret` digests codes and API keys; `quota_secret` keys the quota
    /// and rate-limit buckets.
    ///
    /// # Errors
    /// Returns an error if either secret is empty.
    pub fn new(
        backends: Backends,
        keys: Arc<dyn KeyManager>,
        sms: Arc<dyn SmsSender>,
        config: Arc<ServiceConfig>,
        key_secret: &SecretString,
        quota_secret: &SecretString,
    ) -> Result<Self> {
        let key_digest = KeyedDigest::new(key_secret).context("invalid key HMAC secret")?;
        let quota_digest = KeyedDigest::new(quota_secret).context("invalid quota HMAC secret")?;

        let quota = QuotaLimiter::new(
            backends.quota.clone(),
            quota_digest.clone(),
            config.default_daily_quota(),
            config.quota_window(),
        );
        let codes = Arc::new(CodeService::new(
            backends.codes.clone(),
            quota,
            key_digest.clone(),
            sms,
            config.clone(),
        ));

        let token_key = Arc::new(SigningKeyHandle::new(
            keys.clone(),
            config.token_signing_key().to_string(),
            config.signer_cache_ttl(),
        ));
        let tokens = Arc::new(TokenIssuer::new(codes.clone(), token_key, config.clone()));

        let certificate_key = Arc::new(SigningKeyHandle::new(
            keys.clone(),
            config.certificate_signing_key().to_string(),
            config.signer_cache_ttl(),
        ));
        let certificates = Arc::new(CertificateSigner::new(
            tokens.clone(),
            backends.codes.clone(),
            certificate_key,
            SignerCache::new(keys, config.signer_cache_ttl()),
            config.clone(),
        ));

        Ok(Self {
            codes,
            tokens,
            certificates,
            realms: backends.realms.clone(),
            store: backends.codes,
            api_keys: ApiKeyCache::new(backends.realms, key_digest, config.api_key_cache_ttl()),
            rate_limiter: ApiRateLimiter::new(
                backends.quota,
                quota_digest,
                config.api_rate_limit(),
                config.api_rate_window(),
            ),
        })
    }
}

/// Build the HTTP application over `state`.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        // allow `GET` and `POST` when accessing the resource
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        // allow requests from any origin
        .allow_origin(Any);

    let (router, _openapi) = openapi::api_router().split_for_parts();
    router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(state.clone())),
        )
        .route("/health", options(health::health))
        .layer(Extension(state))
}

/// Start the server and the cleanup worker; returns after a graceful shutdown.
///
/// # Errors
/// Returns an error if the database is unreachable, the signing backend
/// cannot be built or the listener fails.
pub async fn new(settings: ServerSettings, globals: &GlobalArgs) -> Result<()> {
    // Renew vault token, gracefully shutdown if failed
    let (tx, mut rx) = mpsc::unbounded_channel();

    vault::renew::try_renew(globals, tx).await?;

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&settings.dsn)
        .await
        .context("Failed to connect to database")?;
    let store = Arc::new(PgStore::new(pool));

    let keys: Arc<dyn KeyManager> = match &settings.signing {
        SigningBackend::Vault { transit_mount } => Arc::new(VaultKeyManager::new(
            globals.vault_url.clone(),
            globals.vault_token.clone(),
            transit_mount.clone(),
        )?),
        SigningBackend::Local => {
            warn!("Signing with in-memory keys; tokens will not verify after a restart");
            Arc::new(LocalKeyManager::new())
        }
    };

    let state = Arc::new(AppState::new(
        Backends::postgres(&store),
        keys,
        Arc::new(LogSmsSender),
        Arc::new(settings.service),
        &settings.key_hmac_secret,
        &settings.quota_hmac_secret,
    )?);

    let locks: Arc<dyn LockStore> = store.clone();
    let cleanup = spawn_cleanup_worker(locks, store, settings.cleanup);

    let listener = TcpListener::bind(format!("::0:{}", settings.port)).await?;

    info!("Listening on [::]:{}", settings.port);

    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(async move {
            rx.recv().await;
            info!("Gracefully shutdown");
        })
        .await?;

    cleanup.abort();

    Ok(())
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or(request.uri().path(), MatchedPath::as_str);

    info_span!("http.request", method = %request.method(), route, request_id)
}
