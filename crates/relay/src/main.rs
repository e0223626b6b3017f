mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod hub;
mod metrics;
mod presence;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::{jwt::JwtAccessTokenService, middleware::InternalToken},
    config::{LogFormat, RelayConfig},
    db::pool::PoolConfig,
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, RelayError,
    },
    hub::{Hub, Notifier},
    metrics::RelayMetrics,
    presence::PresenceStore,
};

const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;

/// Everything the router needs, built once in `main` and by tests.
struct RelayServices {
    hub: Hub,
    presence: PresenceStore,
    jwt_service: Arc<JwtAccessTokenService>,
    metrics: Arc<RelayMetrics>,
    internal_token: Option<InternalToken>,
    trust_client_identity: bool,
    cors_origins: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set REVIEWBOX_RELAY_JWT_SECRET in production");
    }
    if config.ws_trust_client_identity {
        warn!("websocket handshake trusts client-supplied user ids without a token");
    }

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );
    let metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics));

    let presence = match config.database_url.as_deref() {
        Some(database_url) => PresenceStore::connect(database_url, PoolConfig::from_env())
            .await
            .context("failed to initialize presence store")?,
        None => {
            warn!("REVIEWBOX_RELAY_DATABASE_URL is unset; presence is kept in memory");
            PresenceStore::in_memory()
        }
    };

    let services = RelayServices {
        hub: Hub::new(config.outbound_queue),
        presence,
        jwt_service,
        metrics,
        internal_token: config.internal_token.as_deref().map(|token| InternalToken(Arc::from(token))),
        trust_client_identity: config.ws_trust_client_identity,
        cors_origins: config.cors_origins.clone(),
    };
    let presence_backend = services.presence.backend_name();
    let ingress_enabled = services.internal_token.is_some();
    let app = build_router(services);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        presence_backend,
        ingress_enabled,
        outbound_queue = config.outbound_queue,
        "starting relay server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_router(services: RelayServices) -> Router {
    let RelayServices {
        hub,
        presence,
        jwt_service,
        metrics,
        internal_token,
        trust_client_identity,
        cors_origins,
    } = services;

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .merge(Router::new().route("/metrics", get(metrics::metrics_handler)).with_state(metrics))
        .merge(ws::router(hub.clone(), Arc::clone(&jwt_service), trust_client_identity))
        .merge(api::presence_router(presence, jwt_service));

    if let Some(token) = internal_token {
        router = router.merge(api::events_router(Notifier::new(hub), token));
    }

    apply_middleware(router).layer(cors::cors_layer(cors_origins.as_deref()))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| path.clone());
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    let status = response.status().as_u16();
    metrics::record_http_request(method.as_str(), &route, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
