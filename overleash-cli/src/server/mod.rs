pub mod config;
mod metrics;
mod routes;
mod sse;
mod state;
mod upstream;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use overleash_lib::storage::{FileStore, NullStore, RedisConfig, RedisStore};
use overleash_lib::token::split_tokens;
use overleash_lib::{Engine, Overleash, OverleashConfig, StaticEngine, Store, StoreError, UpstreamError};
use thiserror::Error;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use self::config::{ConfigError, ServeArgs, ServeConfig, StorageBackend};
use self::metrics::{handle_metrics, track_metrics};
use self::routes::*;
use self::sse::handle_streaming;
use self::state::AppState;
use self::upstream::HttpUpstream;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no upstream configured, set `upstream` or OVERLEASH_UPSTREAM")]
    MissingUpstream,
    #[error("no token configured, set `token` or OVERLEASH_TOKEN")]
    MissingToken,
    #[error("unable to open storage: {0}")]
    Store(#[from] StoreError),
    #[error("unable to create upstream client: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .try_init();
}

async fn open_store(config: &ServeConfig) -> Result<Arc<dyn Store>, ServeError> {
    let store: Arc<dyn Store> = match config.storage {
        StorageBackend::File => {
            let store = FileStore::new();
            info!(dir = %store.dir().display(), "storing state on disk");
            Arc::new(store)
        }
        StorageBackend::Null => Arc::new(NullStore),
        StorageBackend::Redis => Arc::new(
            RedisStore::connect(RedisConfig {
                address: config.redis_address.clone(),
                password: config.redis_password.clone(),
                db: config.redis_db,
                channel: config.redis_channel.clone(),
            })
            .await?,
        ),
    };
    Ok(store)
}

fn build_router(state: Arc<AppState>) -> Router {
    let config = Arc::clone(&state.config);

    let mut app = Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/api/client/features", get(handle_client_features))
        .route("/api/client/features/{key}", get(handle_client_feature))
        .route("/api/client/metrics", post(handle_client_metrics))
        .route("/api/client/register", post(handle_client_register))
        .route("/override/{key}/{enabled}", post(handle_add_override))
        .route("/override/constrain/{key}/{enabled}", post(handle_add_override_constraint))
        .route("/override/{key}", delete(handle_delete_override))
        .route("/overrides", get(handle_list_overrides).delete(handle_delete_overrides))
        .route("/pause", post(handle_pause))
        .route("/unpause", post(handle_unpause))
        .route("/environment/{idx}", post(handle_set_environment))
        .route("/refresh", post(handle_refresh));

    if config.enable_frontend_api {
        app = app
            .route("/api/frontend", get(handle_frontend))
            .route("/api/frontend/all", get(handle_frontend_all))
            .route("/api/frontend/client/metrics", post(handle_frontend_noop))
            .route("/api/frontend/client/register", post(handle_frontend_noop));
    }
    if config.streamer {
        app = app.route("/api/client/streaming", get(handle_streaming));
    }
    if config.webhook {
        app = app.route("/api/webhook", post(handle_webhook));
    }
    if config.prometheus_metrics {
        app = app.route("/metrics", get(handle_metrics));
    }

    app.layer(middleware::from_fn(track_metrics))
        .layer(CompressionLayer::new())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, finishing in-flight requests");
}

pub async fn run_serve(args: ServeArgs) -> Result<(), ServeError> {
    // Config file, then OVERLEASH_* variables, then flags
    let (mut config, load_error) = match ServeConfig::load(&args.config) {
        Ok(config) => (config, None),
        Err(e) => (ServeConfig::default(), Some(e)),
    };
    config.apply_env_overrides();
    config.apply_cli(&args);

    init_tracing(config.verbose);
    if let Some(e) = load_error {
        warn!(error = %e, "using default configuration");
    }

    if config.upstream.trim().is_empty() {
        return Err(ServeError::MissingUpstream);
    }
    let tokens = split_tokens(&config.token);
    if tokens.is_empty() {
        return Err(ServeError::MissingToken);
    }
    let reload = config.reload_interval()?;

    let store = open_store(&config).await?;
    let upstream = Arc::new(HttpUpstream::new(&config.upstream, reload)?);

    let overleash = Arc::new(Overleash::new(
        tokens,
        upstream,
        store,
        || Box::new(StaticEngine::new()) as Box<dyn Engine>,
        OverleashConfig {
            reload,
            streamer: config.streamer,
            delta: config.delta,
            register: config.register,
            backup: config.backup,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = overleash.start(shutdown_rx.clone()).await {
        warn!(error = %e, "initial fetch incomplete, serving what is available");
    }
    let (metrics_sink, metrics_handle) = overleash.start_metrics(shutdown_rx.clone());

    let config = Arc::new(config);
    let state = Arc::new(AppState {
        overleash: Arc::clone(&overleash),
        metrics_sink,
        config: Arc::clone(&config),
        shutdown: shutdown_rx,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .map_err(|source| ServeError::Bind {
            addr: config.listen_address.clone(),
            source,
        })?;
    info!(
        address = %config.listen_address,
        upstream = %config.upstream,
        environments = ?overleash.remotes().await,
        "overleash listening"
    );

    let signal_tx = shutdown_tx.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signal_tx.send(true);
        })
        .await
        .map_err(ServeError::Serve);

    let _ = shutdown_tx.send(true);
    if let Err(e) = metrics_handle.await {
        warn!(error = %e, "metrics task ended abnormally");
    }
    info!("server stopped");
    result
}
