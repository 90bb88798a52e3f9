pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod state;
pub mod storage;
pub mod store;

use api::{AppState, create_api_router};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use config::Config;
use state::StateManager;
use std::io::IsTerminal;
use std::sync::Arc;
use storage::ChunkStorage;
use storage::cleanup::{CleanupRunner, spawn_cleanup_task};
use storage::quota::QuotaAccountant;
use store::UploadStore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_rapidoc::RapiDoc;

/// Initialize the tracing subscriber for logging
/// Uses journald when running as a service (no terminal), fmt when running interactively
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ferryd=info,tower_http=warn".into());

    if std::io::stdout().is_terminal() {
        // Running in a terminal, use formatted output
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        // Running as a service, use journald
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_journald::layer().expect("Failed to connect to journald"))
            .init();
    }
}

/// Assemble the full application router from shared state.
pub fn build_app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_request_body.as_u64() as usize;

    // JSON API with generated OpenAPI document
    let (api_router, api_doc) = create_api_router(state.clone()).split_for_parts();

    // Raw TUS protocol routes
    let tus_routes = api::tus::create_tus_router(state);

    // Documentation routes
    let doc_routes =
        Router::new().merge(RapiDoc::with_openapi("/api-docs/openapi.json", api_doc).path("/api-docs"));

    Router::new()
        .nest("/api", api_router)
        .merge(tus_routes)
        .merge(doc_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Run the transfer service
pub async fn run_service(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    init_tracing();

    // Log version early
    tracing::info!("ferryd version {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load(config_path).unwrap_or_else(|_| {
        tracing::warn!("Failed to load config, using defaults");
        Config::default()
    });

    tracing::info!("Starting server with config: {:?}", config);

    // Connect the state backend selected at startup
    let state_manager = StateManager::connect(
        config.state.backend,
        &config.storage.storage_path,
        &config.state.redis_url,
    )
    .await?;
    tracing::info!(backend = %config.state.backend, "State backend connected");

    // Record store and byte storage share the state backend
    let store = UploadStore::new(state_manager);
    let chunk_storage = Arc::new(ChunkStorage::new(
        &config.storage.storage_path,
        store.clone(),
    ));
    chunk_storage.initialize().await?;

    // Repair uploads interrupted between the terminal PATCH and the file move
    match chunk_storage.recover_interrupted_finalizations().await {
        Ok(recovered) if recovered > 0 => {
            tracing::info!(recovered, "Recovered interrupted finalizations on startup");
        }
        Err(e) => {
            tracing::error!(error = %e, "Finalization recovery failed on startup");
        }
        _ => {}
    }

    let quota = QuotaAccountant::new(
        chunk_storage.uploads_path(),
        chunk_storage.files_path(),
        config.storage.max_storage_size.map(|b| b.as_u64()),
        store.clone(),
    );

    // Periodic sweep of expired uploads and TTL-expired files.
    // The per-principal storage-accounting hook is wired by deployments
    // that track usage per caller; the core runs without one.
    let cleanup = CleanupRunner::new(Arc::clone(&chunk_storage), store.clone(), None);
    spawn_cleanup_task(cleanup.clone(), config.uploads.cleanup_interval);

    if let Some(max) = config.storage.max_storage_size {
        tracing::info!(
            "Storage quota: {}",
            max.get_appropriate_unit(byte_unit::UnitType::Binary)
        );
    } else {
        tracing::info!("Storage quota: unlimited");
    }

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        storage: chunk_storage,
        quota,
        cleanup,
    });

    let app = build_app(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for a shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
