use crate::config::InpaintConfig;
use crate::handlers;
use crate::inference::{shared_generator, InpaintModel};
use crate::services::{Database, LocalStorage, Storage};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: InpaintConfig,
    pub db: Database,
    pub storage: Arc<dyn Storage>,
    pub model: Arc<dyn InpaintModel>,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(handlers::home))
        .route(
            "/inpaint/",
            post(handlers::inpaint).fallback(handlers::method_hint),
        )
        .route("/inpaint/results", get(handlers::list_results))
        .route("/inpaint/results/:id", get(handlers::get_result))
        .route("/inpaint/results/:id/:kind", get(handlers::download_blob))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness))
        .route("/metrics", get(handlers::metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    /// Connects Postgres, applies migrations, prepares blob storage and loads
    /// the generator before binding. Any failure here aborts startup.
    pub async fn build(config: InpaintConfig) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to Postgres: {}", e);
            e
        })?;
        db.run_migrations().await?;

        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(&config.storage.local_path)
                .await
                .map_err(|e| {
                    tracing::error!(
                        "Failed to initialize local storage at {}: {}",
                        config.storage.local_path,
                        e
                    );
                    e
                })?,
        );

        let model_config = config.model.clone();
        let generator = tokio::task::spawn_blocking(move || shared_generator(&model_config))
            .await
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Model load task failed: {}", e)))?
            .map_err(|e| {
                tracing::error!("Failed to load generator: {}", e);
                AppError::InternalError(e.into())
            })?;
        let model: Arc<dyn InpaintModel> = generator;

        Self::build_with(config, db, storage, model).await
    }

    /// Binds the router over already constructed dependencies.
    pub async fn build_with(
        config: InpaintConfig,
        db: Database,
        storage: Arc<dyn Storage>,
        model: Arc<dyn InpaintModel>,
    ) -> Result<Self, AppError> {
        let state = AppState {
            config: config.clone(),
            db,
            storage,
            model,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, router(state.clone()))
            .with_graceful_shutdown(shutdown_signal());

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    tracing::info!("Shutdown signal received");
}
