//! Application startup and lifecycle management.

use crate::config::{StorageBackend, VoucherConfig};
use crate::grpc::{
    proto::{voucher_service_server::VoucherServiceServer, FILE_DESCRIPTOR_SET},
    trace_context_interceptor, VoucherServiceImpl,
};
use crate::services::{
    get_metrics, init_metrics, CustodyService, CustodyStore, MemoryStore, PgStore, Provisioner,
    SeedFile, VoucherSigner,
};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::grpc::{bind_listener, create_reflection_service, GrpcServerBuilder};
use service_core::middleware::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: VoucherConfig,
    pub store: Arc<dyn CustodyStore>,
    pub custody: CustodyService,
    pub provisioner: Provisioner,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    store: Arc<dyn CustodyStore>,
}

/// Liveness probe.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "voucher-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness probe; fails while the store is unreachable.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    grpc_port: u16,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: VoucherConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn CustodyStore> = match config.storage.backend {
            StorageBackend::Memory => {
                tracing::info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
            StorageBackend::Postgres => {
                let db_config = config.storage.database.as_ref().ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "postgres backend selected without database settings"
                    ))
                })?;
                let db = PgStore::new(
                    &db_config.url,
                    db_config.max_connections,
                    db_config.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(db)
            }
        };

        let signer = Arc::new(
            VoucherSigner::from_files(&config.signing.key_path, &config.signing.cert_path)
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to load voucher signing material");
                    e
                })?,
        );
        tracing::info!(signer = ?signer, "Voucher signing key loaded");

        let provisioner = Provisioner::new(Arc::clone(&store));
        if let Some(path) = &config.seed_path {
            let seed = SeedFile::load(path)?;
            seed.apply(&provisioner).await.map_err(|e| {
                tracing::error!(error = %e, path = %path.display(), "Failed to apply seed file");
                AppError::from(e)
            })?;
        }

        let custody = CustodyService::new(Arc::clone(&store), signer);

        let (http_listener, http_port) = bind_listener(config.common.port, "http").await?;
        let (grpc_listener, grpc_port) = bind_listener(config.common.grpc_port, "grpc").await?;

        tracing::info!(
            http_port = http_port,
            grpc_port = grpc_port,
            "Voucher service listeners bound"
        );

        Ok(Self {
            http_port,
            grpc_port,
            http_listener,
            grpc_listener,
            state: AppState {
                config,
                store,
                custody,
                provisioner,
            },
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get the gRPC port the server is listening on.
    pub fn grpc_port(&self) -> u16 {
        self.grpc_port
    }

    /// Out-of-band provisioning handle (organizations, accounts, serials).
    pub fn provisioner(&self) -> Provisioner {
        self.state.provisioner.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            store: Arc::clone(&self.state.store),
        };

        let http_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(health_state);

        let voucher_service = VoucherServiceImpl::new(self.state.custody.clone());

        // gRPC health service
        let (mut health_reporter, grpc_health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<VoucherServiceServer<VoucherServiceImpl>>()
            .await;

        let reflection_service = create_reflection_service(&[FILE_DESCRIPTOR_SET])
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let grpc_trace_layer = TraceLayer::new_for_grpc()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG));

        let voucher_service_with_interceptor =
            VoucherServiceServer::with_interceptor(voucher_service, trace_context_interceptor);

        let incoming = tokio_stream::wrappers::TcpListenerStream::new(self.grpc_listener);
        let grpc_server = GrpcServerBuilder::new(
            self.state.config.service_name.clone(),
            &self.state.config.common.grpc,
        )
        .build_server()
        .layer(grpc_trace_layer)
        .add_service(grpc_health_service)
        .add_service(reflection_service)
        .add_service(voucher_service_with_interceptor)
        .serve_with_incoming(incoming);

        tracing::info!(
            service = %self.state.config.service_name,
            version = %self.state.config.service_version,
            http_port = self.http_port,
            grpc_port = self.grpc_port,
            "Service ready to accept connections"
        );

        // Run both servers concurrently
        tokio::select! {
            result = axum::serve(self.http_listener, http_router) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "HTTP server error");
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            result = grpc_server => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "gRPC server error");
                    return Err(std::io::Error::other(format!("gRPC server error: {}", e)));
                }
            }
        }

        Ok(())
    }
}
