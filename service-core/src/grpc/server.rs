//! gRPC server construction from shared configuration.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;

use crate::config::GrpcSettings;
use crate::error::AppError;

/// Builder for a tonic `Server` with keepalive, timeout and concurrency
/// settings applied.
pub struct GrpcServerBuilder {
    service_name: String,
    http2_keepalive_interval: Duration,
    http2_keepalive_timeout: Duration,
    request_timeout: Duration,
    concurrency_limit: Option<usize>,
}

impl GrpcServerBuilder {
    pub fn new(service_name: impl Into<String>, settings: &GrpcSettings) -> Self {
        Self {
            service_name: service_name.into(),
            http2_keepalive_interval: Duration::from_secs(settings.keepalive_interval_secs),
            http2_keepalive_timeout: Duration::from_secs(settings.keepalive_timeout_secs),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            concurrency_limit: settings.concurrency_limit,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn build_server(&self) -> Server {
        let mut server = Server::builder()
            .http2_keepalive_interval(Some(self.http2_keepalive_interval))
            .http2_keepalive_timeout(Some(self.http2_keepalive_timeout))
            .timeout(self.request_timeout);

        if let Some(limit) = self.concurrency_limit {
            server = server.concurrency_limit_per_connection(limit);
        }

        server
    }
}

/// Bind a TCP listener on all interfaces. Port 0 picks a free port.
pub async fn bind_listener(port: u16, purpose: &str) -> Result<(TcpListener, u16), AppError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(error = %e, addr = %addr, purpose, "Failed to bind listener");
        AppError::from(e)
    })?;
    let bound = listener.local_addr()?.port();
    Ok((listener, bound))
}

/// Create a reflection service for the given encoded descriptor sets.
pub fn create_reflection_service(
    file_descriptor_sets: &[&[u8]],
) -> Result<
    tonic_reflection::server::ServerReflectionServer<
        impl tonic_reflection::server::ServerReflection,
    >,
    AppError,
> {
    let mut builder = ReflectionBuilder::configure();

    for fds in file_descriptor_sets {
        builder = builder.register_encoded_file_descriptor_set(fds);
    }

    builder.build_v1().map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Failed to build reflection service: {}", e))
    })
}
