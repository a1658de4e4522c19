use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Listener settings shared by every service.
///
/// Loaded from an optional `configuration` file and `APP__*` environment
/// variables, e.g. `APP__PORT=8080`, `APP__GRPC__CONCURRENCY_LIMIT=64`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// HTTP port for health, readiness and metrics.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default)]
    pub grpc: GrpcSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GrpcSettings {
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    pub concurrency_limit: Option<usize>,
}

fn default_port() -> u16 {
    8080
}

fn default_grpc_port() -> u16 {
    50051
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            request_timeout_secs: default_request_timeout(),
            concurrency_limit: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Both listeners on OS-assigned ports. Used by integration tests.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            grpc_port: 0,
            grpc: GrpcSettings::default(),
        }
    }
}
