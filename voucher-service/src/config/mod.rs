//! Configuration module for voucher-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct VoucherConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageConfig,
    pub signing: SigningConfig,
    /// JSON seed applied through the provisioner at startup.
    pub seed_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl std::str::FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "Unknown STORAGE_BACKEND '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// MASA signing material: PKCS#8 PEM RSA key and its PEM certificate.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

impl VoucherConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let backend: StorageBackend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .parse()?;

        let database = match backend {
            StorageBackend::Memory => None,
            StorageBackend::Postgres => Some(DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "DATABASE_URL is required for the postgres backend"
                    ))
                })?),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            }),
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "voucher-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            storage: StorageConfig { backend, database },
            signing: SigningConfig {
                key_path: required_path("VOUCHER_SIGNING_KEY_PATH")?,
                cert_path: required_path("VOUCHER_SIGNING_CERT_PATH")?,
            },
            seed_path: env::var("SEED_FILE").ok().map(PathBuf::from),
        })
    }
}

fn required_path(name: &str) -> Result<PathBuf, AppError> {
    env::var(name)
        .map(PathBuf::from)
        .map_err(|_| AppError::ConfigError(anyhow::anyhow!("{} is required", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_storage_backend_parsing() {
        assert_eq!(
            "Memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert_eq!(
            "postgresql".parse::<StorageBackend>().unwrap(),
            StorageBackend::Postgres
        );
        assert!("sqlite".parse::<StorageBackend>().is_err());
    }

    #[test]
    #[serial]
    fn test_signing_paths_are_required() {
        env::remove_var("VOUCHER_SIGNING_KEY_PATH");
        env::remove_var("VOUCHER_SIGNING_CERT_PATH");
        env::remove_var("STORAGE_BACKEND");

        let err = VoucherConfig::from_env().unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    #[serial]
    fn test_postgres_requires_database_url() {
        env::set_var("VOUCHER_SIGNING_KEY_PATH", "/tmp/key.pem");
        env::set_var("VOUCHER_SIGNING_CERT_PATH", "/tmp/cert.pem");
        env::set_var("STORAGE_BACKEND", "postgres");
        env::remove_var("DATABASE_URL");

        let err = VoucherConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        env::set_var("STORAGE_BACKEND", "memory");
        let config = VoucherConfig::from_env().unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.storage.database.is_none());

        env::remove_var("VOUCHER_SIGNING_KEY_PATH");
        env::remove_var("VOUCHER_SIGNING_CERT_PATH");
        env::remove_var("STORAGE_BACKEND");
    }
}
