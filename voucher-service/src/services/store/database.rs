//! PostgreSQL store. Each transaction runs at SERIALIZABLE isolation;
//! serialization failures surface as [`StoreError::Conflict`].

use async_trait::async_trait;
use prometheus::HistogramTimer;
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};

use super::{CustodyStore, CustodyTx};
use crate::models::{AccountType, DomainCertificate, Group, Principal, Role, RoleGrant, SerialRecord};
use crate::services::error::StoreError;
use crate::services::metrics::STORE_OPERATION_DURATION;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "voucher-service"))]
    pub async fn new(
        database_url: &Secret<String>,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url.expose_secret())
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl CustodyStore for PgStore {
    async fn begin<'a>(&'a self) -> Result<Box<dyn CustodyTx + 'a>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn timer(operation: &str) -> HistogramTimer {
    STORE_OPERATION_DURATION
        .with_label_values(&[operation])
        .start_timer()
}

#[derive(FromRow)]
struct GrantRow {
    username: String,
    account_type: String,
    org_id: String,
    group_id: String,
    role: String,
}

impl TryFrom<GrantRow> for RoleGrant {
    type Error = StoreError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        let account_type: AccountType = row.account_type.parse().map_err(StoreError::CorruptTree)?;
        let role: Role = row.role.parse().map_err(StoreError::CorruptTree)?;
        Ok(RoleGrant {
            principal: Principal::new(row.username, account_type, row.org_id),
            group_id: row.group_id,
            role,
        })
    }
}

const GROUP_COLUMNS: &str = "group_id, parent_group_id, org_id, description, created_utc";
const CERT_COLUMNS: &str =
    "cert_id, group_id, certificate_der, revocation_checks, expiry_utc, created_utc";

#[async_trait]
impl CustodyTx for PgTx {
    async fn account_exists(&mut self, principal: &Principal) -> Result<bool, StoreError> {
        let _t = timer("account_exists");
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE username = $1 AND account_type = $2 AND org_id = $3)",
        )
        .bind(&principal.username)
        .bind(principal.account_type.as_str())
        .bind(&principal.org_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn insert_account(&mut self, principal: &Principal) -> Result<(), StoreError> {
        let _t = timer("insert_account");
        sqlx::query(
            "INSERT INTO accounts (username, account_type, org_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(&principal.username)
        .bind(principal.account_type.as_str())
        .bind(&principal.org_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn is_support(
        &mut self,
        username: &str,
        account_type: AccountType,
    ) -> Result<bool, StoreError> {
        let _t = timer("is_support");
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM support_accounts WHERE username = $1 AND account_type = $2)",
        )
        .bind(username)
        .bind(account_type.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn insert_support(
        &mut self,
        username: &str,
        account_type: AccountType,
    ) -> Result<(), StoreError> {
        let _t = timer("insert_support");
        sqlx::query(
            "INSERT INTO support_accounts (username, account_type) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(username)
        .bind(account_type.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn group(&mut self, group_id: &str) -> Result<Option<Group>, StoreError> {
        let _t = timer("group");
        let group = sqlx::query_as::<_, Group>(&format!(
            "SELECT {} FROM groups WHERE group_id = $1",
            GROUP_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(group)
    }

    async fn child_group_ids(&mut self, group_id: &str) -> Result<Vec<String>, StoreError> {
        let _t = timer("child_group_ids");
        let ids = sqlx::query_scalar(
            "SELECT group_id FROM groups WHERE parent_group_id = $1 ORDER BY group_id",
        )
        .bind(group_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn insert_group(&mut self, group: &Group) -> Result<(), StoreError> {
        let _t = timer("insert_group");
        sqlx::query(
            r#"
            INSERT INTO groups (group_id, parent_group_id, org_id, description, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&group.group_id)
        .bind(&group.parent_group_id)
        .bind(&group.org_id)
        .bind(&group.description)
        .bind(group.created_utc)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_group(&mut self, group_id: &str) -> Result<(), StoreError> {
        let _t = timer("delete_group");
        sqlx::query("DELETE FROM role_grants WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM groups WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn grant(
        &mut self,
        principal: &Principal,
        group_id: &str,
    ) -> Result<Option<Role>, StoreError> {
        let _t = timer("grant");
        let role: Option<String> = sqlx::query_scalar(
            r#"
            SELECT role FROM role_grants
            WHERE username = $1 AND account_type = $2 AND org_id = $3 AND group_id = $4
            "#,
        )
        .bind(&principal.username)
        .bind(principal.account_type.as_str())
        .bind(&principal.org_id)
        .bind(group_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        role.map(|r| r.parse().map_err(StoreError::CorruptTree))
            .transpose()
    }

    async fn grants_on_group(&mut self, group_id: &str) -> Result<Vec<RoleGrant>, StoreError> {
        let _t = timer("grants_on_group");
        let rows = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT username, account_type, org_id, group_id, role FROM role_grants
            WHERE group_id = $1
            ORDER BY username, account_type, org_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(RoleGrant::try_from).collect()
    }

    async fn grants_for_principal(
        &mut self,
        principal: &Principal,
    ) -> Result<Vec<RoleGrant>, StoreError> {
        let _t = timer("grants_for_principal");
        let rows = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT username, account_type, org_id, group_id, role FROM role_grants
            WHERE username = $1 AND account_type = $2 AND org_id = $3
            ORDER BY group_id
            "#,
        )
        .bind(&principal.username)
        .bind(principal.account_type.as_str())
        .bind(&principal.org_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(RoleGrant::try_from).collect()
    }

    async fn insert_grant(&mut self, grant: &RoleGrant) -> Result<(), StoreError> {
        let _t = timer("insert_grant");
        sqlx::query(
            r#"
            INSERT INTO role_grants (username, account_type, org_id, group_id, role)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (username, account_type, org_id, group_id) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(&grant.principal.username)
        .bind(grant.principal.account_type.as_str())
        .bind(&grant.principal.org_id)
        .bind(&grant.group_id)
        .bind(grant.role.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_grant(
        &mut self,
        principal: &Principal,
        group_id: &str,
    ) -> Result<(), StoreError> {
        let _t = timer("delete_grant");
        sqlx::query(
            r#"
            DELETE FROM role_grants
            WHERE username = $1 AND account_type = $2 AND org_id = $3 AND group_id = $4
            "#,
        )
        .bind(&principal.username)
        .bind(principal.account_type.as_str())
        .bind(&principal.org_id)
        .bind(group_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn serial(&mut self, serial_number: &str) -> Result<Option<SerialRecord>, StoreError> {
        let _t = timer("serial");
        let record = sqlx::query_as::<_, SerialRecord>(
            r#"
            SELECT serial_number, org_id, public_key_der, mac_addr, vendor_ien
            FROM serials WHERE serial_number = $1
            "#,
        )
        .bind(serial_number)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(record)
    }

    async fn insert_serial(&mut self, record: &SerialRecord) -> Result<(), StoreError> {
        let _t = timer("insert_serial");
        sqlx::query(
            r#"
            INSERT INTO serials (serial_number, org_id, public_key_der, mac_addr, vendor_ien)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.serial_number)
        .bind(&record.org_id)
        .bind(&record.public_key_der)
        .bind(&record.mac_addr)
        .bind(&record.vendor_ien)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn serial_group_ids(&mut self, serial_number: &str) -> Result<Vec<String>, StoreError> {
        let _t = timer("serial_group_ids");
        let ids = sqlx::query_scalar(
            "SELECT group_id FROM serial_memberships WHERE serial_number = $1 ORDER BY group_id",
        )
        .bind(serial_number)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn group_serials(&mut self, group_id: &str) -> Result<Vec<String>, StoreError> {
        let _t = timer("group_serials");
        let serials = sqlx::query_scalar(
            "SELECT serial_number FROM serial_memberships WHERE group_id = $1 ORDER BY serial_number",
        )
        .bind(group_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(serials)
    }

    async fn add_serial_membership(
        &mut self,
        serial_number: &str,
        group_id: &str,
    ) -> Result<(), StoreError> {
        let _t = timer("add_serial_membership");
        sqlx::query(
            "INSERT INTO serial_memberships (serial_number, group_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(serial_number)
        .bind(group_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove_serial_membership(
        &mut self,
        serial_number: &str,
        group_id: &str,
    ) -> Result<(), StoreError> {
        let _t = timer("remove_serial_membership");
        sqlx::query("DELETE FROM serial_memberships WHERE serial_number = $1 AND group_id = $2")
            .bind(serial_number)
            .bind(group_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn certificate(
        &mut self,
        cert_id: &str,
    ) -> Result<Option<DomainCertificate>, StoreError> {
        let _t = timer("certificate");
        let cert = sqlx::query_as::<_, DomainCertificate>(&format!(
            "SELECT {} FROM domain_certificates WHERE cert_id = $1",
            CERT_COLUMNS
        ))
        .bind(cert_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(cert)
    }

    async fn certificate_id_by_der(
        &mut self,
        group_id: &str,
        certificate_der: &[u8],
    ) -> Result<Option<String>, StoreError> {
        let _t = timer("certificate_id_by_der");
        let id = sqlx::query_scalar(
            "SELECT cert_id FROM domain_certificates WHERE group_id = $1 AND certificate_der = $2",
        )
        .bind(group_id)
        .bind(certificate_der)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn group_certificate_ids(&mut self, group_id: &str) -> Result<Vec<String>, StoreError> {
        let _t = timer("group_certificate_ids");
        let ids = sqlx::query_scalar(
            "SELECT cert_id FROM domain_certificates WHERE group_id = $1 ORDER BY cert_id",
        )
        .bind(group_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn insert_certificate(&mut self, cert: &DomainCertificate) -> Result<(), StoreError> {
        let _t = timer("insert_certificate");
        sqlx::query(
            r#"
            INSERT INTO domain_certificates
                (cert_id, group_id, certificate_der, revocation_checks, expiry_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&cert.cert_id)
        .bind(&cert.group_id)
        .bind(&cert.certificate_der)
        .bind(cert.revocation_checks)
        .bind(cert.expiry_utc)
        .bind(cert.created_utc)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_certificate(&mut self, cert_id: &str) -> Result<(), StoreError> {
        let _t = timer("delete_certificate");
        sqlx::query("DELETE FROM domain_certificates WHERE cert_id = $1")
            .bind(cert_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let _t = timer("commit");
        self.tx.commit().await?;
        Ok(())
    }
}
