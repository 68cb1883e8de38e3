//! PostgreSQL store for tenant-billing.

use super::metrics::db_timer;
use super::store::{
    EventLedgerStore, InvoiceStore, OrganizationStore, PlanStore, UsageStore, UsageTx,
};
use crate::error::BillingError;
use crate::models::{
    BillingEvent, Entitlement, EventStatus, Invoice, ListEventsFilter, Organization,
    OrganizationUsage, Plan, ResourceKind, Transaction,
};
use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction as SqlxTransaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const EVENT_COLUMNS: &str =
    "event_id, external_id, event_type, status, error, received_utc, processed_utc";

const ORGANIZATION_COLUMNS: &str = "organization_id, name, billing_status, legacy_status, plan_id, \
     trial_expires_at, provider_customer_id, provider_subscription_id, \
     default_settlement_account_id, subscription_event_at, created_utc, updated_utc";

const USAGE_COLUMNS: &str =
    "organization_id, projects, clients, proposals, seats, storage_bytes, ai_credits, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, organization_id, invoice_number, payment_method, status, \
     total, currency, payment_session_id, payment_link_url, payment_link_expires_at, \
     paid_at, paid_date, paid_via, created_utc, updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "tenant-billing"))]
    pub async fn new(
        database_url: &str,
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
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let _timer = db_timer("health_check");

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        Ok(())
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
impl EventLedgerStore for PgStore {
    #[instrument(skip(self))]
    async fn find_event(&self, external_id: &str) -> Result<Option<BillingEvent>, BillingError> {
        let _timer = db_timer("find_event");

        sqlx::query_as::<_, BillingEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM billing_events WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch billing event", e))
    }

    #[instrument(skip(self))]
    async fn insert_event_if_absent(
        &self,
        external_id: &str,
        event_type: &str,
    ) -> Result<Option<BillingEvent>, BillingError> {
        let _timer = db_timer("insert_event_if_absent");

        sqlx::query_as::<_, BillingEvent>(&format!(
            r#"
            INSERT INTO billing_events (event_id, external_id, event_type, status)
            VALUES ($1, $2, $3, 'received')
            ON CONFLICT (external_id) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to record billing event", e))
    }

    #[instrument(skip(self, error))]
    async fn set_event_status(
        &self,
        external_id: &str,
        status: EventStatus,
        error: Option<&str>,
    ) -> Result<(), BillingError> {
        let _timer = db_timer("set_event_status");

        let result = sqlx::query(
            r#"
            UPDATE billing_events
            SET status = $2, error = $3, processed_utc = NOW()
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to update billing event", e))?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("billing event {}", external_id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_events(
        &self,
        filter: &ListEventsFilter,
    ) -> Result<Vec<BillingEvent>, BillingError> {
        let _timer = db_timer("list_events");

        sqlx::query_as::<_, BillingEvent>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM billing_events
            WHERE ($1::varchar IS NULL OR status = $1)
            ORDER BY received_utc DESC
            LIMIT $2
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to list billing events", e))
    }
}

#[async_trait]
impl OrganizationStore for PgStore {
    #[instrument(skip(self, org), fields(organization_id = %org.organization_id))]
    async fn create_organization(&self, org: &Organization) -> Result<(), BillingError> {
        let _timer = db_timer("create_organization");

        sqlx::query(
            r#"
            INSERT INTO organizations (organization_id, name, billing_status, legacy_status, plan_id,
                trial_expires_at, provider_customer_id, provider_subscription_id,
                default_settlement_account_id, subscription_event_at, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(org.organization_id)
        .bind(&org.name)
        .bind(org.billing_status.map(|s| s.as_str()))
        .bind(&org.legacy_status)
        .bind(&org.plan_id)
        .bind(org.trial_expires_at)
        .bind(&org.provider_customer_id)
        .bind(&org.provider_subscription_id)
        .bind(org.default_settlement_account_id)
        .bind(org.subscription_event_at)
        .bind(org.created_utc)
        .bind(org.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to create organization", e))?;

        info!(name = %org.name, "Organization created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>, BillingError> {
        let _timer = db_timer("get_organization");

        sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE organization_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch organization", e))
    }

    #[instrument(skip(self))]
    async fn find_organization_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Organization>, BillingError> {
        let _timer = db_timer("find_organization_by_customer");

        sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE provider_customer_id = $1 LIMIT 1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch organization by customer", e))
    }

    #[instrument(skip(self))]
    async fn find_organization_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Organization>, BillingError> {
        let _timer = db_timer("find_organization_by_subscription");

        sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE provider_subscription_id = $1 LIMIT 1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch organization by subscription", e))
    }

    #[instrument(skip(self, org), fields(organization_id = %org.organization_id))]
    async fn save_organization(&self, org: &Organization) -> Result<(), BillingError> {
        let _timer = db_timer("save_organization");

        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET name = $2, billing_status = $3, legacy_status = $4, plan_id = $5,
                trial_expires_at = $6, provider_customer_id = $7, provider_subscription_id = $8,
                default_settlement_account_id = $9, subscription_event_at = $10,
                updated_utc = NOW()
            WHERE organization_id = $1
            "#,
        )
        .bind(org.organization_id)
        .bind(&org.name)
        .bind(org.billing_status.map(|s| s.as_str()))
        .bind(&org.legacy_status)
        .bind(&org.plan_id)
        .bind(org.trial_expires_at)
        .bind(&org.provider_customer_id)
        .bind(&org.provider_subscription_id)
        .bind(org.default_settlement_account_id)
        .bind(org.subscription_event_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to save organization", e))?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound("organization".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PlanStore for PgStore {
    #[instrument(skip(self))]
    async fn list_plans(&self) -> Result<Vec<Plan>, BillingError> {
        let _timer = db_timer("list_plans");

        sqlx::query_as::<_, Plan>(
            "SELECT plan_id, name, provider_price_id, is_trial, created_utc FROM plans ORDER BY created_utc",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to list plans", e))
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>, BillingError> {
        let _timer = db_timer("get_plan");

        sqlx::query_as::<_, Plan>(
            "SELECT plan_id, name, provider_price_id, is_trial, created_utc FROM plans WHERE plan_id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch plan", e))
    }

    #[instrument(skip(self))]
    async fn find_plan_by_price(&self, price_id: &str) -> Result<Option<Plan>, BillingError> {
        let _timer = db_timer("find_plan_by_price");

        sqlx::query_as::<_, Plan>(
            "SELECT plan_id, name, provider_price_id, is_trial, created_utc FROM plans WHERE provider_price_id = $1",
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch plan by price", e))
    }

    #[instrument(skip(self))]
    async fn find_trial_plan(&self) -> Result<Option<Plan>, BillingError> {
        let _timer = db_timer("find_trial_plan");

        sqlx::query_as::<_, Plan>(
            r#"
            SELECT plan_id, name, provider_price_id, is_trial, created_utc
            FROM plans WHERE is_trial
            ORDER BY created_utc
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch trial plan", e))
    }

    #[instrument(skip(self))]
    async fn get_entitlement(&self, plan_id: &str) -> Result<Option<Entitlement>, BillingError> {
        let _timer = db_timer("get_entitlement");

        sqlx::query_as::<_, Entitlement>(
            r#"
            SELECT plan_id, max_projects, max_clients, max_proposals, max_seats,
                   max_storage_bytes, max_ai_credits
            FROM entitlements WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch entitlement", e))
    }
}

/// Usage unit of work backed by a database transaction.
///
/// Row locks taken with `FOR UPDATE` live until commit or rollback.
pub struct PgUsageTx {
    tx: SqlxTransaction<'static, Postgres>,
}

impl PgUsageTx {
    /// Connection for record writes that must share the usage lock, such as
    /// inserting the project a reservation was made for.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl UsageTx for PgUsageTx {
    #[instrument(skip(self))]
    async fn lock_usage(
        &mut self,
        organization_id: Uuid,
    ) -> Result<OrganizationUsage, BillingError> {
        let _timer = db_timer("lock_usage");

        sqlx::query(
            "INSERT INTO organization_usage (organization_id) VALUES ($1) ON CONFLICT (organization_id) DO NOTHING",
        )
        .bind(organization_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("Failed to create usage row", e))?;

        sqlx::query_as::<_, OrganizationUsage>(&format!(
            "SELECT {USAGE_COLUMNS} FROM organization_usage WHERE organization_id = $1 FOR UPDATE"
        ))
        .bind(organization_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("Failed to lock usage row", e))
    }

    #[instrument(skip(self))]
    async fn count_live(
        &mut self,
        organization_id: Uuid,
        kind: ResourceKind,
    ) -> Result<i64, BillingError> {
        let _timer = db_timer("count_live");

        let table = kind.live_table().ok_or_else(|| {
            BillingError::database("Failed to count records", format!("{} is counter-backed", kind))
        })?;

        sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {table} WHERE organization_id = $1"
        ))
        .bind(organization_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("Failed to count records", e))
    }

    #[instrument(skip(self, usage), fields(organization_id = %usage.organization_id))]
    async fn write_usage(&mut self, usage: &OrganizationUsage) -> Result<(), BillingError> {
        let _timer = db_timer("write_usage");

        sqlx::query(
            r#"
            UPDATE organization_usage
            SET projects = $2, clients = $3, proposals = $4, seats = $5,
                storage_bytes = $6, ai_credits = $7, updated_utc = NOW()
            WHERE organization_id = $1
            "#,
        )
        .bind(usage.organization_id)
        .bind(usage.projects)
        .bind(usage.clients)
        .bind(usage.proposals)
        .bind(usage.seats)
        .bind(usage.storage_bytes)
        .bind(usage.ai_credits)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| BillingError::database("Failed to write usage row", e))?;

        Ok(())
    }

    async fn commit(self) -> Result<(), BillingError> {
        self.tx
            .commit()
            .await
            .map_err(|e| BillingError::database("Failed to commit usage transaction", e))
    }
}

#[async_trait]
impl UsageStore for PgStore {
    type Tx = PgUsageTx;

    async fn begin_usage(&self) -> Result<PgUsageTx, BillingError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::database("Failed to begin transaction", e))?;
        Ok(PgUsageTx { tx })
    }

    #[instrument(skip(self))]
    async fn get_usage(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<OrganizationUsage>, BillingError> {
        let _timer = db_timer("get_usage");

        sqlx::query_as::<_, OrganizationUsage>(&format!(
            "SELECT {USAGE_COLUMNS} FROM organization_usage WHERE organization_id = $1"
        ))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch usage", e))
    }
}

#[async_trait]
impl InvoiceStore for PgStore {
    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError> {
        let _timer = db_timer("get_invoice");

        sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = $1"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch invoice", e))
    }

    #[instrument(skip(self))]
    async fn find_invoice_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Invoice>, BillingError> {
        let _timer = db_timer("find_invoice_by_session");

        sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE payment_session_id = $1 LIMIT 1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to fetch invoice by session", e))
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    async fn save_invoice(&self, invoice: &Invoice) -> Result<(), BillingError> {
        let _timer = db_timer("save_invoice");

        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, payment_session_id = $3, payment_link_url = $4,
                payment_link_expires_at = $5, paid_at = $6, paid_date = $7, paid_via = $8,
                updated_utc = NOW()
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.status.as_str())
        .bind(&invoice.payment_session_id)
        .bind(&invoice.payment_link_url)
        .bind(invoice.payment_link_expires_at)
        .bind(invoice.paid_at)
        .bind(invoice.paid_date)
        .bind(&invoice.paid_via)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to save invoice", e))?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound("invoice".to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, invoice, transaction), fields(invoice_id = %invoice.invoice_id))]
    async fn mark_invoice_paid(
        &self,
        invoice: &Invoice,
        transaction: Option<&Transaction>,
    ) -> Result<bool, BillingError> {
        let _timer = db_timer("mark_invoice_paid");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::database("Failed to begin transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'paid', paid_at = $2, paid_date = $3, paid_via = $4,
                payment_link_url = NULL, payment_link_expires_at = NULL, updated_utc = NOW()
            WHERE invoice_id = $1 AND status IN ('sent', 'overdue')
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.paid_at)
        .bind(invoice.paid_date)
        .bind(&invoice.paid_via)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::database("Failed to mark invoice paid", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| BillingError::database("Failed to rollback", e))?;
            return Ok(false);
        }

        if let Some(t) = transaction {
            sqlx::query(
                r#"
                INSERT INTO transactions (transaction_id, organization_id, settlement_account_id,
                    invoice_id, kind, amount, currency, description, occurred_on, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(t.transaction_id)
            .bind(t.organization_id)
            .bind(t.settlement_account_id)
            .bind(t.invoice_id)
            .bind(t.kind)
            .bind(t.amount)
            .bind(&t.currency)
            .bind(&t.description)
            .bind(t.occurred_on)
            .bind(t.created_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::database("Failed to create transaction", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::database("Failed to commit", e))?;

        info!(status = "paid", "Invoice settled");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn list_transactions(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<Transaction>, BillingError> {
        let _timer = db_timer("list_transactions");

        sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, organization_id, settlement_account_id, invoice_id, kind,
                   amount, currency, description, occurred_on, created_utc
            FROM transactions WHERE organization_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to list transactions", e))
    }
}
