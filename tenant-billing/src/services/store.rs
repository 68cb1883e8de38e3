//! Persistence seams for the billing subsystem.
//!
//! Every component is generic over a [`BillingStore`] handle passed in at
//! construction. [`PgStore`](super::PgStore) backs production,
//! [`InMemoryStore`](super::InMemoryStore) backs tests and local runs.

use crate::error::BillingError;
use crate::models::{
    BillingEvent, Entitlement, EventStatus, Invoice, ListEventsFilter, Organization,
    OrganizationUsage, Plan, ResourceKind, Transaction,
};
use async_trait::async_trait;
use uuid::Uuid;

/// Durable de-duplication record for inbound provider events.
#[async_trait]
pub trait EventLedgerStore: Send + Sync {
    async fn find_event(&self, external_id: &str) -> Result<Option<BillingEvent>, BillingError>;

    /// Insert a `received` row in one atomic step.
    /// Returns `None` when a row with the same external id already exists.
    async fn insert_event_if_absent(
        &self,
        external_id: &str,
        event_type: &str,
    ) -> Result<Option<BillingEvent>, BillingError>;

    async fn set_event_status(
        &self,
        external_id: &str,
        status: EventStatus,
        error: Option<&str>,
    ) -> Result<(), BillingError>;

    async fn list_events(
        &self,
        filter: &ListEventsFilter,
    ) -> Result<Vec<BillingEvent>, BillingError>;
}

#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn create_organization(&self, org: &Organization) -> Result<(), BillingError>;

    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>, BillingError>;

    async fn find_organization_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Organization>, BillingError>;

    async fn find_organization_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Organization>, BillingError>;

    async fn save_organization(&self, org: &Organization) -> Result<(), BillingError>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn list_plans(&self) -> Result<Vec<Plan>, BillingError>;

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>, BillingError>;

    async fn find_plan_by_price(&self, price_id: &str) -> Result<Option<Plan>, BillingError>;

    async fn find_trial_plan(&self) -> Result<Option<Plan>, BillingError>;

    async fn get_entitlement(&self, plan_id: &str) -> Result<Option<Entitlement>, BillingError>;
}

/// Unit of work over one or more organizations' usage rows.
///
/// Locks taken by [`lock_usage`](UsageTx::lock_usage) are held until
/// [`commit`](UsageTx::commit) or drop. Dropping without commit discards
/// every write made through the unit of work.
#[async_trait]
pub trait UsageTx: Send + Sized {
    /// Create the row if missing, then lock it and return its current values.
    async fn lock_usage(&mut self, organization_id: Uuid)
        -> Result<OrganizationUsage, BillingError>;

    /// Count live records for a re-derived resource kind.
    async fn count_live(
        &mut self,
        organization_id: Uuid,
        kind: ResourceKind,
    ) -> Result<i64, BillingError>;

    async fn write_usage(&mut self, usage: &OrganizationUsage) -> Result<(), BillingError>;

    async fn commit(self) -> Result<(), BillingError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    type Tx: UsageTx;

    async fn begin_usage(&self) -> Result<Self::Tx, BillingError>;

    /// Unlocked snapshot for reporting. Never use it for a quota decision.
    async fn get_usage(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<OrganizationUsage>, BillingError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError>;

    async fn find_invoice_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Invoice>, BillingError>;

    async fn save_invoice(&self, invoice: &Invoice) -> Result<(), BillingError>;

    /// Persist a paid invoice and its transaction together.
    ///
    /// Only applies when the stored invoice is not already paid. Returns
    /// whether this call performed the transition.
    async fn mark_invoice_paid(
        &self,
        invoice: &Invoice,
        transaction: Option<&Transaction>,
    ) -> Result<bool, BillingError>;

    async fn list_transactions(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<Transaction>, BillingError>;
}

/// Everything the billing components need from persistence.
pub trait BillingStore:
    EventLedgerStore + OrganizationStore + PlanStore + UsageStore + InvoiceStore + Clone + 'static
{
}

impl<T> BillingStore for T where
    T: EventLedgerStore
        + OrganizationStore
        + PlanStore
        + UsageStore
        + InvoiceStore
        + Clone
        + 'static
{
}
