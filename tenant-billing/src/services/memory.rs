//! In-memory store used by tests and local runs without PostgreSQL.
//!
//! Usage rows sit behind per-organization `tokio` mutexes. An
//! [`InMemoryTx`] holds the owned guard for every row it locked, which gives
//! the same serialisation as `SELECT ... FOR UPDATE` inside one process.

use super::store::{
    EventLedgerStore, InvoiceStore, OrganizationStore, PlanStore, UsageStore, UsageTx,
};
use crate::error::BillingError;
use crate::models::{
    BillingEvent, CountSource, Entitlement, EventStatus, Invoice, InvoiceStatus,
    ListEventsFilter, Organization, OrganizationUsage, Plan, ResourceKind, Transaction,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    events: DashMap<String, BillingEvent>,
    organizations: DashMap<Uuid, Organization>,
    plans: DashMap<String, Plan>,
    entitlements: DashMap<String, Entitlement>,
    usage: DashMap<Uuid, Arc<Mutex<OrganizationUsage>>>,
    live_records: DashMap<(Uuid, ResourceKind), i64>,
    invoices: DashMap<Uuid, Invoice>,
    transactions: DashMap<Uuid, Transaction>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: Plan, entitlement: Option<Entitlement>) {
        if let Some(entitlement) = entitlement {
            self.inner
                .entitlements
                .insert(plan.plan_id.clone(), entitlement);
        }
        self.inner.plans.insert(plan.plan_id.clone(), plan);
    }

    pub fn insert_invoice(&self, invoice: Invoice) {
        self.inner.invoices.insert(invoice.invoice_id, invoice);
    }

    /// Stand in for records created by the CRUD services.
    pub fn seed_live_records(&self, organization_id: Uuid, kind: ResourceKind, count: i64) {
        *self
            .inner
            .live_records
            .entry((organization_id, kind))
            .or_insert(0) += count;
    }

    pub fn live_record_count(&self, organization_id: Uuid, kind: ResourceKind) -> i64 {
        self.inner
            .live_records
            .get(&(organization_id, kind))
            .map(|count| *count)
            .unwrap_or(0)
    }

    fn usage_cell(&self, organization_id: Uuid) -> Arc<Mutex<OrganizationUsage>> {
        self.inner
            .usage
            .entry(organization_id)
            .or_insert_with(|| Arc::new(Mutex::new(OrganizationUsage::empty(organization_id))))
            .clone()
    }
}

#[async_trait]
impl EventLedgerStore for InMemoryStore {
    async fn find_event(&self, external_id: &str) -> Result<Option<BillingEvent>, BillingError> {
        Ok(self.inner.events.get(external_id).map(|e| e.clone()))
    }

    async fn insert_event_if_absent(
        &self,
        external_id: &str,
        event_type: &str,
    ) -> Result<Option<BillingEvent>, BillingError> {
        match self.inner.events.entry(external_id.to_string()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let event = BillingEvent::received(external_id, event_type);
                slot.insert(event.clone());
                Ok(Some(event))
            }
        }
    }

    async fn set_event_status(
        &self,
        external_id: &str,
        status: EventStatus,
        error: Option<&str>,
    ) -> Result<(), BillingError> {
        let mut event = self
            .inner
            .events
            .get_mut(external_id)
            .ok_or_else(|| BillingError::NotFound(format!("billing event {}", external_id)))?;
        event.status = status;
        event.error = error.map(str::to_string);
        event.processed_utc = Some(Utc::now());
        Ok(())
    }

    async fn list_events(
        &self,
        filter: &ListEventsFilter,
    ) -> Result<Vec<BillingEvent>, BillingError> {
        let mut events: Vec<BillingEvent> = self
            .inner
            .events
            .iter()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .map(|e| e.clone())
            .collect();
        events.sort_by(|a, b| b.received_utc.cmp(&a.received_utc));
        events.truncate(filter.limit.max(0) as usize);
        Ok(events)
    }
}

#[async_trait]
impl OrganizationStore for InMemoryStore {
    async fn create_organization(&self, org: &Organization) -> Result<(), BillingError> {
        self.inner
            .organizations
            .insert(org.organization_id, org.clone());
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>, BillingError> {
        Ok(self.inner.organizations.get(&id).map(|o| o.clone()))
    }

    async fn find_organization_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Organization>, BillingError> {
        Ok(self
            .inner
            .organizations
            .iter()
            .find(|o| o.provider_customer_id.as_deref() == Some(customer_id))
            .map(|o| o.clone()))
    }

    async fn find_organization_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Organization>, BillingError> {
        Ok(self
            .inner
            .organizations
            .iter()
            .find(|o| o.provider_subscription_id.as_deref() == Some(subscription_id))
            .map(|o| o.clone()))
    }

    async fn save_organization(&self, org: &Organization) -> Result<(), BillingError> {
        let mut stored = self
            .inner
            .organizations
            .get_mut(&org.organization_id)
            .ok_or_else(|| BillingError::NotFound("organization".to_string()))?;
        *stored = org.clone();
        stored.updated_utc = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn list_plans(&self) -> Result<Vec<Plan>, BillingError> {
        let mut plans: Vec<Plan> = self.inner.plans.iter().map(|p| p.clone()).collect();
        plans.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(plans)
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>, BillingError> {
        Ok(self.inner.plans.get(plan_id).map(|p| p.clone()))
    }

    async fn find_plan_by_price(&self, price_id: &str) -> Result<Option<Plan>, BillingError> {
        Ok(self
            .inner
            .plans
            .iter()
            .find(|p| p.provider_price_id.as_deref() == Some(price_id))
            .map(|p| p.clone()))
    }

    async fn find_trial_plan(&self) -> Result<Option<Plan>, BillingError> {
        Ok(self
            .inner
            .plans
            .iter()
            .filter(|p| p.is_trial)
            .min_by_key(|p| p.created_utc)
            .map(|p| p.clone()))
    }

    async fn get_entitlement(&self, plan_id: &str) -> Result<Option<Entitlement>, BillingError> {
        Ok(self.inner.entitlements.get(plan_id).map(|e| e.clone()))
    }
}

/// Unit of work over in-memory usage rows.
pub struct InMemoryTx {
    store: InMemoryStore,
    guards: HashMap<Uuid, OwnedMutexGuard<OrganizationUsage>>,
    staged: HashMap<Uuid, OrganizationUsage>,
    staged_records: HashMap<(Uuid, ResourceKind), i64>,
}

impl InMemoryTx {
    /// Record creation that shares the usage lock, applied on commit.
    pub fn insert_live_record(&mut self, organization_id: Uuid, kind: ResourceKind) {
        *self.staged_records.entry((organization_id, kind)).or_insert(0) += 1;
    }
}

#[async_trait]
impl UsageTx for InMemoryTx {
    async fn lock_usage(
        &mut self,
        organization_id: Uuid,
    ) -> Result<OrganizationUsage, BillingError> {
        if let Some(staged) = self.staged.get(&organization_id) {
            return Ok(staged.clone());
        }
        if let Some(guard) = self.guards.get(&organization_id) {
            return Ok((**guard).clone());
        }

        let cell = self.store.usage_cell(organization_id);
        let guard = cell.lock_owned().await;
        let current = (*guard).clone();
        self.guards.insert(organization_id, guard);
        Ok(current)
    }

    async fn count_live(
        &mut self,
        organization_id: Uuid,
        kind: ResourceKind,
    ) -> Result<i64, BillingError> {
        if kind.count_source() != CountSource::Live {
            return Err(BillingError::database(
                "Failed to count records",
                format!("{} is counter-backed", kind),
            ));
        }
        let committed = self.store.live_record_count(organization_id, kind);
        let staged = self
            .staged_records
            .get(&(organization_id, kind))
            .copied()
            .unwrap_or(0);
        Ok((committed + staged).max(0))
    }

    async fn write_usage(&mut self, usage: &OrganizationUsage) -> Result<(), BillingError> {
        if !self.guards.contains_key(&usage.organization_id) {
            return Err(BillingError::database(
                "Failed to write usage row",
                "row is not locked by this transaction",
            ));
        }
        self.staged.insert(usage.organization_id, usage.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), BillingError> {
        for (organization_id, usage) in self.staged.drain() {
            if let Some(guard) = self.guards.get_mut(&organization_id) {
                **guard = usage;
            }
        }
        for ((organization_id, kind), delta) in self.staged_records.drain() {
            let mut count = self
                .store
                .inner
                .live_records
                .entry((organization_id, kind))
                .or_insert(0);
            *count = (*count + delta).max(0);
        }
        // Guards drop here, releasing the rows.
        Ok(())
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin_usage(&self) -> Result<InMemoryTx, BillingError> {
        Ok(InMemoryTx {
            store: self.clone(),
            guards: HashMap::new(),
            staged: HashMap::new(),
            staged_records: HashMap::new(),
        })
    }

    async fn get_usage(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<OrganizationUsage>, BillingError> {
        let cell = match self.inner.usage.get(&organization_id) {
            Some(cell) => cell.clone(),
            None => return Ok(None),
        };
        let usage = cell.lock().await.clone();
        Ok(Some(usage))
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError> {
        Ok(self.inner.invoices.get(&invoice_id).map(|i| i.clone()))
    }

    async fn find_invoice_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<Invoice>, BillingError> {
        Ok(self
            .inner
            .invoices
            .iter()
            .find(|i| i.payment_session_id.as_deref() == Some(session_id))
            .map(|i| i.clone()))
    }

    async fn save_invoice(&self, invoice: &Invoice) -> Result<(), BillingError> {
        let mut stored = self
            .inner
            .invoices
            .get_mut(&invoice.invoice_id)
            .ok_or_else(|| BillingError::NotFound("invoice".to_string()))?;
        *stored = invoice.clone();
        stored.updated_utc = Utc::now();
        Ok(())
    }

    async fn mark_invoice_paid(
        &self,
        invoice: &Invoice,
        transaction: Option<&Transaction>,
    ) -> Result<bool, BillingError> {
        // The shard write lock makes check-and-set atomic.
        let mut stored = self
            .inner
            .invoices
            .get_mut(&invoice.invoice_id)
            .ok_or_else(|| BillingError::NotFound("invoice".to_string()))?;
        if !stored.status.accepts_payment() {
            return Ok(false);
        }

        stored.status = InvoiceStatus::Paid;
        stored.paid_at = invoice.paid_at;
        stored.paid_date = invoice.paid_date;
        stored.paid_via = invoice.paid_via.clone();
        stored.payment_link_url = None;
        stored.payment_link_expires_at = None;
        stored.updated_utc = Utc::now();

        if let Some(t) = transaction {
            self.inner.transactions.insert(t.transaction_id, t.clone());
        }
        Ok(true)
    }

    async fn list_transactions(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<Transaction>, BillingError> {
        let mut transactions: Vec<Transaction> = self
            .inner
            .transactions
            .iter()
            .filter(|t| t.organization_id == organization_id)
            .map(|t| t.clone())
            .collect();
        transactions.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(transactions)
    }
}
