//! Entitlement checks and quota reservation.
//!
//! Every decision is made while the organization's usage row is locked, and
//! the new count is written before the lock is released. Two reservations
//! for the same organization therefore serialize; different organizations
//! never contend.

use super::metrics::record_quota_rejection;
use super::store::{BillingStore, UsageTx};
use crate::error::{BillingError, ValidationFailure};
use crate::models::{CountSource, Entitlement, ResourceKind, ResourceUsage, UsageReport};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct QuotaEngine<S> {
    store: S,
}

impl<S: BillingStore> QuotaEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// `None` means no limits apply: no organization, no plan, or a plan
    /// without an entitlement row.
    #[instrument(skip(self))]
    pub async fn get_entitlement(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<Entitlement>, BillingError> {
        let Some(org) = self.store.get_organization(organization_id).await? else {
            return Ok(None);
        };
        let Some(plan_id) = org.plan_id.as_deref() else {
            return Ok(None);
        };
        self.store.get_entitlement(plan_id).await
    }

    /// Check and reserve inside a caller-owned unit of work.
    ///
    /// Use this when the record being paid for is created in the same unit
    /// of work, so the usage lock also covers the insert. The lock is held
    /// until the caller commits or drops `tx`.
    #[instrument(skip(self, tx))]
    pub async fn ensure_and_reserve_in(
        &self,
        tx: &mut S::Tx,
        organization_id: Uuid,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<(), BillingError> {
        if delta < 0 {
            return Err(ValidationFailure::NegativeDelta.into());
        }

        let Some(bound) = self
            .get_entitlement(organization_id)
            .await?
            .and_then(|e| e.bound(resource))
        else {
            debug!(resource = %resource, "No bound configured, reservation skipped");
            return Ok(());
        };

        let mut usage = tx.lock_usage(organization_id).await?;
        // Live kinds also honor the stored counter, so reservations that are
        // not yet backed by a record still hold their slot.
        let current = match resource.count_source() {
            CountSource::Live => tx
                .count_live(organization_id, resource)
                .await?
                .max(usage.get(resource)),
            CountSource::Counter => usage.get(resource),
        };

        let Some(updated) = current.checked_add(delta).filter(|n| *n <= bound) else {
            record_quota_rejection(resource.as_str());
            warn!(
                organization_id = %organization_id,
                resource = %resource,
                current = current,
                delta = delta,
                bound = bound,
                "Quota exceeded"
            );
            return Err(BillingError::QuotaExceeded { resource });
        };

        usage.set(resource, updated);
        tx.write_usage(&usage).await?;
        Ok(())
    }

    /// Check and reserve in a unit of work of its own.
    pub async fn ensure_and_reserve(
        &self,
        organization_id: Uuid,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<(), BillingError> {
        let mut tx = self.store.begin_usage().await?;
        self.ensure_and_reserve_in(&mut tx, organization_id, resource, delta)
            .await?;
        tx.commit().await
    }

    pub async fn ensure_and_reserve_storage(
        &self,
        organization_id: Uuid,
        bytes_to_add: i64,
    ) -> Result<(), BillingError> {
        self.ensure_and_reserve(organization_id, ResourceKind::StorageBytes, bytes_to_add)
            .await
    }

    pub async fn ensure_and_reserve_ai_credits(
        &self,
        organization_id: Uuid,
        credits_to_add: i64,
    ) -> Result<(), BillingError> {
        self.ensure_and_reserve(organization_id, ResourceKind::AiCredits, credits_to_add)
            .await
    }

    /// Unconditional adjustment under the usage lock. Clamps at zero.
    #[instrument(skip(self))]
    pub async fn adjust_usage(
        &self,
        organization_id: Uuid,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<i64, BillingError> {
        let mut tx = self.store.begin_usage().await?;
        let mut usage = tx.lock_usage(organization_id).await?;
        usage.set(resource, usage.get(resource).saturating_add(delta));
        let updated = usage.get(resource);
        tx.write_usage(&usage).await?;
        tx.commit().await?;

        info!(resource = %resource, delta = delta, value = updated, "Usage adjusted");
        Ok(updated)
    }

    pub async fn increment_usage(
        &self,
        organization_id: Uuid,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<i64, BillingError> {
        if delta < 0 {
            return Err(ValidationFailure::NegativeDelta.into());
        }
        self.adjust_usage(organization_id, resource, delta).await
    }

    /// Release units after a delete or a failed downstream create.
    pub async fn decrement_usage(
        &self,
        organization_id: Uuid,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<i64, BillingError> {
        if delta < 0 {
            return Err(ValidationFailure::NegativeDelta.into());
        }
        self.adjust_usage(organization_id, resource, -delta).await
    }

    /// Counts and bounds for every tracked resource, plus plan and status.
    #[instrument(skip(self))]
    pub async fn usage_report(&self, organization_id: Uuid) -> Result<UsageReport, BillingError> {
        let org = self
            .store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("organization".to_string()))?;

        let entitlement = match org.plan_id.as_deref() {
            Some(plan_id) => self.store.get_entitlement(plan_id).await?,
            None => None,
        };
        let usage = self.store.get_usage(organization_id).await?;

        let resources = ResourceKind::ALL
            .into_iter()
            .map(|resource| ResourceUsage {
                resource,
                used: usage.as_ref().map_or(0, |u| u.get(resource)),
                limit: entitlement.as_ref().and_then(|e| e.bound(resource)),
            })
            .collect();

        let status = org.effective_status(chrono::Utc::now());
        Ok(UsageReport {
            organization_id,
            plan_id: org.plan_id.clone(),
            billing_status: status,
            legacy_status: status.legacy(),
            trial_expires_at: org.trial_expires_at,
            resources,
        })
    }
}
