//! Organization billing status driven by subscription lifecycle events.

use super::metrics::record_status_transition;
use super::store::{BillingStore, UsageTx};
use super::webhook::{BillingEventKind, EventHandler, HandlerOutcome, WebhookEvent};
use crate::error::BillingError;
use crate::models::{BillingStatus, Organization};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_TRIAL_DAYS: i64 = 7;

/// Fields the handlers read from a provider object.
struct ProviderObject<'a>(&'a Value);

impl<'a> ProviderObject<'a> {
    fn str(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn metadata_organization_id(&self) -> Option<Uuid> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("organization_id"))
            .and_then(Value::as_str)
            .or_else(|| self.str("client_reference_id"))
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Price of the first subscription item, falling back to the legacy `plan` field.
    fn price_id(&self) -> Option<&'a str> {
        self.0
            .pointer("/items/data/0/price/id")
            .and_then(Value::as_str)
            .or_else(|| self.0.pointer("/plan/id").and_then(Value::as_str))
    }

    fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.0
            .get(key)
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }
}

#[derive(Clone)]
pub struct BillingStateMachine<S> {
    store: S,
    trial_days: i64,
    default_trial_plan: Option<String>,
}

impl<S: BillingStore> BillingStateMachine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            trial_days: DEFAULT_TRIAL_DAYS,
            default_trial_plan: None,
        }
    }

    pub fn with_trial(mut self, days: i64, default_plan_id: Option<String>) -> Self {
        self.trial_days = days;
        self.default_trial_plan = default_plan_id;
        self
    }

    /// Create an organization in `trial_active` with the trial plan and an
    /// empty usage row.
    #[instrument(skip(self))]
    pub async fn onboard(&self, name: &str) -> Result<Organization, BillingError> {
        let now = Utc::now();
        let mut org = Organization::new(name, now);
        org.trial_expires_at = Some(now + Duration::days(self.trial_days));

        let plan = match &self.default_trial_plan {
            Some(plan_id) => self.store.get_plan(plan_id).await?,
            None => self.store.find_trial_plan().await?,
        };
        match plan {
            Some(plan) => org.plan_id = Some(plan.plan_id),
            None => warn!("No trial plan configured, organization starts without limits"),
        }

        self.store.create_organization(&org).await?;

        let mut tx = self.store.begin_usage().await?;
        tx.lock_usage(org.organization_id).await?;
        tx.commit().await?;

        info!(
            organization_id = %org.organization_id,
            plan_id = ?org.plan_id,
            trial_expires_at = ?org.trial_expires_at,
            "Organization onboarded"
        );
        Ok(org)
    }

    async fn find_organization(
        &self,
        object: &ProviderObject<'_>,
        customer_key: &str,
        subscription_key: &str,
    ) -> Result<Organization, BillingError> {
        if let Some(id) = object.metadata_organization_id() {
            if let Some(org) = self.store.get_organization(id).await? {
                return Ok(org);
            }
        }
        if let Some(customer) = object.str(customer_key) {
            if let Some(org) = self.store.find_organization_by_customer(customer).await? {
                return Ok(org);
            }
        }
        if let Some(subscription) = object.str(subscription_key) {
            if let Some(org) = self.store.find_organization_by_subscription(subscription).await? {
                return Ok(org);
            }
        }
        Err(BillingError::NotFound("organization for event".to_string()))
    }

    async fn resolve_plan(
        &self,
        org: &mut Organization,
        object: &ProviderObject<'_>,
    ) -> Result<(), BillingError> {
        let Some(price_id) = object.price_id() else {
            return Ok(());
        };
        match self.store.find_plan_by_price(price_id).await? {
            Some(plan) => org.plan_id = Some(plan.plan_id),
            None => warn!(
                organization_id = %org.organization_id,
                price_id = %price_id,
                "No plan for price, keeping current plan"
            ),
        }
        Ok(())
    }

    fn transition(org: &mut Organization, to: BillingStatus) {
        let from = org.status();
        org.billing_status = Some(to);
        if from != to {
            record_status_transition(to.as_str());
            info!(
                organization_id = %org.organization_id,
                from = %from,
                to = %to,
                "Billing status changed"
            );
        }
    }

    /// Older subscription events must not overwrite newer state.
    fn is_stale(org: &Organization, event: &WebhookEvent) -> bool {
        matches!(
            (event.created_at(), org.subscription_event_at),
            (Some(created), Some(applied)) if created < applied
        )
    }

    fn stamp(org: &mut Organization, event: &WebhookEvent) {
        if let Some(created) = event.created_at() {
            org.subscription_event_at = Some(
                org.subscription_event_at
                    .map_or(created, |applied| applied.max(created)),
            );
        }
    }

    async fn subscription_changed(
        &self,
        event: &WebhookEvent,
        kind: &BillingEventKind,
    ) -> Result<HandlerOutcome, BillingError> {
        let object = ProviderObject(&event.data.object);
        let mut org = self.find_organization(&object, "customer", "id").await?;

        if Self::is_stale(&org, event) {
            warn!(
                organization_id = %org.organization_id,
                event_id = %event.id,
                "Skipping out-of-order subscription event"
            );
            return Ok(HandlerOutcome::Skipped);
        }

        match kind {
            BillingEventKind::SubscriptionCreated => {
                self.resolve_plan(&mut org, &object).await?;
                if let Some(id) = object.str("id") {
                    org.provider_subscription_id = Some(id.to_string());
                }
                if org.provider_customer_id.is_none() {
                    org.provider_customer_id = object.str("customer").map(str::to_string);
                }
                Self::transition(&mut org, BillingStatus::Active);
            }
            BillingEventKind::SubscriptionUpdated => {
                self.resolve_plan(&mut org, &object).await?;
                let provider_status = object.str("status").unwrap_or_default();
                let status = BillingStatus::from_provider_status(provider_status);
                if status == BillingStatus::BillingPendingReview {
                    warn!(
                        organization_id = %org.organization_id,
                        provider_status = %provider_status,
                        "Provider status needs review"
                    );
                }
                Self::transition(&mut org, status);
            }
            _ => Self::transition(&mut org, BillingStatus::Canceled),
        }

        Self::stamp(&mut org, event);
        self.store.save_organization(&org).await?;
        Ok(HandlerOutcome::Applied)
    }

    async fn trial_will_end(&self, event: &WebhookEvent) -> Result<HandlerOutcome, BillingError> {
        let object = ProviderObject(&event.data.object);
        let mut org = self.find_organization(&object, "customer", "id").await?;

        let Some(trial_end) = object.timestamp("trial_end") else {
            warn!(organization_id = %org.organization_id, "Trial notice without trial_end");
            return Ok(HandlerOutcome::Skipped);
        };

        org.trial_expires_at = Some(trial_end);
        self.store.save_organization(&org).await?;
        info!(
            organization_id = %org.organization_id,
            trial_expires_at = %trial_end,
            "Trial expiry updated"
        );
        Ok(HandlerOutcome::Applied)
    }

    async fn invoice_payment(
        &self,
        event: &WebhookEvent,
        succeeded: bool,
    ) -> Result<HandlerOutcome, BillingError> {
        let object = ProviderObject(&event.data.object);
        let mut org = self.find_organization(&object, "customer", "subscription").await?;

        if succeeded {
            if org.status() != BillingStatus::PastDue {
                return Ok(HandlerOutcome::Skipped);
            }
            Self::transition(&mut org, BillingStatus::Active);
        } else {
            Self::transition(&mut org, BillingStatus::PastDue);
        }

        self.store.save_organization(&org).await?;
        Ok(HandlerOutcome::Applied)
    }

    async fn checkout_completed(
        &self,
        event: &WebhookEvent,
    ) -> Result<HandlerOutcome, BillingError> {
        let object = ProviderObject(&event.data.object);
        let mut org = self.find_organization(&object, "customer", "subscription").await?;

        if let Some(subscription) = object.str("subscription") {
            org.provider_subscription_id = Some(subscription.to_string());
        }
        if org.provider_customer_id.is_none() {
            org.provider_customer_id = object.str("customer").map(str::to_string);
        }
        Self::transition(&mut org, BillingStatus::Active);

        self.store.save_organization(&org).await?;
        Ok(HandlerOutcome::Applied)
    }

    async fn customer_changed(
        &self,
        event: &WebhookEvent,
        deleted: bool,
    ) -> Result<HandlerOutcome, BillingError> {
        let object = ProviderObject(&event.data.object);
        let mut org = self.find_organization(&object, "id", "subscription").await?;

        if deleted {
            org.provider_customer_id = None;
            Self::transition(&mut org, BillingStatus::Canceled);
        } else if let Some(customer) = object.str("id") {
            org.provider_customer_id = Some(customer.to_string());
        }

        self.store.save_organization(&org).await?;
        Ok(HandlerOutcome::Applied)
    }
}

#[async_trait]
impl<S: BillingStore> EventHandler for BillingStateMachine<S> {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    async fn handle(&self, event: &WebhookEvent) -> Result<HandlerOutcome, BillingError> {
        let kind = BillingEventKind::from_type(&event.event_type);
        match kind {
            BillingEventKind::SubscriptionCreated
            | BillingEventKind::SubscriptionUpdated
            | BillingEventKind::SubscriptionDeleted => {
                self.subscription_changed(event, &kind).await
            }
            BillingEventKind::SubscriptionTrialWillEnd => self.trial_will_end(event).await,
            BillingEventKind::InvoicePaymentSucceeded => self.invoice_payment(event, true).await,
            BillingEventKind::InvoicePaymentFailed => self.invoice_payment(event, false).await,
            BillingEventKind::CheckoutCompleted => self.checkout_completed(event).await,
            BillingEventKind::CustomerCreated | BillingEventKind::CustomerUpdated => {
                self.customer_changed(event, false).await
            }
            BillingEventKind::CustomerDeleted => self.customer_changed(event, true).await,
            BillingEventKind::Unknown(_) => Ok(HandlerOutcome::NoHandler),
        }
    }
}
