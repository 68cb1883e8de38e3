//! Organization model and billing status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing status of an organization's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    TrialActive,
    TrialEnded,
    Active,
    PastDue,
    Canceled,
    Blocked,
    BillingPendingReview,
}

/// What a billing status permits, before role checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAccess {
    Full,
    ReadOnly,
    Denied,
}

impl BillingStatus {
    pub const ALL: [BillingStatus; 7] = [
        BillingStatus::TrialActive,
        BillingStatus::TrialEnded,
        BillingStatus::Active,
        BillingStatus::PastDue,
        BillingStatus::Canceled,
        BillingStatus::Blocked,
        BillingStatus::BillingPendingReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::TrialActive => "trial_active",
            BillingStatus::TrialEnded => "trial_ended",
            BillingStatus::Active => "active",
            BillingStatus::PastDue => "past_due",
            BillingStatus::Canceled => "canceled",
            BillingStatus::Blocked => "blocked",
            BillingStatus::BillingPendingReview => "billing_pending_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Map a payment-provider subscription status onto a local status.
    ///
    /// Unrecognized values land in `BillingPendingReview`, never `Active`.
    pub fn from_provider_status(provider_status: &str) -> Self {
        match provider_status {
            "active" => BillingStatus::Active,
            "past_due" | "unpaid" => BillingStatus::PastDue,
            "canceled" | "incomplete_expired" => BillingStatus::Canceled,
            "incomplete" => BillingStatus::BillingPendingReview,
            "trialing" => BillingStatus::TrialActive,
            _ => BillingStatus::BillingPendingReview,
        }
    }

    pub fn access(&self) -> StatusAccess {
        match self {
            BillingStatus::TrialActive | BillingStatus::Active => StatusAccess::Full,
            BillingStatus::TrialEnded
            | BillingStatus::PastDue
            | BillingStatus::BillingPendingReview => StatusAccess::ReadOnly,
            BillingStatus::Canceled | BillingStatus::Blocked => StatusAccess::Denied,
        }
    }

    /// What the customer has to do to regain write access.
    pub fn required_action(&self) -> &'static str {
        match self {
            BillingStatus::TrialEnded => "Choose a plan to continue.",
            BillingStatus::PastDue => "Update your payment method to continue.",
            BillingStatus::BillingPendingReview => {
                "Your billing details are under review; complete any pending payment steps."
            }
            BillingStatus::Canceled | BillingStatus::Blocked => {
                "Contact support to restore access."
            }
            BillingStatus::TrialActive | BillingStatus::Active => "No action required.",
        }
    }

    /// Project onto the three-value status older consumers understand.
    pub fn legacy(&self) -> LegacyStatus {
        match self {
            BillingStatus::TrialActive => LegacyStatus::Trialing,
            BillingStatus::Active | BillingStatus::PastDue => LegacyStatus::Active,
            BillingStatus::TrialEnded
            | BillingStatus::Canceled
            | BillingStatus::Blocked
            | BillingStatus::BillingPendingReview => LegacyStatus::Inactive,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status values written by records that predate `billing_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyStatus {
    Trialing,
    Active,
    Inactive,
}

impl LegacyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyStatus::Trialing => "trialing",
            LegacyStatus::Active => "active",
            LegacyStatus::Inactive => "inactive",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(LegacyStatus::Trialing),
            "active" => Some(LegacyStatus::Active),
            "inactive" => Some(LegacyStatus::Inactive),
            _ => None,
        }
    }
}

/// Resolve the status to enforce for a record whose `billing_status` may be
/// unset. Legacy values are mapped; anything else is held for review.
pub fn resolve_status(stored: Option<BillingStatus>, legacy: Option<&str>) -> BillingStatus {
    if let Some(status) = stored {
        return status;
    }

    match legacy.and_then(LegacyStatus::from_string) {
        Some(LegacyStatus::Trialing) => BillingStatus::TrialActive,
        Some(LegacyStatus::Active) => BillingStatus::Active,
        Some(LegacyStatus::Inactive) => BillingStatus::Canceled,
        None => BillingStatus::BillingPendingReview,
    }
}

/// Tenant root.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub organization_id: Uuid,
    pub name: String,
    pub billing_status: Option<BillingStatus>,
    pub legacy_status: Option<String>,
    pub plan_id: Option<String>,
    pub trial_expires_at: Option<DateTime<Utc>>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub default_settlement_account_id: Option<Uuid>,
    /// Provider timestamp of the last subscription event applied.
    pub subscription_event_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            organization_id: Uuid::new_v4(),
            name: name.into(),
            billing_status: Some(BillingStatus::TrialActive),
            legacy_status: None,
            plan_id: None,
            trial_expires_at: None,
            provider_customer_id: None,
            provider_subscription_id: None,
            default_settlement_account_id: None,
            subscription_event_at: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Stored status with legacy records normalized.
    pub fn status(&self) -> BillingStatus {
        resolve_status(self.billing_status, self.legacy_status.as_deref())
    }

    /// Status to enforce at `now`: a trial past its expiry counts as ended.
    pub fn effective_status(&self, now: DateTime<Utc>) -> BillingStatus {
        match (self.status(), self.trial_expires_at) {
            (BillingStatus::TrialActive, Some(expires)) if expires <= now => {
                BillingStatus::TrialEnded
            }
            (status, _) => status,
        }
    }
}
