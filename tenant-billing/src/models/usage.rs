//! Organization usage counters.

use super::{BillingStatus, LegacyStatus, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One row per organization. Counters never go below zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OrganizationUsage {
    pub organization_id: Uuid,
    pub projects: i64,
    pub clients: i64,
    pub proposals: i64,
    pub seats: i64,
    pub storage_bytes: i64,
    pub ai_credits: i64,
    pub updated_utc: DateTime<Utc>,
}

impl OrganizationUsage {
    pub fn empty(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            projects: 0,
            clients: 0,
            proposals: 0,
            seats: 0,
            storage_bytes: 0,
            ai_credits: 0,
            updated_utc: Utc::now(),
        }
    }

    pub fn get(&self, kind: ResourceKind) -> i64 {
        match kind {
            ResourceKind::Projects => self.projects,
            ResourceKind::Clients => self.clients,
            ResourceKind::Proposals => self.proposals,
            ResourceKind::Seats => self.seats,
            ResourceKind::StorageBytes => self.storage_bytes,
            ResourceKind::AiCredits => self.ai_credits,
        }
    }

    /// Set a counter, clamping at zero.
    pub fn set(&mut self, kind: ResourceKind, value: i64) {
        let value = value.max(0);
        match kind {
            ResourceKind::Projects => self.projects = value,
            ResourceKind::Clients => self.clients = value,
            ResourceKind::Proposals => self.proposals = value,
            ResourceKind::Seats => self.seats = value,
            ResourceKind::StorageBytes => self.storage_bytes = value,
            ResourceKind::AiCredits => self.ai_credits = value,
        }
        self.updated_utc = Utc::now();
    }
}

/// Current count against the plan bound for one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub resource: ResourceKind,
    pub used: i64,
    /// `None` when unlimited.
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub organization_id: Uuid,
    pub plan_id: Option<String>,
    pub billing_status: BillingStatus,
    pub legacy_status: LegacyStatus,
    pub trial_expires_at: Option<DateTime<Utc>>,
    pub resources: Vec<ResourceUsage>,
}
