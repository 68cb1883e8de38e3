//! Plan and entitlement models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Quota-tracked resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Projects,
    Clients,
    Proposals,
    Seats,
    #[serde(rename = "storage")]
    StorageBytes,
    AiCredits,
}

/// Where the current count of a resource comes from when reserving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountSource {
    /// Re-derived by counting live records under the usage lock.
    Live,
    /// Trusted running counter on the usage row.
    Counter,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Projects,
        ResourceKind::Clients,
        ResourceKind::Proposals,
        ResourceKind::Seats,
        ResourceKind::StorageBytes,
        ResourceKind::AiCredits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Projects => "projects",
            ResourceKind::Clients => "clients",
            ResourceKind::Proposals => "proposals",
            ResourceKind::Seats => "seats",
            ResourceKind::StorageBytes => "storage",
            ResourceKind::AiCredits => "ai_credits",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    pub fn count_source(&self) -> CountSource {
        match self {
            ResourceKind::Projects
            | ResourceKind::Clients
            | ResourceKind::Proposals
            | ResourceKind::Seats => CountSource::Live,
            ResourceKind::StorageBytes | ResourceKind::AiCredits => CountSource::Counter,
        }
    }

    /// Table holding the live records for re-derived kinds.
    pub fn live_table(&self) -> Option<&'static str> {
        match self {
            ResourceKind::Projects => Some("projects"),
            ResourceKind::Clients => Some("clients"),
            ResourceKind::Proposals => Some("proposals"),
            ResourceKind::Seats => Some("organization_members"),
            ResourceKind::StorageBytes | ResourceKind::AiCredits => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named tier; immutable reference data.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_id: String,
    pub name: String,
    pub provider_price_id: Option<String>,
    pub is_trial: bool,
    pub created_utc: DateTime<Utc>,
}

/// Resource bounds for a plan. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Entitlement {
    pub plan_id: String,
    pub max_projects: Option<i64>,
    pub max_clients: Option<i64>,
    pub max_proposals: Option<i64>,
    pub max_seats: Option<i64>,
    pub max_storage_bytes: Option<i64>,
    pub max_ai_credits: Option<i64>,
}

impl Entitlement {
    pub fn unlimited(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            ..Default::default()
        }
    }

    pub fn bound(&self, kind: ResourceKind) -> Option<i64> {
        match kind {
            ResourceKind::Projects => self.max_projects,
            ResourceKind::Clients => self.max_clients,
            ResourceKind::Proposals => self.max_proposals,
            ResourceKind::Seats => self.max_seats,
            ResourceKind::StorageBytes => self.max_storage_bytes,
            ResourceKind::AiCredits => self.max_ai_credits,
        }
    }
}

/// Plan with its bounds, as exposed on the read surface.
#[derive(Debug, Clone, Serialize)]
pub struct PlanWithEntitlement {
    #[serde(flatten)]
    pub plan: Plan,
    pub entitlement: Option<Entitlement>,
}
