//! Idempotency ledger rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Received,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "received" => Some(EventStatus::Received),
            "processed" => Some(EventStatus::Processed),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

/// One row per distinct external event id. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingEvent {
    pub event_id: Uuid,
    pub external_id: String,
    pub event_type: String,
    pub status: EventStatus,
    pub error: Option<String>,
    pub received_utc: DateTime<Utc>,
    pub processed_utc: Option<DateTime<Utc>>,
}

impl BillingEvent {
    pub fn received(external_id: &str, event_type: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            event_type: event_type.to_string(),
            status: EventStatus::Received,
            error: None,
            received_utc: Utc::now(),
            processed_utc: None,
        }
    }
}

/// Filter for the operator view of the ledger.
#[derive(Debug, Clone, Default)]
pub struct ListEventsFilter {
    pub status: Option<EventStatus>,
    pub limit: i64,
}
