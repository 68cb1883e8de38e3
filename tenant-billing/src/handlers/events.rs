//! Operator view of the webhook ledger.

use crate::middleware::CallerContext;
use crate::models::{BillingEvent, EventStatus, ListEventsFilter};
use crate::services::access::VIEW_BILLING_EVENTS;
use crate::services::{BillingStore, PaymentProvider};
use crate::startup::AppState;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use service_core::error::AppError;
use validator::Validate;

const DEFAULT_LIMIT: i64 = 50;

#[derive(Debug, Deserialize, Validate)]
pub struct ListEventsQuery {
    pub status: Option<String>,
    #[validate(range(min = 1, max = 500))]
    pub limit: Option<i64>,
}

/// Most recent events first, e.g. `?status=failed`.
pub async fn list_billing_events<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    caller: CallerContext,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<BillingEvent>>, AppError> {
    query.validate()?;
    state
        .guard
        .authorize(caller.organization_id, caller.role, &VIEW_BILLING_EVENTS)
        .await?;

    let status = match query.status.as_deref() {
        Some(s) => Some(EventStatus::from_string(s).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Unknown event status: {}", s))
        })?),
        None => None,
    };
    let filter = ListEventsFilter {
        status,
        limit: query.limit.unwrap_or(DEFAULT_LIMIT),
    };

    let events = state.ledger.list_events(&filter).await?;
    Ok(Json(events))
}
