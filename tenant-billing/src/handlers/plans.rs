//! Read-only plan catalogue.

use crate::middleware::CallerContext;
use crate::models::PlanWithEntitlement;
use crate::services::{BillingStore, PaymentProvider, PlanStore};
use crate::startup::AppState;
use axum::{extract::State, Json};
use service_core::error::AppError;

pub async fn list_plans<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    caller: CallerContext,
) -> Result<Json<Vec<PlanWithEntitlement>>, AppError> {
    tracing::debug!(org_id = %caller.organization_id, "Listing plans");

    let plans = state.store.list_plans().await?;
    let mut catalogue = Vec::with_capacity(plans.len());
    for plan in plans {
        let entitlement = state.store.get_entitlement(&plan.plan_id).await?;
        catalogue.push(PlanWithEntitlement { plan, entitlement });
    }
    Ok(Json(catalogue))
}
