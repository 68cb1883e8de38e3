//! Usage report and quota reservation endpoints.

use crate::middleware::CallerContext;
use crate::models::{ResourceKind, ResourceUsage, UsageReport};
use crate::services::access::{RELEASE_USAGE, RESERVE_USAGE, VIEW_USAGE};
use crate::services::{BillingStore, PaymentProvider};
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct UsageDeltaRequest {
    pub resource: ResourceKind,
    #[validate(range(min = 0, message = "Delta must not be negative"))]
    pub delta: i64,
}

#[derive(Debug, Serialize)]
pub struct ReservationResponse {
    pub resource: ResourceKind,
    pub reserved: i64,
}

pub async fn get_usage<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    caller: CallerContext,
) -> Result<Json<UsageReport>, AppError> {
    state
        .guard
        .authorize(caller.organization_id, caller.role, &VIEW_USAGE)
        .await?;

    let report = state.quota.usage_report(caller.organization_id).await?;
    Ok(Json(report))
}

/// Reserve units ahead of creating a resource.
pub async fn reserve_usage<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    caller: CallerContext,
    Json(request): Json<UsageDeltaRequest>,
) -> Result<(StatusCode, Json<ReservationResponse>), AppError> {
    request.validate()?;
    state
        .guard
        .authorize(caller.organization_id, caller.role, &RESERVE_USAGE)
        .await?;

    state
        .quota
        .ensure_and_reserve(caller.organization_id, request.resource, request.delta)
        .await?;

    tracing::info!(
        org_id = %caller.organization_id,
        resource = %request.resource,
        delta = request.delta,
        "Usage reserved"
    );
    Ok((
        StatusCode::CREATED,
        Json(ReservationResponse {
            resource: request.resource,
            reserved: request.delta,
        }),
    ))
}

/// Give units back after a delete or a failed create.
pub async fn release_usage<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    caller: CallerContext,
    Json(request): Json<UsageDeltaRequest>,
) -> Result<Json<ResourceUsage>, AppError> {
    request.validate()?;
    state
        .guard
        .authorize(caller.organization_id, caller.role, &RELEASE_USAGE)
        .await?;

    let used = state
        .quota
        .decrement_usage(caller.organization_id, request.resource, request.delta)
        .await?;
    let limit = state
        .quota
        .get_entitlement(caller.organization_id)
        .await?
        .and_then(|e| e.bound(request.resource));

    Ok(Json(ResourceUsage {
        resource: request.resource,
        used,
        limit,
    }))
}
