//! Provider webhook endpoints.
//!
//! Both endpoints answer `200 {"status":"success"}` once the delivery is
//! verified and parsed, whatever the handler did with it. Handler failures
//! live on the ledger row, so the provider does not retry a broken handler.

use crate::services::webhook::SIGNATURE_HEADER;
use crate::services::{BillingStore, PaymentProvider, WebhookProcessor};
use crate::startup::AppState;
use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use service_core::error::AppError;

async fn receive<S: BillingStore>(
    processor: &WebhookProcessor<S>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if signature.is_none() {
        tracing::warn!(endpoint = processor.endpoint(), "Missing webhook signature header");
    }

    let outcome = processor.process(body, signature).await?;
    tracing::info!(
        endpoint = processor.endpoint(),
        outcome = outcome.as_str(),
        "Webhook delivery handled"
    );
    Ok(Json(json!({ "status": "success" })))
}

/// Subscription lifecycle events.
pub async fn billing_webhook<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    receive(&state.billing_webhooks, &headers, &body).await
}

/// Checkout session events for invoice payments.
pub async fn settlement_webhook<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    receive(&state.settlement_webhooks, &headers, &body).await
}
