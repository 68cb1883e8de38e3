//! Invoice payment link and reconciliation endpoints.

use crate::error::BillingError;
use crate::middleware::CallerContext;
use crate::models::{Invoice, InvoiceStatus, PaymentLink};
use crate::services::access::{CREATE_PAYMENT_LINK, REFRESH_PAYMENT};
use crate::services::{BillingStore, InvoiceStore, PaymentProvider};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

/// Payment view of an invoice after a reconciliation poll.
#[derive(Debug, Serialize)]
pub struct InvoicePaymentStatus {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_date: Option<NaiveDate>,
    pub paid_via: Option<String>,
}

impl From<Invoice> for InvoicePaymentStatus {
    fn from(invoice: Invoice) -> Self {
        Self {
            invoice_id: invoice.invoice_id,
            status: invoice.status,
            paid_at: invoice.paid_at,
            paid_date: invoice.paid_date,
            paid_via: invoice.paid_via,
        }
    }
}

/// Invoices of other organizations read as missing.
async fn ensure_owned<S: BillingStore>(
    store: &S,
    caller: &CallerContext,
    invoice_id: Uuid,
) -> Result<(), AppError> {
    match store.get_invoice(invoice_id).await? {
        Some(invoice) if invoice.organization_id == caller.organization_id => Ok(()),
        _ => Err(BillingError::NotFound("invoice".to_string()).into()),
    }
}

pub async fn create_payment_link<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    caller: CallerContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<PaymentLink>, AppError> {
    state
        .guard
        .authorize(caller.organization_id, caller.role, &CREATE_PAYMENT_LINK)
        .await?;
    ensure_owned(&state.store, &caller, invoice_id).await?;

    let link = state.invoices.create_payment_link(invoice_id).await?;
    Ok(Json(link))
}

pub async fn refresh_payment<S: BillingStore, P: PaymentProvider>(
    State(state): State<AppState<S, P>>,
    caller: CallerContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoicePaymentStatus>, AppError> {
    state
        .guard
        .authorize(caller.organization_id, caller.role, &REFRESH_PAYMENT)
        .await?;
    ensure_owned(&state.store, &caller, invoice_id).await?;

    let invoice = state.invoices.refresh_payment_status(invoice_id).await?;
    Ok(Json(invoice.into()))
}
