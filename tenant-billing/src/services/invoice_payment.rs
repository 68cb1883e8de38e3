//! Online payment lifecycle of a single invoice.
//!
//! `sent|overdue -> paid` is reachable from two entry points: the settlement
//! webhook (push) and [`InvoicePaymentStateMachine::refresh_payment_status`]
//! (pull). Both go through [`InvoicePaymentStateMachine::mark_paid`].

use super::notifier::{Notifier, OperatorAlert};
use super::provider::{CheckoutRequest, CheckoutSession, PaymentProvider};
use super::store::BillingStore;
use super::webhook::{EventHandler, HandlerOutcome, SettlementEventKind, WebhookEvent};
use crate::error::{BillingError, ValidationFailure};
use crate::models::{
    Invoice, InvoicePaymentMethod, InvoiceStatus, PaymentLink, Transaction, TransactionKind,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Lifetime of a generated payment link.
pub const PAYMENT_LINK_TTL_HOURS: i64 = 24;

/// Label recorded in `paid_via` for a set of payment method types.
pub fn payment_method_label(types: &[String]) -> String {
    match types {
        [single] => match single.as_str() {
            "card" => "Card".to_string(),
            "us_bank_account" => "Bank transfer (ACH)".to_string(),
            "sepa_debit" => "SEPA Direct Debit".to_string(),
            "link" => "Link".to_string(),
            "paypal" => "PayPal".to_string(),
            other => other.replace('_', " "),
        },
        _ => "Online payment".to_string(),
    }
}

fn minor_units(total: Decimal) -> Option<i64> {
    (total * Decimal::ONE_HUNDRED).round().to_i64()
}

pub struct InvoicePaymentStateMachine<S, P> {
    store: S,
    provider: Arc<P>,
    notifier: Arc<dyn Notifier>,
}

impl<S: Clone, P> Clone for InvoicePaymentStateMachine<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            provider: self.provider.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<S: BillingStore, P: PaymentProvider> InvoicePaymentStateMachine<S, P> {
    pub fn new(store: S, provider: Arc<P>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            provider,
            notifier,
        }
    }

    async fn load_invoice(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("invoice".to_string()))
    }

    /// Hosted payment link for an invoice.
    ///
    /// An unexpired link already stored on the invoice is returned as is, so
    /// repeated calls do not open a second checkout session.
    #[instrument(skip(self))]
    pub async fn create_payment_link(&self, invoice_id: Uuid) -> Result<PaymentLink, BillingError> {
        let mut invoice = self.load_invoice(invoice_id).await?;

        if invoice.payment_method != InvoicePaymentMethod::Stripe {
            return Err(ValidationFailure::WrongPaymentMethod.into());
        }
        if !invoice.status.accepts_payment() {
            return Err(ValidationFailure::InvalidStatus(invoice.status.as_str()).into());
        }
        if invoice.total <= Decimal::ZERO {
            return Err(ValidationFailure::NonPositiveTotal.into());
        }

        let now = Utc::now();
        if let Some(link) = invoice.live_payment_link(now) {
            info!(session_id = %link.session_id, "Reusing live payment link");
            return Ok(link);
        }

        let amount_minor = minor_units(invoice.total)
            .filter(|amount| *amount > 0)
            .ok_or(ValidationFailure::NonPositiveTotal)?;
        let session = self
            .provider
            .create_checkout_session(&CheckoutRequest {
                invoice_id: invoice.invoice_id,
                organization_id: invoice.organization_id,
                description: format!("Invoice {}", invoice.invoice_number),
                amount_minor,
                currency: invoice.currency.clone(),
            })
            .await?;
        let url = session
            .url
            .clone()
            .ok_or_else(|| BillingError::Provider("checkout session has no url".to_string()))?;

        let expires_at = now + Duration::hours(PAYMENT_LINK_TTL_HOURS);
        invoice.payment_session_id = Some(session.id.clone());
        invoice.payment_link_url = Some(url.clone());
        invoice.payment_link_expires_at = Some(expires_at);
        self.store.save_invoice(&invoice).await?;

        info!(session_id = %session.id, expires_at = %expires_at, "Payment link created");
        Ok(PaymentLink {
            invoice_id,
            url,
            session_id: session.id,
            expires_at,
        })
    }

    /// Settle an invoice for a paid session. No-op if already paid.
    ///
    /// Payments for draft or cancelled invoices are not applied; operators
    /// get an alert instead. Returns whether this call performed the
    /// transition.
    #[instrument(skip(self, invoice, session), fields(invoice_id = %invoice.invoice_id))]
    pub async fn mark_paid(
        &self,
        invoice: &Invoice,
        session: &CheckoutSession,
    ) -> Result<bool, BillingError> {
        if invoice.status == InvoiceStatus::Paid {
            info!("Invoice already paid");
            return Ok(false);
        }
        if !invoice.status.accepts_payment() {
            warn!(
                status = invoice.status.as_str(),
                session_id = %session.id,
                "Payment received for invoice that does not accept payment"
            );
            self.notifier
                .notify(
                    OperatorAlert::new(
                        "Payment for closed invoice",
                        format!(
                            "invoice {} is {} but checkout session {} was paid",
                            invoice.invoice_number,
                            invoice.status.as_str(),
                            session.id
                        ),
                    )
                    .for_organization(invoice.organization_id),
                )
                .await;
            return Ok(false);
        }

        let now = Utc::now();
        let mut paid = invoice.clone();
        paid.status = InvoiceStatus::Paid;
        paid.paid_at = Some(now);
        paid.paid_date = Some(now.date_naive());
        paid.paid_via = Some(payment_method_label(&session.payment_method_types));
        paid.payment_link_url = None;
        paid.payment_link_expires_at = None;

        let org = self.store.get_organization(invoice.organization_id).await?;
        let transaction = match org.and_then(|o| o.default_settlement_account_id) {
            Some(settlement_account_id) => Some(Transaction {
                transaction_id: Uuid::new_v4(),
                organization_id: invoice.organization_id,
                settlement_account_id,
                invoice_id: Some(invoice.invoice_id),
                kind: TransactionKind::InvoicePayment,
                amount: invoice.total,
                currency: invoice.currency.clone(),
                description: format!("Payment for invoice {}", invoice.invoice_number),
                occurred_on: now.date_naive(),
                created_utc: now,
            }),
            None => {
                warn!(
                    organization_id = %invoice.organization_id,
                    "No default settlement account, skipping transaction"
                );
                None
            }
        };

        let applied = self
            .store
            .mark_invoice_paid(&paid, transaction.as_ref())
            .await?;
        if applied {
            info!(
                paid_via = ?paid.paid_via,
                transaction = transaction.is_some(),
                "Invoice marked paid"
            );
        } else {
            info!("Invoice was settled concurrently");
        }
        Ok(applied)
    }

    /// Poll the provider and settle if it reports the session paid.
    #[instrument(skip(self))]
    pub async fn refresh_payment_status(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        let invoice = self.load_invoice(invoice_id).await?;
        if !invoice.status.accepts_payment() {
            return Ok(invoice);
        }

        let session_id = invoice
            .payment_session_id
            .as_deref()
            .ok_or(ValidationFailure::NoPaymentSession)?;
        let session = self.provider.retrieve_checkout_session(session_id).await?;

        if !session.is_paid() {
            info!(payment_status = %session.payment_status, "Session not paid yet");
            return Ok(invoice);
        }

        self.mark_paid(&invoice, &session).await?;
        self.load_invoice(invoice_id).await
    }

    async fn invoice_for_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<Option<Invoice>, BillingError> {
        if let Some(id) = session
            .metadata
            .get("invoice_id")
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            if let Some(invoice) = self.store.get_invoice(id).await? {
                return Ok(Some(invoice));
            }
        }
        self.store.find_invoice_by_session(&session.id).await
    }

    async fn settle_from_event(
        &self,
        session: &CheckoutSession,
    ) -> Result<HandlerOutcome, BillingError> {
        let Some(invoice) = self.invoice_for_session(session).await? else {
            warn!(session_id = %session.id, "No invoice for checkout session");
            return Ok(HandlerOutcome::Skipped);
        };

        if self.mark_paid(&invoice, session).await? {
            Ok(HandlerOutcome::Applied)
        } else {
            Ok(HandlerOutcome::Skipped)
        }
    }
}

#[async_trait]
impl<S: BillingStore, P: PaymentProvider> EventHandler for InvoicePaymentStateMachine<S, P> {
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    async fn handle(&self, event: &WebhookEvent) -> Result<HandlerOutcome, BillingError> {
        let kind = SettlementEventKind::from_type(&event.event_type);
        if let SettlementEventKind::Unknown(_) = kind {
            return Ok(HandlerOutcome::NoHandler);
        }

        let session: CheckoutSession = serde_json::from_value(event.data.object.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        match kind {
            SettlementEventKind::CheckoutCompleted => {
                if !session.is_paid() {
                    info!(
                        session_id = %session.id,
                        payment_status = %session.payment_status,
                        "Checkout completed without payment, awaiting async result"
                    );
                    return Ok(HandlerOutcome::Skipped);
                }
                self.settle_from_event(&session).await
            }
            SettlementEventKind::AsyncPaymentSucceeded => self.settle_from_event(&session).await,
            SettlementEventKind::AsyncPaymentFailed => {
                warn!(session_id = %session.id, "Async invoice payment failed");
                let mut alert = OperatorAlert::new(
                    "Invoice payment failed",
                    format!("checkout session {} reported a failed payment", session.id),
                );
                if let Some(invoice) = self.invoice_for_session(&session).await? {
                    alert = alert.for_organization(invoice.organization_id);
                }
                self.notifier.notify(alert).await;
                Ok(HandlerOutcome::Skipped)
            }
            SettlementEventKind::Unknown(_) => Ok(HandlerOutcome::NoHandler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_method_gets_specific_label() {
        assert_eq!(payment_method_label(&["card".to_string()]), "Card");
        assert_eq!(
            payment_method_label(&["us_bank_account".to_string()]),
            "Bank transfer (ACH)"
        );
        assert_eq!(payment_method_label(&["klarna".to_string()]), "klarna");
    }

    #[test]
    fn multiple_or_no_methods_get_generic_label() {
        let types = vec!["card".to_string(), "link".to_string()];
        assert_eq!(payment_method_label(&types), "Online payment");
        assert_eq!(payment_method_label(&[]), "Online payment");
    }

    #[test]
    fn totals_convert_to_minor_units() {
        assert_eq!(minor_units(Decimal::new(12_550, 2)), Some(12_550));
        assert_eq!(minor_units(Decimal::new(1, 3)), Some(0));
        assert_eq!(minor_units(Decimal::new(6, 3)), Some(1));
    }
}
