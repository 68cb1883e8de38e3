//! Invoice payment state and ledger transactions.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Overdue,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn accepts_payment(&self) -> bool {
        matches!(self, InvoiceStatus::Sent | InvoiceStatus::Overdue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoicePaymentMethod {
    BankTransfer,
    Manual,
    /// Online checkout through the settlement provider.
    Stripe,
}

/// Invoice as seen by the payment state machine.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub organization_id: Uuid,
    pub invoice_number: String,
    pub payment_method: InvoicePaymentMethod,
    pub status: InvoiceStatus,
    pub total: Decimal,
    pub currency: String,
    pub payment_session_id: Option<String>,
    pub payment_link_url: Option<String>,
    pub payment_link_expires_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_date: Option<NaiveDate>,
    pub paid_via: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    /// A stored link that can still be handed out at `now`.
    pub fn live_payment_link(&self, now: DateTime<Utc>) -> Option<PaymentLink> {
        match (
            &self.payment_session_id,
            &self.payment_link_url,
            self.payment_link_expires_at,
        ) {
            (Some(session_id), Some(url), Some(expires_at)) if expires_at > now => {
                Some(PaymentLink {
                    invoice_id: self.invoice_id,
                    url: url.clone(),
                    session_id: session_id.clone(),
                    expires_at,
                })
            }
            _ => None,
        }
    }
}

/// Result of payment-link generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentLink {
    pub invoice_id: Uuid,
    pub url: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    InvoicePayment,
}

/// Immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub organization_id: Uuid,
    pub settlement_account_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub occurred_on: NaiveDate,
    pub created_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn invoice() -> Invoice {
        let now = Utc::now();
        Invoice {
            invoice_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            invoice_number: "INV-0001".into(),
            payment_method: InvoicePaymentMethod::Stripe,
            status: InvoiceStatus::Sent,
            total: Decimal::new(12_500, 2),
            currency: "usd".into(),
            payment_session_id: None,
            payment_link_url: None,
            payment_link_expires_at: None,
            paid_at: None,
            paid_date: None,
            paid_via: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    #[test]
    fn expired_link_is_not_live() {
        let now = Utc::now();
        let mut inv = invoice();
        inv.payment_session_id = Some("cs_1".into());
        inv.payment_link_url = Some("https://pay.example/cs_1".into());
        inv.payment_link_expires_at = Some(now - Duration::seconds(1));
        assert!(inv.live_payment_link(now).is_none());

        inv.payment_link_expires_at = Some(now + Duration::hours(1));
        let link = inv.live_payment_link(now).unwrap();
        assert_eq!(link.session_id, "cs_1");
    }

    #[test]
    fn only_sent_and_overdue_accept_payment() {
        assert!(InvoiceStatus::Sent.accepts_payment());
        assert!(InvoiceStatus::Overdue.accepts_payment());
        assert!(!InvoiceStatus::Draft.accepts_payment());
        assert!(!InvoiceStatus::Paid.accepts_payment());
        assert!(!InvoiceStatus::Cancelled.accepts_payment());
    }
}
