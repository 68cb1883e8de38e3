//! Services for tenant-billing.

pub mod access;
pub mod billing_state;
pub mod invoice_payment;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod postgres;
pub mod provider;
pub mod quota;
pub mod store;
pub mod webhook;

pub use access::{AccessGuard, AccessMode, Operation, Role};
pub use billing_state::BillingStateMachine;
pub use invoice_payment::InvoicePaymentStateMachine;
pub use ledger::IdempotencyLedger;
pub use memory::{InMemoryStore, InMemoryTx};
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{Notifier, OperatorAlert, TracingNotifier};
pub use postgres::{PgStore, PgUsageTx};
pub use provider::{CheckoutRequest, CheckoutSession, PaymentProvider, StripeClient};
pub use quota::QuotaEngine;
pub use store::{
    BillingStore, EventLedgerStore, InvoiceStore, OrganizationStore, PlanStore, UsageStore,
    UsageTx,
};
pub use webhook::{
    BillingEventKind, EventHandler, HandlerOutcome, ProcessOutcome, SettlementEventKind,
    WebhookEvent, WebhookProcessor,
};
