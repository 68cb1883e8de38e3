//! Domain models for tenant-billing.

mod event;
mod invoice;
mod organization;
mod plan;
mod usage;

pub use event::{BillingEvent, EventStatus, ListEventsFilter};
pub use invoice::{
    Invoice, InvoicePaymentMethod, InvoiceStatus, PaymentLink, Transaction, TransactionKind,
};
pub use organization::{resolve_status, BillingStatus, LegacyStatus, Organization, StatusAccess};
pub use plan::{CountSource, Entitlement, Plan, PlanWithEntitlement, ResourceKind};
pub use usage::{OrganizationUsage, ResourceUsage, UsageReport};
