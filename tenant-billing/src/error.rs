//! Error taxonomy for the billing subsystem.

use crate::models::{BillingStatus, ResourceKind};
use service_core::error::AppError;
use thiserror::Error;

/// Payment-link precondition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("invoice payment method must be the online payment provider")]
    WrongPaymentMethod,

    #[error("invoice must be sent or overdue to accept payment, current status is {0}")]
    InvalidStatus(&'static str),

    #[error("invoice total must be greater than zero")]
    NonPositiveTotal,

    #[error("invoice has no payment session to reconcile")]
    NoPaymentSession,

    #[error("delta must not be negative")]
    NegativeDelta,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("webhook secret is not configured for {0}")]
    UnconfiguredSecret(&'static str),

    #[error("event handler failed: {0}")]
    HandlerFailure(String),

    #[error("quota exceeded for {resource}")]
    QuotaExceeded { resource: ResourceKind },

    #[error("billing status {status} does not allow this operation")]
    BillingInactive { status: BillingStatus },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("role is not permitted to {0}")]
    Forbidden(&'static str),

    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error("event {0} is already recorded")]
    AlreadyRecorded(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("payment provider error: {0}")]
    Provider(String),

    #[error("database error: {0}")]
    Database(anyhow::Error),
}

impl BillingError {
    pub fn database(context: &str, err: impl std::fmt::Display) -> Self {
        BillingError::Database(anyhow::anyhow!("{}: {}", context, err))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(anyhow::Error::new(err))
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidSignature => {
                AppError::BadRequest(anyhow::anyhow!("Invalid webhook signature"))
            }
            BillingError::MalformedPayload(_) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload"))
            }
            BillingError::UnconfiguredSecret(endpoint) => AppError::ConfigError(anyhow::anyhow!(
                "Webhook secret missing for {} endpoint",
                endpoint
            )),
            BillingError::HandlerFailure(msg) => AppError::InternalError(anyhow::anyhow!(msg)),
            BillingError::QuotaExceeded { resource } => AppError::PaymentRequired(anyhow::anyhow!(
                "Plan limit reached for {}. Upgrade your plan to add more.",
                resource
            )),
            BillingError::BillingInactive { status } => AppError::PaymentRequired(anyhow::anyhow!(
                "Billing status is {}. {}",
                status,
                status.required_action()
            )),
            BillingError::AccessDenied(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            BillingError::Forbidden(action) => {
                AppError::Forbidden(anyhow::anyhow!("Your role is not permitted to {}", action))
            }
            BillingError::Validation(failure) => AppError::Unprocessable(anyhow::anyhow!(failure)),
            BillingError::AlreadyRecorded(_) => {
                AppError::Conflict(anyhow::anyhow!("Event already recorded"))
            }
            BillingError::NotFound(what) => {
                AppError::NotFound(anyhow::anyhow!("{} not found", what))
            }
            BillingError::Provider(msg) => AppError::BadGateway(msg),
            BillingError::Database(err) => AppError::DatabaseError(err),
        }
    }
}
