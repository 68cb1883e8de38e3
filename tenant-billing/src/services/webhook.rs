//! Webhook ingestion: signature check, de-duplication and dispatch.

use super::ledger::IdempotencyLedger;
use super::metrics::record_webhook_event;
use super::notifier::{Notifier, OperatorAlert};
use super::store::EventLedgerStore;
use crate::error::BillingError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::utils::signature::{hmac_sha256_hex, verify_hmac_sha256_hex};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Header carrying the provider signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Default allowed clock skew between the signature timestamp and now.
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// Event envelope as delivered by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider-side creation time, unix seconds.
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// String field on `data.object`.
    pub fn object_str(&self, key: &str) -> Option<&str> {
        self.data.object.get(key).and_then(|v| v.as_str())
    }
}

/// Subscription-billing event kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionTrialWillEnd,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    CheckoutCompleted,
    CustomerCreated,
    CustomerUpdated,
    CustomerDeleted,
    Unknown(String),
}

impl BillingEventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.trial_will_end" => Self::SubscriptionTrialWillEnd,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_succeeded" | "invoice.paid" => Self::InvoicePaymentSucceeded,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "checkout.session.completed" => Self::CheckoutCompleted,
            "customer.created" => Self::CustomerCreated,
            "customer.updated" => Self::CustomerUpdated,
            "customer.deleted" => Self::CustomerDeleted,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Settlement-account (invoice payment) event kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementEventKind {
    CheckoutCompleted,
    AsyncPaymentSucceeded,
    AsyncPaymentFailed,
    Unknown(String),
}

impl SettlementEventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "checkout.session.async_payment_succeeded" => Self::AsyncPaymentSucceeded,
            "checkout.session.async_payment_failed" => Self::AsyncPaymentFailed,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// State was changed.
    Applied,
    /// No handler for this event kind.
    NoHandler,
    /// Recognized but intentionally ignored, e.g. stale or unrelated.
    Skipped,
}

/// A state machine that consumes verified events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<HandlerOutcome, BillingError>;
}

/// What happened to a delivery that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    NoHandler,
    Skipped,
    /// Handler failed; the ledger row is marked failed.
    Failed,
    AlreadyProcessed,
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Processed => "processed",
            ProcessOutcome::NoHandler => "no_handler",
            ProcessOutcome::Skipped => "skipped",
            ProcessOutcome::Failed => "failed",
            ProcessOutcome::AlreadyProcessed => "already_processed",
        }
    }
}

struct SignatureParts<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_signature_header(header: &str) -> Result<SignatureParts<'_>, BillingError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(BillingError::InvalidSignature)?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(BillingError::InvalidSignature);
    }

    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

fn signed_payload(timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    signed
}

/// Verify a `t=<unix>,v1=<hex>` header over `"{t}.{payload}"`.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    header: &str,
    tolerance_seconds: i64,
    now: i64,
) -> Result<(), BillingError> {
    let parts = parse_signature_header(header)?;

    if (now - parts.timestamp).abs() > tolerance_seconds {
        warn!(timestamp = parts.timestamp, "Webhook timestamp outside tolerance");
        return Err(BillingError::InvalidSignature);
    }

    let signed = signed_payload(parts.timestamp, payload);
    for candidate in parts.signatures {
        let valid = verify_hmac_sha256_hex(secret, &signed, candidate)
            .map_err(|_| BillingError::InvalidSignature)?;
        if valid {
            return Ok(());
        }
    }

    Err(BillingError::InvalidSignature)
}

/// Build a signature header the way the provider does.
pub fn signature_header(
    secret: &[u8],
    timestamp: i64,
    payload: &[u8],
) -> Result<String, anyhow::Error> {
    let signature = hmac_sha256_hex(secret, &signed_payload(timestamp, payload))?;
    Ok(format!("t={},v1={}", timestamp, signature))
}

/// Runs one webhook endpoint: verify, de-duplicate, dispatch, record.
pub struct WebhookProcessor<S> {
    endpoint: &'static str,
    secret: Option<Secret<String>>,
    tolerance_seconds: i64,
    ledger: IdempotencyLedger<S>,
    handler: Arc<dyn EventHandler>,
    notifier: Arc<dyn Notifier>,
}

impl<S: EventLedgerStore> WebhookProcessor<S> {
    pub fn new(
        endpoint: &'static str,
        secret: Option<Secret<String>>,
        ledger: IdempotencyLedger<S>,
        handler: Arc<dyn EventHandler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            endpoint,
            secret,
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
            ledger,
            handler,
            notifier,
        }
    }

    pub fn with_tolerance(mut self, tolerance_seconds: i64) -> Self {
        self.tolerance_seconds = tolerance_seconds;
        self
    }

    pub fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    /// Handle one delivery.
    ///
    /// Errors are returned only for problems the provider should see:
    /// a missing secret, a bad signature, an unparseable body, or a ledger
    /// insert that failed at the database. Handler failures are recorded on
    /// the ledger row and reported as [`ProcessOutcome::Failed`].
    #[instrument(skip(self, payload, signature), fields(endpoint = self.endpoint))]
    pub async fn process(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ProcessOutcome, BillingError> {
        let result = self.process_inner(payload, signature).await;
        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(BillingError::InvalidSignature) => "invalid_signature",
            Err(BillingError::MalformedPayload(_)) => "malformed_payload",
            Err(BillingError::UnconfiguredSecret(_)) => "unconfigured_secret",
            Err(_) => "error",
        };
        record_webhook_event(self.endpoint, outcome);
        result
    }

    async fn process_inner(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ProcessOutcome, BillingError> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            error!(endpoint = self.endpoint, "Webhook secret is not configured");
            BillingError::UnconfiguredSecret(self.endpoint)
        })?;
        let header = signature.ok_or(BillingError::InvalidSignature)?;

        verify_signature(
            secret.expose_secret().as_bytes(),
            payload,
            header,
            self.tolerance_seconds,
            Utc::now().timestamp(),
        )?;

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            warn!(error = %e, "Failed to parse webhook payload");
            BillingError::MalformedPayload(e.to_string())
        })?;

        if self.ledger.is_processed(&event.id).await? {
            info!(event_id = %event.id, "Event already processed");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        match self.ledger.record_event(&event.id, &event.event_type).await {
            Ok(_) => {}
            Err(BillingError::AlreadyRecorded(_)) => {
                info!(event_id = %event.id, "Concurrent delivery already claimed event");
                return Ok(ProcessOutcome::AlreadyProcessed);
            }
            Err(e) => return Err(e),
        }

        let outcome = match self.handler.handle(&event).await {
            Ok(HandlerOutcome::Applied) => ProcessOutcome::Processed,
            Ok(HandlerOutcome::NoHandler) => {
                info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "No handler for event type"
                );
                ProcessOutcome::NoHandler
            }
            Ok(HandlerOutcome::Skipped) => ProcessOutcome::Skipped,
            Err(e) => {
                let e = BillingError::HandlerFailure(e.to_string());
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed"
                );
                if let Err(mark_err) = self.ledger.mark_failed(&event.id, &e.to_string()).await {
                    error!(event_id = %event.id, error = %mark_err, "Failed to mark event failed");
                }
                self.notifier
                    .notify(OperatorAlert::new(
                        format!("Webhook handler failed for {}", event.event_type),
                        format!("event {} on {} endpoint: {}", event.id, self.endpoint, e),
                    ))
                    .await;
                return Ok(ProcessOutcome::Failed);
            }
        };

        if let Err(e) = self.ledger.mark_processed(&event.id).await {
            error!(event_id = %event.id, error = %e, "Failed to mark event processed");
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test";

    #[test]
    fn valid_header_verifies() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signature_header(SECRET, 1_700_000_000, payload).unwrap();
        assert!(verify_signature(SECRET, payload, &header, 300, 1_700_000_010).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signature_header(SECRET, 1_700_000_000, payload).unwrap();
        let err = verify_signature(SECRET, payload, &header, 300, 1_700_000_301).unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    #[test]
    fn any_matching_v1_is_accepted() {
        let payload = b"{}";
        let good = signature_header(SECRET, 10, payload).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t=10,v1=deadbeef,v1={}", good_sig);
        assert!(verify_signature(SECRET, payload, &header, 300, 10).is_ok());
    }

    #[test]
    fn malformed_headers_are_invalid() {
        for header in ["", "garbage", "t=abc,v1=00", "t=10", "v1=00"] {
            assert!(
                matches!(
                    verify_signature(SECRET, b"{}", header, 300, 10),
                    Err(BillingError::InvalidSignature)
                ),
                "{header}"
            );
        }
    }

    #[test]
    fn event_kinds_are_closed() {
        assert_eq!(
            BillingEventKind::from_type("invoice.paid"),
            BillingEventKind::InvoicePaymentSucceeded
        );
        assert_eq!(
            BillingEventKind::from_type("price.created"),
            BillingEventKind::Unknown("price.created".into())
        );
        assert_eq!(
            SettlementEventKind::from_type("checkout.session.async_payment_failed"),
            SettlementEventKind::AsyncPaymentFailed
        );
    }
}
