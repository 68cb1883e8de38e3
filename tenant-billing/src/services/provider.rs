//! Payment provider client.
//!
//! Implements the Checkout Sessions API used to collect invoice payments
//! and to poll a session when a webhook may have been missed.

use crate::config::ProviderConfig;
use crate::error::BillingError;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Request to open a hosted checkout for one invoice.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub invoice_id: Uuid,
    pub organization_id: Uuid,
    pub description: String,
    /// Amount in the smallest currency unit.
    pub amount_minor: i64,
    pub currency: String,
}

/// Checkout session as returned by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`.
    pub payment_status: String,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }
}

/// Provider API error response.
#[derive(Debug, Deserialize)]
pub struct ProviderErrorBody {
    pub error: ProviderErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ProviderErrorDetail {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync + 'static {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, BillingError>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, BillingError>;
}

/// Stripe client for hosted checkout sessions.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: ProviderConfig,
}

impl StripeClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check if the API key is set.
    pub fn is_configured(&self) -> bool {
        !self.config.api_key.expose_secret().is_empty()
    }

    fn checkout_form(&self, request: &CheckoutRequest) -> Vec<(String, String)> {
        let invoice_id = request.invoice_id.to_string();
        vec![
            ("mode".into(), "payment".into()),
            ("success_url".into(), self.config.success_url.clone()),
            ("cancel_url".into(), self.config.cancel_url.clone()),
            ("client_reference_id".into(), invoice_id.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "line_items[0][price_data][currency]".into(),
                request.currency.to_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]".into(),
                request.amount_minor.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".into(),
                request.description.clone(),
            ),
            ("metadata[invoice_id]".into(), invoice_id),
            (
                "metadata[organization_id]".into(),
                request.organization_id.to_string(),
            ),
        ]
    }

    async fn parse_response(
        &self,
        response: reqwest::Response,
        operation: &str,
    ) -> Result<CheckoutSession, BillingError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BillingError::Provider(format!("{}: {}", operation, e)))?;

        tracing::debug!(status = %status, operation = operation, "Provider response");

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| {
                BillingError::Provider(format!("{}: invalid response: {}", operation, e))
            })
        } else {
            let message = serde_json::from_str::<ProviderErrorBody>(&body)
                .ok()
                .and_then(|b| b.error.message.or(b.error.code).or(b.error.error_type))
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            tracing::error!(
                status = %status,
                operation = operation,
                message = %message,
                "Provider request failed"
            );
            Err(BillingError::Provider(format!("{} failed: {}", operation, message)))
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, BillingError> {
        if !self.is_configured() {
            return Err(BillingError::Provider(
                "payment provider credentials not configured".to_string(),
            ));
        }

        let url = format!("{}/checkout/sessions", self.config.api_base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .form(&self.checkout_form(request))
            .send()
            .await
            .map_err(|e| BillingError::Provider(format!("create checkout session: {}", e)))?;

        let session = self
            .parse_response(response, "create checkout session")
            .await?;
        tracing::info!(
            session_id = %session.id,
            invoice_id = %request.invoice_id,
            amount_minor = request.amount_minor,
            "Checkout session created"
        );
        Ok(session)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, BillingError> {
        if !self.is_configured() {
            return Err(BillingError::Provider(
                "payment provider credentials not configured".to_string(),
            ));
        }

        let url = format!("{}/checkout/sessions/{}", self.config.api_base_url, session_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| BillingError::Provider(format!("retrieve checkout session: {}", e)))?;

        self.parse_response(response, "retrieve checkout session")
            .await
    }
}
