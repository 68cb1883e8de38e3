//! Application startup and lifecycle management.

use crate::config::TenantBillingConfig;
use crate::handlers;
use crate::services::{
    AccessGuard, BillingStateMachine, BillingStore, IdempotencyLedger,
    InvoicePaymentStateMachine, Notifier, PaymentProvider, PgStore, QuotaEngine, StripeClient,
    TracingNotifier, WebhookProcessor,
};
use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub const BILLING_ENDPOINT: &str = "billing";
pub const SETTLEMENT_ENDPOINT: &str = "settlement";

/// Shared application state.
pub struct AppState<S, P> {
    pub store: S,
    pub quota: QuotaEngine<S>,
    pub guard: AccessGuard<S>,
    pub ledger: IdempotencyLedger<S>,
    pub invoices: InvoicePaymentStateMachine<S, P>,
    pub billing_webhooks: Arc<WebhookProcessor<S>>,
    pub settlement_webhooks: Arc<WebhookProcessor<S>>,
}

impl<S: Clone, P> Clone for AppState<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            quota: self.quota.clone(),
            guard: self.guard.clone(),
            ledger: self.ledger.clone(),
            invoices: self.invoices.clone(),
            billing_webhooks: self.billing_webhooks.clone(),
            settlement_webhooks: self.settlement_webhooks.clone(),
        }
    }
}

impl<S: BillingStore, P: PaymentProvider> AppState<S, P> {
    /// Wire every component to one store handle.
    pub fn new(
        config: TenantBillingConfig,
        store: S,
        provider: Arc<P>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let billing = BillingStateMachine::new(store.clone())
            .with_trial(config.trial.days, config.trial.default_plan_id.clone());
        let invoices =
            InvoicePaymentStateMachine::new(store.clone(), provider, notifier.clone());

        let billing_webhooks = WebhookProcessor::new(
            BILLING_ENDPOINT,
            config.webhooks.billing_secret.clone(),
            IdempotencyLedger::new(store.clone()),
            Arc::new(billing),
            notifier.clone(),
        )
        .with_tolerance(config.webhooks.tolerance_seconds);

        let settlement_webhooks = WebhookProcessor::new(
            SETTLEMENT_ENDPOINT,
            config.webhooks.settlement_secret.clone(),
            IdempotencyLedger::new(store.clone()),
            Arc::new(invoices.clone()),
            notifier,
        )
        .with_tolerance(config.webhooks.tolerance_seconds);

        Self {
            quota: QuotaEngine::new(store.clone()),
            guard: AccessGuard::new(store.clone()),
            ledger: IdempotencyLedger::new(store.clone()),
            invoices,
            billing_webhooks: Arc::new(billing_webhooks),
            settlement_webhooks: Arc::new(settlement_webhooks),
            store,
        }
    }
}

/// HTTP routes with the service-core middleware stack.
pub fn build_router<S: BillingStore, P: PaymentProvider>(state: AppState<S, P>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/webhooks/billing",
            post(handlers::webhooks::billing_webhook::<S, P>),
        )
        .route(
            "/webhooks/settlement",
            post(handlers::webhooks::settlement_webhook::<S, P>),
        )
        .route("/plans", get(handlers::plans::list_plans::<S, P>))
        .route("/usage", get(handlers::usage::get_usage::<S, P>))
        .route(
            "/usage/reservations",
            post(handlers::usage::reserve_usage::<S, P>),
        )
        .route("/usage/releases", post(handlers::usage::release_usage::<S, P>))
        .route(
            "/invoices/:id/payment-link",
            post(handlers::invoices::create_payment_link::<S, P>),
        )
        .route(
            "/invoices/:id/refresh-payment",
            post(handlers::invoices::refresh_payment::<S, P>),
        )
        .route(
            "/billing-events",
            get(handlers::events::list_billing_events::<S, P>),
        )
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Connect to Postgres, run migrations and bind the listener.
    ///
    /// Port 0 binds a random port.
    pub async fn build(config: TenantBillingConfig) -> Result<Self, AppError> {
        let store = PgStore::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;
        store.health_check().await?;
        store.run_migrations().await?;

        let provider = StripeClient::new(config.provider.clone());
        if provider.is_configured() {
            tracing::info!("Payment provider client initialized");
        } else {
            tracing::warn!("Payment provider credentials not configured - payment links will fail");
        }
        if config.webhooks.billing_secret.is_none() {
            tracing::warn!("Billing webhook secret not configured");
        }
        if config.webhooks.settlement_secret.is_none() {
            tracing::warn!("Settlement webhook secret not configured");
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        let state = AppState::new(
            config,
            store,
            Arc::new(provider),
            Arc::new(TracingNotifier),
        );
        let router = build_router(state);

        tracing::info!("tenant-billing: HTTP on port {}", port);
        Ok(Self {
            port,
            listener,
            router,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router).await.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
