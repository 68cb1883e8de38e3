//! Operator alert sink.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct OperatorAlert {
    pub subject: String,
    pub detail: String,
    pub organization_id: Option<Uuid>,
}

impl OperatorAlert {
    pub fn new(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            detail: detail.into(),
            organization_id: None,
        }
    }

    pub fn for_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }
}

/// Delivery must not fail the caller; implementations log their own errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: OperatorAlert);
}

/// Emits alerts as structured error logs for the log pipeline to route.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, alert: OperatorAlert) {
        tracing::error!(
            subject = %alert.subject,
            detail = %alert.detail,
            organization_id = ?alert.organization_id,
            "Operator alert"
        );
    }
}
