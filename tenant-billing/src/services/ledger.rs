//! Idempotency ledger for inbound provider events.

use super::store::EventLedgerStore;
use crate::error::BillingError;
use crate::models::{BillingEvent, EventStatus, ListEventsFilter};
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct IdempotencyLedger<S> {
    store: S,
}

impl<S: EventLedgerStore> IdempotencyLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Create a `received` row. Fails with `AlreadyRecorded` if the external
    /// id exists, including when a concurrent delivery won the insert.
    #[instrument(skip(self))]
    pub async fn record_event(
        &self,
        external_id: &str,
        event_type: &str,
    ) -> Result<BillingEvent, BillingError> {
        match self
            .store
            .insert_event_if_absent(external_id, event_type)
            .await?
        {
            Some(event) => {
                debug!(event_id = %external_id, "Billing event recorded");
                Ok(event)
            }
            None => Err(BillingError::AlreadyRecorded(external_id.to_string())),
        }
    }

    /// Any existing row counts, failed ones included. Failed events are not
    /// retried automatically.
    pub async fn is_processed(&self, external_id: &str) -> Result<bool, BillingError> {
        Ok(self.store.find_event(external_id).await?.is_some())
    }

    pub async fn mark_processed(&self, external_id: &str) -> Result<(), BillingError> {
        self.store
            .set_event_status(external_id, EventStatus::Processed, None)
            .await
    }

    pub async fn mark_failed(&self, external_id: &str, error: &str) -> Result<(), BillingError> {
        self.store
            .set_event_status(external_id, EventStatus::Failed, Some(error))
            .await
    }

    pub async fn find(&self, external_id: &str) -> Result<Option<BillingEvent>, BillingError> {
        self.store.find_event(external_id).await
    }

    pub async fn list_events(
        &self,
        filter: &ListEventsFilter,
    ) -> Result<Vec<BillingEvent>, BillingError> {
        self.store.list_events(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::InMemoryStore;

    #[tokio::test]
    async fn duplicate_record_is_already_recorded() {
        let ledger = IdempotencyLedger::new(InMemoryStore::new());
        ledger.record_event("evt_1", "invoice.paid").await.unwrap();

        let err = ledger.record_event("evt_1", "invoice.paid").await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyRecorded(id) if id == "evt_1"));
    }

    #[tokio::test]
    async fn failed_rows_count_as_processed() {
        let ledger = IdempotencyLedger::new(InMemoryStore::new());
        assert!(!ledger.is_processed("evt_2").await.unwrap());

        ledger.record_event("evt_2", "invoice.paid").await.unwrap();
        ledger.mark_failed("evt_2", "boom").await.unwrap();

        assert!(ledger.is_processed("evt_2").await.unwrap());
        let row = ledger.find("evt_2").await.unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("boom"));
        assert!(row.processed_utc.is_some());
    }
}
