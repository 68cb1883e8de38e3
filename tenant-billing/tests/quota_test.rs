//! Quota reservation tests against the in-memory store.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use tenant_billing::error::BillingError;
use tenant_billing::models::{BillingStatus, ResourceKind};
use tenant_billing::services::{
    EventHandler, InMemoryStore, QuotaEngine, UsageStore, UsageTx, WebhookEvent,
};
use uuid::Uuid;

/// Create one project the way a CRUD service would: reserve and insert in
/// the same unit of work.
async fn create_project(
    quota: &QuotaEngine<InMemoryStore>,
    organization_id: Uuid,
) -> Result<(), BillingError> {
    let mut tx = quota.store().begin_usage().await?;
    quota
        .ensure_and_reserve_in(&mut tx, organization_id, ResourceKind::Projects, 1)
        .await?;
    tx.insert_live_record(organization_id, ResourceKind::Projects);
    tx.commit().await
}

#[tokio::test]
async fn trial_cap_then_upgrade_lifts_project_bound() {
    let app = TestApp::spawn();
    let quota = app.state.quota.clone();
    let org = app.onboard("Acme").await;

    for _ in 0..TRIAL_MAX_PROJECTS {
        create_project(&quota, org.organization_id).await.unwrap();
    }
    let err = create_project(&quota, org.organization_id).await.unwrap_err();
    assert!(matches!(
        err,
        BillingError::QuotaExceeded {
            resource: ResourceKind::Projects
        }
    ));
    assert_eq!(
        app.store
            .live_record_count(org.organization_id, ResourceKind::Projects),
        TRIAL_MAX_PROJECTS
    );

    let upgrade: WebhookEvent = serde_json::from_value(json!({
        "id": "evt_upgrade",
        "type": "customer.subscription.created",
        "data": { "object": subscription_object(org.organization_id, "active", PRO_PRICE) }
    }))
    .unwrap();
    app.billing().handle(&upgrade).await.unwrap();
    assert_eq!(
        app.organization(org.organization_id).await.status(),
        BillingStatus::Active
    );

    for _ in 0..20 {
        create_project(&quota, org.organization_id).await.unwrap();
    }
    assert_eq!(
        app.store
            .live_record_count(org.organization_id, ResourceKind::Projects),
        TRIAL_MAX_PROJECTS + 20
    );
}

#[tokio::test]
async fn exactly_one_of_two_racing_reservations_wins_the_last_slot() {
    for _ in 0..20 {
        let app = TestApp::spawn();
        let quota = Arc::new(app.state.quota.clone());
        let org = app.onboard("Acme").await;
        app.store.seed_live_records(
            org.organization_id,
            ResourceKind::Projects,
            TRIAL_MAX_PROJECTS - 1,
        );

        let a = {
            let quota = quota.clone();
            tokio::spawn(async move { create_project(&quota, org.organization_id).await })
        };
        let b = {
            let quota = quota.clone();
            tokio::spawn(async move { create_project(&quota, org.organization_id).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(BillingError::QuotaExceeded { .. }))));
        assert_eq!(
            app.store
                .live_record_count(org.organization_id, ResourceKind::Projects),
            TRIAL_MAX_PROJECTS
        );
    }
}

#[tokio::test]
async fn standalone_project_reservations_hold_their_slots() {
    for _ in 0..20 {
        let app = TestApp::spawn();
        let quota = Arc::new(app.state.quota.clone());
        let org = app.onboard("Acme").await;
        app.store.seed_live_records(
            org.organization_id,
            ResourceKind::Projects,
            TRIAL_MAX_PROJECTS - 1,
        );

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let quota = quota.clone();
                tokio::spawn(async move {
                    quota
                        .ensure_and_reserve(org.organization_id, ResourceKind::Projects, 1)
                        .await
                })
            })
            .collect();
        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);

        // No record was inserted for the winner, its slot still counts.
        for _ in 0..10 {
            let err = quota
                .ensure_and_reserve(org.organization_id, ResourceKind::Projects, 1)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                BillingError::QuotaExceeded {
                    resource: ResourceKind::Projects
                }
            ));
        }
    }
}

#[tokio::test]
async fn released_project_reservation_frees_the_slot() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    let quota = &app.state.quota;

    for _ in 0..TRIAL_MAX_PROJECTS {
        quota
            .ensure_and_reserve(org.organization_id, ResourceKind::Projects, 1)
            .await
            .unwrap();
    }
    assert!(quota
        .ensure_and_reserve(org.organization_id, ResourceKind::Projects, 1)
        .await
        .is_err());

    quota
        .decrement_usage(org.organization_id, ResourceKind::Projects, 1)
        .await
        .unwrap();
    quota
        .ensure_and_reserve(org.organization_id, ResourceKind::Projects, 1)
        .await
        .unwrap();
}

#[tokio::test]
async fn oversized_delta_is_rejected_without_touching_the_counter() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    let quota = &app.state.quota;

    quota
        .ensure_and_reserve_ai_credits(org.organization_id, 1)
        .await
        .unwrap();
    let err = quota
        .ensure_and_reserve_ai_credits(org.organization_id, i64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::QuotaExceeded {
            resource: ResourceKind::AiCredits
        }
    ));

    let usage = app
        .store
        .get_usage(org.organization_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.ai_credits, 1);
}

#[tokio::test]
async fn concurrent_counter_reservations_never_overshoot() {
    let app = TestApp::spawn();
    let quota = Arc::new(app.state.quota.clone());
    let org = app.onboard("Acme").await;

    // Trial plan allows 50 credits; 80 callers ask for one each.
    let mut tasks = Vec::new();
    for _ in 0..80 {
        let quota = quota.clone();
        tasks.push(tokio::spawn(async move {
            quota
                .ensure_and_reserve_ai_credits(org.organization_id, 1)
                .await
        }));
    }

    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            granted += 1;
        }
    }

    assert_eq!(granted, 50);
    let usage = app
        .store
        .get_usage(org.organization_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.ai_credits, 50);
}

#[tokio::test]
async fn reservation_at_bound_is_rejected() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    app.store.seed_live_records(
        org.organization_id,
        ResourceKind::Projects,
        TRIAL_MAX_PROJECTS,
    );

    let err = app
        .state
        .quota
        .ensure_and_reserve(org.organization_id, ResourceKind::Projects, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::QuotaExceeded { .. }));
}

#[tokio::test]
async fn reservation_reaching_bound_exactly_is_allowed() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;

    app.state
        .quota
        .ensure_and_reserve_storage(org.organization_id, 1_000)
        .await
        .unwrap();
    let err = app
        .state
        .quota
        .ensure_and_reserve_storage(org.organization_id, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::QuotaExceeded {
            resource: ResourceKind::StorageBytes
        }
    ));
}

#[tokio::test]
async fn rejected_reservation_leaves_counter_untouched() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    let quota = &app.state.quota;

    quota
        .ensure_and_reserve_ai_credits(org.organization_id, 40)
        .await
        .unwrap();
    assert!(quota
        .ensure_and_reserve_ai_credits(org.organization_id, 11)
        .await
        .is_err());

    let usage = app
        .store
        .get_usage(org.organization_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.ai_credits, 40);
}

#[tokio::test]
async fn decrement_clamps_at_zero() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    let quota = &app.state.quota;

    quota
        .increment_usage(org.organization_id, ResourceKind::StorageBytes, 300)
        .await
        .unwrap();
    let after = quota
        .decrement_usage(org.organization_id, ResourceKind::StorageBytes, 1_000)
        .await
        .unwrap();

    assert_eq!(after, 0);
}

#[tokio::test]
async fn negative_deltas_are_refused() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    let quota = &app.state.quota;

    assert!(quota
        .ensure_and_reserve(org.organization_id, ResourceKind::AiCredits, -1)
        .await
        .is_err());
    assert!(quota
        .increment_usage(org.organization_id, ResourceKind::AiCredits, -1)
        .await
        .is_err());
    assert!(quota
        .decrement_usage(org.organization_id, ResourceKind::AiCredits, -1)
        .await
        .is_err());
}

#[tokio::test]
async fn organization_without_plan_is_unlimited() {
    let app = TestApp::spawn();
    let mut org = app.onboard("Acme").await;
    org.plan_id = None;
    app.save(&org).await;

    assert!(app
        .state
        .quota
        .get_entitlement(org.organization_id)
        .await
        .unwrap()
        .is_none());
    app.state
        .quota
        .ensure_and_reserve_ai_credits(org.organization_id, 1_000_000)
        .await
        .unwrap();

    // Unknown organizations have no bound either.
    app.state
        .quota
        .ensure_and_reserve(Uuid::new_v4(), ResourceKind::Seats, 3)
        .await
        .unwrap();
}

#[tokio::test]
async fn usage_report_lists_every_resource_with_bounds() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    app.state
        .quota
        .ensure_and_reserve_storage(org.organization_id, 250)
        .await
        .unwrap();

    let report = app
        .state
        .quota
        .usage_report(org.organization_id)
        .await
        .unwrap();

    assert_eq!(report.plan_id.as_deref(), Some(TRIAL_PLAN));
    assert_eq!(report.billing_status, BillingStatus::TrialActive);
    assert!(report.trial_expires_at.is_some());
    assert_eq!(report.resources.len(), ResourceKind::ALL.len());

    let storage = report
        .resources
        .iter()
        .find(|r| r.resource == ResourceKind::StorageBytes)
        .unwrap();
    assert_eq!(storage.used, 250);
    assert_eq!(storage.limit, Some(1_000));

    let projects = report
        .resources
        .iter()
        .find(|r| r.resource == ResourceKind::Projects)
        .unwrap();
    assert_eq!(projects.limit, Some(TRIAL_MAX_PROJECTS));
}

#[tokio::test]
async fn different_organizations_do_not_share_counters() {
    let app = TestApp::spawn();
    let a = app.onboard("A").await;
    let b = app.onboard("B").await;

    app.state
        .quota
        .ensure_and_reserve_ai_credits(a.organization_id, 50)
        .await
        .unwrap();
    app.state
        .quota
        .ensure_and_reserve_ai_credits(b.organization_id, 50)
        .await
        .unwrap();

    assert!(app
        .state
        .quota
        .ensure_and_reserve_ai_credits(a.organization_id, 1)
        .await
        .is_err());
}
