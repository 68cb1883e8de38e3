//! Billing access guard tests over HTTP.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use common::*;
use serde_json::json;
use tenant_billing::models::BillingStatus;
use tenant_billing::services::access::{RESERVE_USAGE, VIEW_USAGE};
use tenant_billing::services::Role;
use tenant_billing::BillingError;

fn reserve(org: uuid::Uuid, role: &str) -> Request<Body> {
    caller_request(
        "POST",
        "/usage/reservations",
        org,
        role,
        Some(json!({ "resource": "projects", "delta": 1 })),
    )
}

#[tokio::test]
async fn past_due_reads_but_cannot_create_until_paid() {
    let app = TestApp::spawn();
    let mut org = app.onboard("Acme").await;
    org.billing_status = Some(BillingStatus::PastDue);
    app.save(&org).await;
    let id = org.organization_id;

    let (status, body) = app.send(caller_request("GET", "/usage", id, "member", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["billing_status"], "past_due");
    assert_eq!(body["legacy_status"], "active");

    let (status, body) = app.send(reserve(id, "member")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("past_due"));
    assert!(message.contains("Update your payment method"));

    let (status, _) = app
        .send(webhook_request(
            "/webhooks/billing",
            BILLING_SECRET,
            event_payload("evt_recovered", "invoice.payment_succeeded", invoice_object(id)),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.organization(id).await.status(), BillingStatus::Active);

    let (status, body) = app.send(reserve(id, "member")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["reserved"], 1);
}

#[tokio::test]
async fn canceled_organization_is_denied_even_for_owner() {
    let app = TestApp::spawn();
    let mut org = app.onboard("Acme").await;
    org.billing_status = Some(BillingStatus::Canceled);
    app.save(&org).await;

    let (status, body) = app
        .send(caller_request("GET", "/usage", org.organization_id, "owner", None))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!body["error"]
        .as_str()
        .unwrap()
        .contains(&org.organization_id.to_string()));
}

#[tokio::test]
async fn blocked_organization_is_denied() {
    let app = TestApp::spawn();
    let mut org = app.onboard("Acme").await;
    org.billing_status = Some(BillingStatus::Blocked);
    app.save(&org).await;

    let err = app
        .state
        .guard
        .authorize(org.organization_id, Role::Owner, &VIEW_USAGE)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AccessDenied(_)));
}

#[tokio::test]
async fn expired_trial_is_read_only() {
    let app = TestApp::spawn();
    let mut org = app.onboard("Acme").await;
    org.trial_expires_at = Some(Utc::now() - Duration::minutes(5));
    app.save(&org).await;

    let (status, body) = app
        .send(caller_request("GET", "/usage", org.organization_id, "viewer", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["billing_status"], "trial_ended");

    let err = app
        .state
        .guard
        .authorize(org.organization_id, Role::Admin, &RESERVE_USAGE)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::BillingInactive {
            status: BillingStatus::TrialEnded
        }
    ));

    // The projection is not written back.
    assert_eq!(
        app.organization(org.organization_id).await.billing_status,
        Some(BillingStatus::TrialActive)
    );
}

#[tokio::test]
async fn legacy_record_without_status_is_normalized() {
    let app = TestApp::spawn();
    let mut org = app.onboard("Legacy Co").await;
    org.billing_status = None;
    org.legacy_status = Some("active".to_string());
    app.save(&org).await;

    let status = app
        .state
        .guard
        .authorize(org.organization_id, Role::Member, &RESERVE_USAGE)
        .await
        .unwrap();
    assert_eq!(status, BillingStatus::Active);

    org.legacy_status = Some("inactive".to_string());
    app.save(&org).await;
    let (status, _) = app
        .send(caller_request("GET", "/usage", org.organization_id, "owner", None))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn viewer_cannot_reserve() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;

    let (status, _) = app.send(reserve(org.organization_id, "viewer")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn quota_rejection_is_payment_required_over_http() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    app.store.seed_live_records(
        org.organization_id,
        tenant_billing::models::ResourceKind::Projects,
        TRIAL_MAX_PROJECTS,
    );

    let (status, body) = app.send(reserve(org.organization_id, "member")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert!(body["error"].as_str().unwrap().contains("projects"));
}

#[tokio::test]
async fn project_reservations_over_http_stop_at_the_plan_bound() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;

    for _ in 0..TRIAL_MAX_PROJECTS {
        let (status, _) = app.send(reserve(org.organization_id, "member")).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, body) = app.send(reserve(org.organization_id, "member")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert!(body["error"].as_str().unwrap().contains("projects"));
}

#[tokio::test]
async fn release_returns_clamped_count() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;
    let id = org.organization_id;

    let (status, _) = app
        .send(caller_request(
            "POST",
            "/usage/reservations",
            id,
            "member",
            Some(json!({ "resource": "storage", "delta": 200 })),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app
        .send(caller_request(
            "POST",
            "/usage/releases",
            id,
            "member",
            Some(json!({ "resource": "storage", "delta": 500 })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["used"], 0);
    assert_eq!(body["limit"], 1_000);
}

#[tokio::test]
async fn negative_delta_is_a_validation_error() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;

    let (status, _) = app
        .send(caller_request(
            "POST",
            "/usage/reservations",
            org.organization_id,
            "member",
            Some(json!({ "resource": "ai_credits", "delta": -5 })),
        ))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn missing_caller_headers_are_unauthorized() {
    let app = TestApp::spawn();

    let request = Request::builder().uri("/usage").body(Body::empty()).unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/usage")
        .header("X-Org-ID", "not-a-uuid")
        .header("X-Role", "owner")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .uri("/usage")
        .header("X-Org-ID", uuid::Uuid::new_v4().to_string())
        .header("X-Role", "superuser")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_organization_is_not_found() {
    let app = TestApp::spawn();
    let (status, _) = app
        .send(caller_request("GET", "/usage", uuid::Uuid::new_v4(), "owner", None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn plans_are_listed_with_bounds() {
    let app = TestApp::spawn();
    let org = app.onboard("Acme").await;

    let (status, body) = app
        .send(caller_request("GET", "/plans", org.organization_id, "viewer", None))
        .await;
    assert_eq!(status, StatusCode::OK);

    let plans = body.as_array().unwrap();
    assert_eq!(plans.len(), 2);
    let trial = plans.iter().find(|p| p["plan_id"] == TRIAL_PLAN).unwrap();
    assert_eq!(trial["entitlement"]["max_projects"], TRIAL_MAX_PROJECTS);
    let pro = plans.iter().find(|p| p["plan_id"] == PRO_PLAN).unwrap();
    assert!(pro["entitlement"]["max_projects"].is_null());
}
