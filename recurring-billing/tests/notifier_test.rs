//! Notification service client against a mock server.

use chrono::{TimeZone, Utc};
use recurring_billing::config::NotificationServiceConfig;
use recurring_billing::models::{NotificationEvent, NotificationType, PlanKind};
use recurring_billing::services::{
    HttpNotifier, InMemoryStore, LedgerNotifier, Notifier, NotifyError,
};
use secrecy::Secret;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn notifier(server: &MockServer) -> HttpNotifier {
    HttpNotifier::new(NotificationServiceConfig {
        url: server.uri(),
        internal_token: Some(Secret::new("internal-token".to_string())),
        timeout: Duration::from_secs(5),
        dedupe_locally: false,
    })
    .unwrap()
    .with_correlation_id("run-42")
}

fn upcoming_charge() -> NotificationEvent {
    NotificationEvent {
        notification_type: NotificationType::UpcomingCharge,
        family: PlanKind::Subscription,
        entity_id: Uuid::new_v4(),
        payer_id: Uuid::new_v4(),
        scheduled_for: Utc.with_ymd_and_hms(2025, 2, 13, 9, 0, 0).unwrap(),
        days_before: Some(3),
        amount_cents: Some(1_500),
        currency: "USD".to_string(),
        failure_message: None,
    }
}

#[tokio::test]
async fn test_posts_event_to_family_and_type_route() {
    let server = MockServer::start().await;
    let event = upcoming_charge();
    Mock::given(method("POST"))
        .and(path("/internal/notifications/subscription/upcoming-charge"))
        .and(header("Authorization", "Bearer internal-token"))
        .and(header("x-correlation-id", "run-42"))
        .and(header_exists("content-type"))
        .and(body_partial_json(json!({
            "notificationType": "upcoming-charge",
            "entityId": event.entity_id,
            "daysBefore": 3,
            "amountCents": 1500
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "sent": true})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = notifier(&server).notify(&event).await.unwrap();

    assert!(outcome.sent);
    assert!(!outcome.is_failure());
}

#[tokio::test]
async fn test_service_side_dedupe_reports_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "sent": false, "skipped": true})),
        )
        .mount(&server)
        .await;

    let outcome = notifier(&server).notify(&upcoming_charge()).await.unwrap();

    assert!(outcome.skipped);
    assert_eq!(outcome.label(), "skipped");
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = notifier(&server).notify(&upcoming_charge()).await.unwrap_err();

    assert!(matches!(err, NotifyError::Status { status: 503, .. }));
}

#[tokio::test]
async fn test_ledger_notifier_delivers_each_key_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "sent": true})),
        )
        .expect(1)
        .mount(&server)
        .await;
    let store = Arc::new(InMemoryStore::new());
    let ledger = LedgerNotifier::new(store, notifier(&server));
    let event = upcoming_charge();

    let first = ledger.notify(&event).await.unwrap();
    let second = ledger.notify(&event).await.unwrap();

    assert!(first.sent);
    assert!(second.skipped);
}

#[tokio::test]
async fn test_ledger_notifier_releases_claim_on_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "sent": true})),
        )
        .mount(&server)
        .await;
    let store = Arc::new(InMemoryStore::new());
    let ledger = LedgerNotifier::new(store, notifier(&server));
    let event = upcoming_charge();

    assert!(ledger.notify(&event).await.is_err());
    let retry = ledger.notify(&event).await.unwrap();

    assert!(retry.sent);
}
