//! Stripe processor handler against a mock Stripe API.

use recurring_billing::config::StripeConfig;
use recurring_billing::services::{
    ChargeOutcome, ChargeRequest, ContextRequest, ProcessorError, ProcessorHandler,
    StripeProcessor,
};
use secrecy::Secret;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn processor(server: &MockServer, secret_key: &str) -> StripeProcessor {
    StripeProcessor::new(StripeConfig {
        secret_key: Secret::new(secret_key.to_string()),
        api_base_url: server.uri(),
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn charge_request() -> ChargeRequest {
    let mut metadata = HashMap::new();
    metadata.insert("plan_kind".to_string(), "subscription".to_string());
    ChargeRequest {
        customer_id: "cus_123".to_string(),
        payment_method_id: "pm_123".to_string(),
        amount_cents: 1_500,
        currency: "USD".to_string(),
        idempotency_key: "subscription:abc:1738281600".to_string(),
        metadata,
    }
}

#[tokio::test]
async fn test_charge_sends_idempotency_key_and_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .and(header("Idempotency-Key", "subscription:abc:1738281600"))
        .and(header("Authorization", "Bearer sk_test_123"))
        .and(body_string_contains("amount=1500"))
        .and(body_string_contains("currency=usd"))
        .and(body_string_contains("off_session=true"))
        .and(body_string_contains("confirm=true"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "pi_1", "status": "succeeded"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = processor(&server, "sk_test_123")
        .charge(&charge_request())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ChargeOutcome::Succeeded {
            processor_payment_id: "pi_1".to_string()
        }
    );
}

#[tokio::test]
async fn test_card_decline_is_a_failed_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "error": {
                "type": "card_error",
                "code": "card_declined",
                "decline_code": "insufficient_funds",
                "message": "Your card has insufficient funds."
            }
        })))
        .mount(&server)
        .await;

    let outcome = processor(&server, "sk_test_123")
        .charge(&charge_request())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ChargeOutcome::Failed {
            error: "insufficient_funds: Your card has insufficient funds.".to_string()
        }
    );
}

#[tokio::test]
async fn test_incomplete_payment_intent_is_a_failed_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "pi_2", "status": "requires_action"})),
        )
        .mount(&server)
        .await;

    let outcome = processor(&server, "sk_test_123")
        .charge(&charge_request())
        .await
        .unwrap();

    assert!(matches!(outcome, ChargeOutcome::Failed { error } if error.contains("requires_action")));
}

#[tokio::test]
async fn test_server_error_is_a_processor_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
        .mount(&server)
        .await;

    let err = processor(&server, "sk_test_123")
        .charge(&charge_request())
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessorError::UnexpectedResponse(_)));
}

#[tokio::test]
async fn test_unconfigured_key_never_calls_stripe() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = processor(&server, "")
        .charge(&charge_request())
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessorError::NotConfigured));
}

#[tokio::test]
async fn test_cached_context_skips_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let context = processor(&server, "sk_test_123")
        .resolve_context(&ContextRequest {
            payer_id: Uuid::new_v4(),
            customer_id: Some("cus_cached".to_string()),
            payment_method_id: Some("pm_cached".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(context.customer_id, "cus_cached");
    assert_eq!(context.payment_method_id, "pm_cached");
}

#[tokio::test]
async fn test_context_resolved_by_payer_search_and_default_method() {
    let server = MockServer::start().await;
    let payer_id = Uuid::new_v4();
    Mock::given(method("GET"))
        .and(path("/customers/search"))
        .and(query_param(
            "query",
            format!("metadata['payer_id']:'{}'", payer_id).as_str(),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "id": "cus_found",
                "invoice_settings": {"default_payment_method": "pm_default"}
            }]
        })))
        .mount(&server)
        .await;

    let context = processor(&server, "sk_test_123")
        .resolve_context(&ContextRequest {
            payer_id,
            customer_id: None,
            payment_method_id: None,
        })
        .await
        .unwrap();

    assert_eq!(context.customer_id, "cus_found");
    assert_eq!(context.payment_method_id, "pm_default");
}

#[tokio::test]
async fn test_context_falls_back_to_first_card() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/customers/cus_known"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cus_known",
            "invoice_settings": {"default_payment_method": null}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/payment_methods"))
        .and(query_param("customer", "cus_known"))
        .and(query_param("type", "card"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "pm_card"}]})),
        )
        .mount(&server)
        .await;

    let context = processor(&server, "sk_test_123")
        .resolve_context(&ContextRequest {
            payer_id: Uuid::new_v4(),
            customer_id: Some("cus_known".to_string()),
            payment_method_id: None,
        })
        .await
        .unwrap();

    assert_eq!(context.payment_method_id, "pm_card");
}

#[tokio::test]
async fn test_unknown_payer_is_customer_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/customers/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;
    let payer_id = Uuid::new_v4();

    let err = processor(&server, "sk_test_123")
        .resolve_context(&ContextRequest {
            payer_id,
            customer_id: None,
            payment_method_id: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessorError::CustomerNotFound(id) if id == payer_id));
}

fn idempotency_error() -> ResponseTemplate {
    ResponseTemplate::new(400).set_body_json(json!({
        "error": {
            "type": "idempotency_error",
            "message": "Keys for idempotent requests can only be used with the same parameters they were first used with."
        }
    }))
}

#[tokio::test]
async fn test_idempotency_conflict_returns_original_payment_intent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .respond_with(idempotency_error())
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/payment_intents/search"))
        .and(query_param(
            "query",
            "metadata['idempotency_key']:'subscription:abc:1738281600'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "pi_original", "status": "succeeded"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = processor(&server, "sk_test_123")
        .charge(&charge_request())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ChargeOutcome::Succeeded {
            processor_payment_id: "pi_original".to_string()
        }
    );
}

#[tokio::test]
async fn test_idempotency_conflict_without_original_is_not_a_decline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .respond_with(idempotency_error())
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/payment_intents/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let err = processor(&server, "sk_test_123")
        .charge(&charge_request())
        .await
        .unwrap_err();

    assert!(
        matches!(err, ProcessorError::IdempotencyConflict(key) if key == "subscription:abc:1738281600")
    );
}

#[tokio::test]
async fn test_charge_tags_payment_intent_with_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .and(body_string_contains(
            "metadata%5Bidempotency_key%5D=subscription%3Aabc%3A1738281600",
        ))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "pi_3", "status": "succeeded"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = processor(&server, "sk_test_123")
        .charge(&charge_request())
        .await
        .unwrap();

    assert!(matches!(outcome, ChargeOutcome::Succeeded { .. }));
}
