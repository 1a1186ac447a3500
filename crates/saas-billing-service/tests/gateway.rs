//! Payment gateway client tests against a mock provider.

use std::time::Duration;

use saas_billing_service::gateway::ChargeRequest;
use saas_billing_service::{HttpGateway, PaymentGateway};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway(server: &MockServer) -> HttpGateway {
    HttpGateway::new(server.uri(), "test_sk", Duration::from_secs(5)).unwrap()
}

fn charge_request() -> ChargeRequest {
    ChargeRequest {
        token: "bk_123".into(),
        customer_key: "tenant-1".into(),
        amount: 39_000,
        order_id: "ord_1".into(),
        order_name: "Tier 1".into(),
        customer_email: Some("billing@tenant.test".into()),
    }
}

#[tokio::test]
async fn issues_billing_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/billing/authorizations/issue"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({
            "authKey": "auth_abc",
            "customerKey": "tenant-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "billingKey": "bk_123",
            "cardCompany": "Shinhan",
            "card": { "number": "4330****1234", "cardType": "CREDIT" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let issued = gateway(&server)
        .issue_billing_token("auth_abc", "tenant-1")
        .await
        .unwrap();

    assert_eq!(issued.token, "bk_123");
    assert_eq!(issued.card_summary.as_deref(), Some("Shinhan 4330****1234"));
}

#[tokio::test]
async fn charges_billing_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/billing/bk_123"))
        .and(body_partial_json(json!({
            "customerKey": "tenant-1",
            "amount": 39_000,
            "orderId": "ord_1",
            "orderName": "Tier 1",
            "customerEmail": "billing@tenant.test"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "paymentKey": "pay_1",
            "orderId": "ord_1",
            "status": "DONE",
            "totalAmount": 39_000
        })))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = gateway(&server).charge(&charge_request()).await.unwrap();

    assert_eq!(receipt.gateway_reference, "pay_1");
    assert!(receipt.is_done());
}

#[tokio::test]
async fn provider_error_body_becomes_gateway_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/billing/bk_123"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "REJECT_CARD_PAYMENT",
            "message": "limit exceeded"
        })))
        .mount(&server)
        .await;

    let err = gateway(&server).charge(&charge_request()).await.unwrap_err();

    assert_eq!(err.code, "REJECT_CARD_PAYMENT");
    assert_eq!(err.message, "limit exceeded");
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn unparseable_error_uses_status_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/billing/bk_123"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let err = gateway(&server).charge(&charge_request()).await.unwrap_err();

    assert_eq!(err.code, "HTTP_500");
}

#[tokio::test]
async fn slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/billing/bk_123"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "paymentKey": "pay_1", "status": "DONE" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let gateway = HttpGateway::new(server.uri(), "test_sk", Duration::from_millis(200)).unwrap();
    let err = gateway.charge(&charge_request()).await.unwrap_err();

    assert!(err.is_timeout());
}

#[tokio::test]
async fn refunds_captured_payment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payments/pay_1/cancel"))
        .and(body_partial_json(json!({
            "cancelReason": "subscription cancelled",
            "cancelAmount": 13_000
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "paymentKey": "pay_1",
            "status": "PARTIAL_CANCELED"
        })))
        .expect(1)
        .mount(&server)
        .await;

    gateway(&server)
        .refund("pay_1", "subscription cancelled", 13_000)
        .await
        .unwrap();
}
