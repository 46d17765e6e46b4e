use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tourline_api::{app, metrics::ApiMetrics, state::AuthConfig, AppState};
use tourline_core::clock::{Clock, FixedClock};
use tourline_core::models::{Departure, DepartureStatus, PriceQuote};
use tourline_core::payment::{to_gateway_amount, GatewaySettings, GatewaySigner, SECURE_HASH};
use tourline_core::refund::RefundPolicy;
use tourline_order::{BookingManager, PaymentOrchestrator};
use tourline_shared::Masked;
use tourline_store::MemoryStore;
use tower::ServiceExt;
use uuid::Uuid;

const GATEWAY_SECRET: &str = "INTEGRATIONSECRET";

struct TestApp {
    router: Router,
    store: MemoryStore,
    departure_id: Uuid,
}

fn gateway_settings() -> GatewaySettings {
    GatewaySettings {
        gateway_id: "vnpay".to_string(),
        pay_url: "https://pay.example/vpcpay.html".to_string(),
        tmn_code: "TOURLINE".to_string(),
        hash_secret: Masked::new(GATEWAY_SECRET.to_string()),
        version: "2.1.0".to_string(),
        locale: "vn".to_string(),
        currency: "VND".to_string(),
        utc_offset_hours: 7,
    }
}

/// App over the in-memory store with one 3-seat departure 20 days out.
async fn test_app() -> TestApp {
    let store = MemoryStore::new();
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 3, 30, 0).unwrap()));

    let departure = Departure {
        id: Uuid::new_v4(),
        tour_id: Uuid::new_v4(),
        departs_on: NaiveDate::from_ymd_opt(2026, 11, 7).unwrap(),
        returns_on: NaiveDate::from_ymd_opt(2026, 11, 10).unwrap(),
        capacity: 3,
        reserved_seats: 0,
        status: DepartureStatus::Scheduled,
        notes: None,
        updated_at: clock.now(),
    };
    let departure_id = departure.id;
    store
        .insert_departure(
            departure,
            PriceQuote {
                adult_price: Decimal::new(750_000, 0),
                child_price: Decimal::new(300_000, 0),
            },
        )
        .await;

    let bookings = BookingManager::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        RefundPolicy::default(),
        clock.clone(),
    );
    let payments = PaymentOrchestrator::new(
        Arc::new(store.clone()),
        gateway_settings(),
        Duration::minutes(15),
        clock,
    );

    let state = AppState {
        bookings: Arc::new(bookings),
        payments: Arc::new(payments),
        redis: None,
        metrics: Arc::new(ApiMetrics::new().unwrap()),
        auth: AuthConfig {
            secret: Masked::new("test-jwt-secret".to_string()),
            expiration: 3600,
        },
    };

    TestApp {
        router: app(state),
        store,
        departure_id,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn guest_token(router: &Router) -> String {
    let (status, body) = send(
        router,
        Request::post("/v1/auth/guest").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

fn authed_post(uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed_get(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().unwrap()).unwrap()
}

async fn create_booking(t: &TestApp, token: &str, adults: u32) -> (StatusCode, Value) {
    send(
        &t.router,
        authed_post(
            "/v1/bookings",
            token,
            json!({ "departure_id": t.departure_id, "adults": adults, "payment_method": "vnpay" }),
        ),
    )
    .await
}

/// Query string for a gateway callback, signed the way the gateway signs it.
fn signed_callback(code: &str, amount: Decimal, response_code: &str) -> String {
    let mut params = BTreeMap::new();
    params.insert("vnp_TmnCode".to_string(), "TOURLINE".to_string());
    params.insert("vnp_TxnRef".to_string(), code.to_string());
    params.insert("vnp_Amount".to_string(), to_gateway_amount(amount).unwrap().to_string());
    params.insert("vnp_ResponseCode".to_string(), response_code.to_string());
    params.insert("vnp_TransactionStatus".to_string(), response_code.to_string());
    params.insert("vnp_TransactionNo".to_string(), "14123456".to_string());
    params.insert("vnp_BankCode".to_string(), "NCB".to_string());

    let signature = GatewaySigner::new(Masked::new(GATEWAY_SECRET.to_string())).sign(&params);
    params.insert(SECURE_HASH.to_string(), signature);
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

#[tokio::test]
async fn test_health() {
    let t = test_app().await;
    let response = t
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_bookings_require_a_token() {
    let t = test_app().await;
    let (status, _) = send(
        &t.router,
        Request::post("/v1/bookings")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "departure_id": t.departure_id, "adults": 1, "payment_method": "vnpay" }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&t.router, authed_get(&format!("/v1/bookings/{}", Uuid::new_v4()), "garbage")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_booking_until_full_then_cancel() {
    let t = test_app().await;
    let token = guest_token(&t.router).await;

    let (status, body) = send(
        &t.router,
        Request::get(format!("/v1/departures/{}/availability?seats=3", t.departure_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], true);
    assert_eq!(body["free_seats"], 3);

    let (status, booking) = create_booking(&t, &token, 2).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(booking["status"], "pending_confirmation");
    assert_eq!(decimal(&booking["total_amount"]), Decimal::new(1_500_000, 0));

    let (status, body) = create_booking(&t, &token, 2).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "insufficient_capacity");
    assert_eq!(body["requested"], 2);
    assert_eq!(body["free_seats"], 1);

    let booking_id = booking["id"].as_str().unwrap().to_string();

    // Another guest cannot see it.
    let stranger = guest_token(&t.router).await;
    let (status, _) = send(&t.router, authed_get(&format!("/v1/bookings/{}", booking_id), &stranger)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, preview) = send(
        &t.router,
        authed_get(&format!("/v1/bookings/{}/refund-preview", booking_id), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preview["refund_percentage"], 50);

    let (status, refund) = send(
        &t.router,
        authed_post(&format!("/v1/bookings/{}/cancel", booking_id), &token, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refund["days_before_departure"], 20);
    assert_eq!(decimal(&refund["refund_amount"]), Decimal::new(750_000, 0));

    let departure = t.store.departure(t.departure_id).await.unwrap();
    assert_eq!(departure.reserved_seats, 0);

    let (status, body) = send(
        &t.router,
        authed_post(&format!("/v1/bookings/{}/cancel", booking_id), &token, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");
}

#[tokio::test]
async fn test_payment_flow_over_ipn() {
    let t = test_app().await;
    let token = guest_token(&t.router).await;

    let (_, booking) = create_booking(&t, &token, 1).await;
    let booking_id = booking["id"].as_str().unwrap().to_string();

    let (status, payment) = send(
        &t.router,
        authed_post(
            &format!("/v1/bookings/{}/payments", booking_id),
            &token,
            json!({ "return_url": "https://tourline.example/return" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(payment["payment_url"].as_str().unwrap().starts_with("https://pay.example/vpcpay.html?"));
    assert_eq!(payment["reused"], false);

    let code = payment["internal_code"].as_str().unwrap().to_string();
    let amount = decimal(&payment["amount"]);

    // Tampered amount fails signature verification.
    let tampered = signed_callback(&code, amount, "00").replace(
        &format!("vnp_Amount={}", to_gateway_amount(amount).unwrap()),
        "vnp_Amount=100",
    );
    let (status, ack) = send(
        &t.router,
        Request::get(format!("/v1/payments/gateway/ipn?{}", tampered)).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["RspCode"], "97");

    let query = signed_callback(&code, amount, "00");
    let ipn = || Request::get(format!("/v1/payments/gateway/ipn?{}", query)).body(Body::empty()).unwrap();

    let (status, ack) = send(&t.router, ipn()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["RspCode"], "00");

    let (_, ack) = send(&t.router, ipn()).await;
    assert_eq!(ack["RspCode"], "02");

    let (_, details) = send(&t.router, authed_get(&format!("/v1/bookings/{}", booking_id), &token)).await;
    assert_eq!(details["status"], "paid");

    // The browser return for the same callback only reports the generic outcome.
    let (status, body) = send(
        &t.router,
        Request::get(format!("/v1/payments/gateway/return?{}", query)).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_processed");
    assert_eq!(body["transaction_code"], code.as_str());

    let response = t
        .router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
    assert!(text.contains("tourline_bookings_created_total 1"));
    assert!(text.contains("tourline_reconciliations_total{outcome=\"paid\"} 1"));
    assert!(text.contains("tourline_reconciliations_total{outcome=\"invalid_signature\"} 1"));
}

#[tokio::test]
async fn test_unknown_transaction_is_acknowledged_as_not_found() {
    let t = test_app().await;
    let query = signed_callback("TL000000000000", Decimal::new(750_000, 0), "00");
    let (status, ack) = send(
        &t.router,
        Request::get(format!("/v1/payments/gateway/ipn?{}", query)).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["RspCode"], "01");
}
