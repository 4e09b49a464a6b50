//! HTTP routes

mod admin;
mod payments;
mod subscriptions;
mod webhooks;

use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_identity},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let subscriber = Router::new()
        .route(
            "/subscriptions",
            post(subscriptions::create_subscription).get(subscriptions::list_subscriptions),
        )
        .route("/subscriptions/{id}", get(subscriptions::get_subscription))
        .route(
            "/subscriptions/{id}/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route(
            "/subscriptions/{id}/pause",
            post(subscriptions::pause_subscription),
        )
        .route(
            "/subscriptions/{id}/resume",
            post(subscriptions::resume_subscription),
        )
        .route(
            "/billing-keys/{id}",
            delete(subscriptions::revoke_billing_key),
        )
        .route(
            "/payments/{payment_key}/partial-cancel",
            post(payments::partial_cancel),
        )
        .route(
            "/payments/{payment_key}/escrow-confirm",
            post(payments::confirm_escrow),
        )
        .route(
            "/payments/{payment_key}/cash-receipt",
            post(payments::issue_cash_receipt),
        )
        .layer(middleware::from_fn(require_identity));

    let admin = Router::new()
        .route("/webhooks", get(admin::list_webhooks))
        .route("/webhooks/{id}/retry", post(admin::retry_webhook))
        .route("/settlements", get(admin::list_settlements))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gateway/payment", post(webhooks::payment_webhook))
        .route(
            "/webhooks/gateway/subscription",
            post(webhooks::subscription_webhook),
        )
        .nest("/api/v1", subscriber)
        .nest("/admin", admin)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        response::Response,
        Router,
    };
    use serde_json::{json, Value};
    use subledger_billing::{
        webhook::compute_signature, BillingConfig, BillingService, CardMetadata, FakeGateway,
        GatewayConfig, InMemoryLedger, IntervalUnit, LedgerStore, ManualClock, Plan,
        SIGNATURE_HEADER,
    };
    use time::macros::datetime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::create_router;
    use crate::{config::Config, state::AppState};

    const WEBHOOK_SECRET: &str = "whsec_api";
    const ADMIN_TOKEN: &str = "ops-token";

    struct TestApp {
        router: Router,
        billing: BillingService,
        plan: Plan,
    }

    async fn app() -> TestApp {
        let store = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(FakeGateway::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-03-02 09:00 UTC)));
        let config = BillingConfig {
            gateway: GatewayConfig::new("http://gateway.invalid", "test_sk"),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            max_retries: 3,
            renewal_timeout: StdDuration::from_secs(30),
            scheduler_concurrency: 4,
        };
        let billing = BillingService::new(store.clone(), gateway, clock, &config);

        let plan = Plan {
            id: Uuid::new_v4(),
            name: "Team monthly".to_string(),
            amount: 29_000,
            currency: "KRW".to_string(),
            interval_unit: IntervalUnit::Month,
            interval_count: 1,
            trial_days: 0,
            setup_fee: Some(5_000),
            active: true,
            created_at: datetime!(2026-01-01 0:00 UTC),
        };
        store.put_plan(&plan).await.unwrap();

        let state = AppState::new(
            billing.clone(),
            Config {
                database_url: "postgres://unused".to_string(),
                bind_address: "127.0.0.1:0".to_string(),
                admin_api_token: ADMIN_TOKEN.to_string(),
                allowed_origins: vec![],
            },
        );

        TestApp {
            router: create_router(state),
            billing,
            plan,
        }
    }

    fn request(
        method: Method,
        uri: &str,
        customer: Option<&str>,
        body: Option<Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(customer) = customer {
            builder = builder.header("x-customer-id", customer);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn admin_request(uri: &str, token: Option<&str>, role: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("x-customer-id", "ops")
            .header("x-role", role);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn webhook_request(path: &str, payload: &Value, secret: &str) -> Request<Body> {
        let raw = serde_json::to_vec(payload).unwrap();
        let signature = compute_signature(secret, &raw).unwrap();
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(raw))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Registers a key for `customer` and subscribes; the plan's setup fee
    /// produces a succeeded payment keyed `pay_fake_1`.
    async fn subscribe(app: &TestApp, customer: &str) -> Value {
        let key = app
            .billing
            .engine
            .register_billing_key(customer, &format!("bk_{}", customer), CardMetadata::default())
            .await
            .unwrap();

        let response = app
            .router
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/subscriptions",
                Some(customer),
                Some(json!({ "planId": app.plan.id, "billingKeyId": key.id })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let response = app
            .router
            .oneshot(request(Method::GET, "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_subscriber_routes_require_identity() {
        let app = app().await;
        let response = app
            .router
            .oneshot(request(Method::GET, "/api/v1/subscriptions", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], 401);
    }

    #[tokio::test]
    async fn test_create_with_auth_key_issues_billing_key() {
        let app = app().await;
        let response = app
            .router
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/subscriptions",
                Some("cust_1"),
                Some(json!({ "planId": app.plan.id, "authKey": "auth_abc" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["subscription"]["status"], "active");
        assert_eq!(created["billing_key"]["customer_id"], "cust_1");

        let response = app
            .router
            .oneshot(request(
                Method::GET,
                "/api/v1/subscriptions",
                Some("cust_1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_requires_exactly_one_credential() {
        let app = app().await;
        let response = app
            .router
            .oneshot(request(
                Method::POST,
                "/api/v1/subscriptions",
                Some("cust_1"),
                Some(json!({ "planId": app.plan.id })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_other_customer_cannot_read_or_mutate() {
        let app = app().await;
        let created = subscribe(&app, "cust_1").await;
        let id = created["subscription"]["id"].as_str().unwrap().to_string();

        let response = app
            .router
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/api/v1/subscriptions/{}", id),
                Some("cust_2"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .router
            .oneshot(request(
                Method::POST,
                &format!("/api/v1/subscriptions/{}/cancel", id),
                Some("cust_2"),
                Some(json!({ "immediate": true })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_pause_twice_conflicts() {
        let app = app().await;
        let created = subscribe(&app, "cust_1").await;
        let path = format!(
            "/api/v1/subscriptions/{}/pause",
            created["subscription"]["id"].as_str().unwrap()
        );

        let first = app
            .router
            .clone()
            .oneshot(request(Method::POST, &path, Some("cust_1"), None))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(json_body(first).await["status"], "paused");

        let second = app
            .router
            .oneshot(request(Method::POST, &path, Some("cust_1"), None))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_revoke_billing_key_cancels_subscription() {
        let app = app().await;
        let created = subscribe(&app, "cust_1").await;
        let key_id = created["billing_key"]["id"].as_str().unwrap();

        let response = app
            .router
            .oneshot(request(
                Method::DELETE,
                &format!("/api/v1/billing-keys/{}", key_id),
                Some("cust_1"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let revoked = json_body(response).await;
        assert_eq!(revoked["cancelled_subscriptions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_cancel_route_validates_amount() {
        let app = app().await;
        subscribe(&app, "cust_1").await;

        let over = app
            .router
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/payments/pay_fake_1/partial-cancel",
                Some("cust_1"),
                Some(json!({ "cancelAmount": 6_000, "cancelReason": "damaged" })),
            ))
            .await
            .unwrap();
        assert_eq!(over.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .router
            .oneshot(request(
                Method::POST,
                "/api/v1/payments/pay_fake_1/partial-cancel",
                Some("cust_1"),
                Some(json!({ "cancelAmount": 2_000, "cancelReason": "damaged" })),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["remaining_amount"], 3_000);
    }

    #[tokio::test]
    async fn test_webhook_signature_and_duplicate_delivery() {
        let app = app().await;
        let payload = json!({
            "eventType": "BILLING_KEY_CREATED",
            "createdAt": "2026-03-02T09:00:00+09:00",
            "data": { "customerKey": "cust_9", "billingKey": "bk_hook" }
        });

        let forged = app
            .router
            .clone()
            .oneshot(webhook_request(
                "/webhooks/gateway/subscription",
                &payload,
                "wrong",
            ))
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::FORBIDDEN);

        let first = app
            .router
            .clone()
            .oneshot(webhook_request(
                "/webhooks/gateway/subscription",
                &payload,
                WEBHOOK_SECRET,
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(json_body(first).await["result"], "processed");

        let again = app
            .router
            .oneshot(webhook_request(
                "/webhooks/gateway/subscription",
                &payload,
                WEBHOOK_SECRET,
            ))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        assert_eq!(json_body(again).await["result"], "duplicate");
    }

    #[tokio::test]
    async fn test_malformed_webhook_is_bad_request() {
        let app = app().await;
        let raw = b"not json".to_vec();
        let signature = compute_signature(WEBHOOK_SECRET, &raw).unwrap();
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/webhooks/gateway/payment")
                    .header(SIGNATURE_HEADER, signature)
                    .body(Body::from(raw))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_handler_conflict_is_processing_failure() {
        let app = app().await;
        app.billing
            .engine
            .register_billing_key("cust_1", "bk_taken", CardMetadata::default())
            .await
            .unwrap();

        let response = app
            .router
            .oneshot(webhook_request(
                "/webhooks/gateway/subscription",
                &json!({
                    "eventType": "BILLING_KEY_CREATED",
                    "createdAt": "2026-03-02T09:00:00+09:00",
                    "data": { "customerKey": "cust_2", "billingKey": "bk_taken" }
                }),
                WEBHOOK_SECRET,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Webhook processing failed");
        assert_eq!(body["code"], 500);
    }

    #[tokio::test]
    async fn test_admin_routes_require_role_and_token() {
        let app = app().await;

        let no_token = app
            .router
            .clone()
            .oneshot(admin_request("/admin/webhooks", None, "admin"))
            .await
            .unwrap();
        assert_eq!(no_token.status(), StatusCode::UNAUTHORIZED);

        let wrong_token = app
            .router
            .clone()
            .oneshot(admin_request("/admin/webhooks", Some("guess"), "admin"))
            .await
            .unwrap();
        assert_eq!(wrong_token.status(), StatusCode::FORBIDDEN);

        let customer = app
            .router
            .clone()
            .oneshot(admin_request("/admin/webhooks", Some(ADMIN_TOKEN), "customer"))
            .await
            .unwrap();
        assert_eq!(customer.status(), StatusCode::FORBIDDEN);

        let ok = app
            .router
            .oneshot(admin_request(
                "/admin/webhooks?status=failed&limit=10",
                Some(ADMIN_TOKEN),
                "admin",
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(json_body(ok).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_query_validation() {
        let app = app().await;

        let bad_status = app
            .router
            .clone()
            .oneshot(admin_request(
                "/admin/webhooks?status=pending",
                Some(ADMIN_TOKEN),
                "admin",
            ))
            .await
            .unwrap();
        assert_eq!(bad_status.status(), StatusCode::BAD_REQUEST);

        let bad_date = app
            .router
            .clone()
            .oneshot(admin_request(
                "/admin/settlements?date=03/02/2026",
                Some(ADMIN_TOKEN),
                "admin",
            ))
            .await
            .unwrap();
        assert_eq!(bad_date.status(), StatusCode::BAD_REQUEST);

        let empty_day = app
            .router
            .oneshot(admin_request(
                "/admin/settlements?date=2026-03-02",
                Some(ADMIN_TOKEN),
                "admin",
            ))
            .await
            .unwrap();
        assert_eq!(empty_day.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_retry_unknown_webhook_not_found() {
        let app = app().await;
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/admin/webhooks/{}/retry", Uuid::new_v4()))
                    .header("x-customer-id", "ops")
                    .header("x-role", "admin")
                    .header("authorization", format!("Bearer {}", ADMIN_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
