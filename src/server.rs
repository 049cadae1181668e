use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::future::Future;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        create_invoice, get_account, get_account_transactions, get_invoice, get_invoice_status,
        health_check, rail_webhook, AppState,
    },
    config::Config,
    middleware::{create_cors_layer, rate_limit_middleware, RateLimitLayer},
};

pub fn create_app(state: AppState, config: &Config) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // Rails retry on 429, so webhooks get their own limiter
    let webhook_limit = RateLimitLayer::per_minute(config.webhook_rate_limit_per_minute);
    let webhooks = Router::new()
        .route("/webhooks/:rail", post(rail_webhook))
        .route_layer(from_fn_with_state(webhook_limit, rate_limit_middleware));

    let app = Router::new()
        .route("/health", get(health_check))
        // Invoices
        .route("/invoices", post(create_invoice))
        .route("/invoices/:id", get(get_invoice))
        .route("/invoices/:id/status", get(get_invoice_status))
        // Accounts
        .route("/accounts/:id", get(get_account))
        .route("/accounts/:id/transactions", get(get_account_transactions))
        .merge(webhooks)
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(&config.cors_origin_list()))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerStore;
    use crate::testing::{self, FakeRail};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> (Router, Arc<FakeRail>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let rail = Arc::new(FakeRail::new());
        let state = AppState {
            orchestrator: Arc::new(testing::orchestrator(store, rail.clone())),
        };
        (create_app(state, &testing::test_config()), rail)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_invoice_below_minimum_is_rejected() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json(
                "/invoices",
                serde_json::json!({
                    "accountId": Uuid::new_v4(),
                    "amountUsd": 50,
                    "asset": "BTC",
                    "rail": "nowpayments",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_invoice_then_read_status() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/invoices",
                serde_json::json!({
                    "accountId": Uuid::new_v4(),
                    "amountUsd": 5000,
                    "asset": "BTC",
                    "rail": "nowpayments",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["confirmationsRequired"], 3);
        let invoice_id = body["invoiceId"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/invoices/{}/status", invoice_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["confirmations"], 0);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_invoice_is_not_acknowledged() {
        let (app, rail) = app();
        let body = rail.ipn("999", Uuid::new_v4(), "finished", Some(3));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/nowpayments")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        // non-2xx keeps the rail redelivering
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_rail() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json("/webhooks/paypal", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"], "memory");
    }
}
