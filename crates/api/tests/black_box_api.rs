use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};

use marketsync_api::app::services::AppServices;
use marketsync_pipeline::{GatewayError, PipelineConfig, SandboxGateway};

struct TestServer {
    base_url: String,
    gateway: Arc<SandboxGateway>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(config: PipelineConfig) -> Self {
        // Same router as prod, in-memory stores, instant sandbox, ephemeral port.
        let gateway = Arc::new(SandboxGateway::instant());
        let services = AppServices::in_memory(&config, gateway.clone());
        let app = marketsync_api::app::build_app(services);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            gateway,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn no_backoff() -> PipelineConfig {
    PipelineConfig {
        base_delay_ms: 0,
        ..PipelineConfig::default()
    }
}

fn listing_body(subject: &str) -> Value {
    json!({
        "subject_ref": subject,
        "payload": {
            "kind": "create_listing",
            "title": "Ceramic mug",
            "price_cents": 1250,
            "quantity": 40,
            "category": "kitchen"
        }
    })
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: &Value) -> (StatusCode, Value) {
    let res = client
        .post(srv.url("/sync/operations"))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn health_endpoint_is_public() {
    let srv = TestServer::spawn(no_backoff()).await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn submit_returns_created_record_with_outcome() {
    let srv = TestServer::spawn(no_backoff()).await;
    let client = reqwest::Client::new();

    let (status, body) = submit(&client, &srv, &listing_body("product-mug")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "succeeded");
    assert_eq!(body["kind"], "create_listing");
    assert_eq!(body["attempt_count"], 1);
    assert_eq!(body["external_ref"], "SKU-product-");
    assert_eq!(body["request_payload"]["sku"], "SKU-product-");

    let id = body["id"].as_str().unwrap();
    let res = client
        .get(srv.url(&format!("/sync/operations/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: Value = res.json().await.unwrap();
    assert_eq!(fetched, body);
}

#[tokio::test]
async fn invalid_payload_is_a_bad_request() {
    let srv = TestServer::spawn(no_backoff()).await;
    let client = reqwest::Client::new();

    let mut body = listing_body("product-bad");
    body["payload"]["price_cents"] = json!(0);
    let (status, err) = submit(&client, &srv, &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "validation_error");

    let (status, err) = submit(&client, &srv, &json!({"payload": {"kind": "delete_everything"}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "validation_error");

    let list: Value = client
        .get(srv.url("/sync/operations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_operation_is_not_found() {
    let srv = TestServer::spawn(no_backoff()).await;
    let client = reqwest::Client::new();
    let id = marketsync_pipeline::OperationId::new();

    let res = client
        .get(srv.url(&format!("/sync/operations/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn retry_until_exhausted_then_triage_dead_letter() {
    let srv = TestServer::spawn(no_backoff()).await;
    let client = reqwest::Client::new();
    srv.gateway
        .fail_always(Some(GatewayError::Network("connection refused".into())));

    let (status, record) = submit(&client, &srv, &listing_body("product-dlq")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(record["state"], "failed_retrying");
    let id = record["id"].as_str().unwrap().to_string();

    let retry_url = srv.url(&format!("/sync/operations/{id}/retry"));
    let second: Value = client.post(&retry_url).send().await.unwrap().json().await.unwrap();
    assert_eq!(second["attempt_count"], 2);
    let third = client.post(&retry_url).send().await.unwrap();
    assert_eq!(third.status(), StatusCode::OK);
    let third: Value = third.json().await.unwrap();
    assert_eq!(third["state"], "failed_exhausted");
    assert_eq!(third["attempt_count"], 3);

    // Terminal records refuse further retries.
    let res = client.post(&retry_url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "precondition_failed");

    let entries: Value = client
        .get(srv.url("/sync/dead-letters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["operation_id"], id.as_str());
    assert_eq!(entries[0]["attempt_count"], 3);

    let entry_id = entries[0]["id"].as_str().unwrap();
    let delete_url = srv.url(&format!("/sync/dead-letters/{entry_id}"));
    let removed: Value = client.delete(&delete_url).send().await.unwrap().json().await.unwrap();
    assert_eq!(removed, json!({"removed": true}));

    let again = client.delete(&delete_url).send().await.unwrap();
    assert_eq!(again.status(), StatusCode::OK);
    let again: Value = again.json().await.unwrap();
    assert_eq!(again, json!({"removed": false}));

    // The record stays exhausted after triage.
    let record: Value = client
        .get(srv.url(&format!("/sync/operations/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["state"], "failed_exhausted");
}

#[tokio::test]
async fn early_retry_is_too_early() {
    let srv = TestServer::spawn(PipelineConfig {
        base_delay_ms: 60_000,
        ..PipelineConfig::default()
    })
    .await;
    let client = reqwest::Client::new();
    srv.gateway
        .inject_failure(GatewayError::RateLimited { retry_after: Some(Duration::from_secs(1)) });

    let (_, record) = submit(&client, &srv, &listing_body("product-early")).await;
    assert_eq!(record["state"], "failed_retrying");

    let id = record["id"].as_str().unwrap();
    let res = client
        .post(srv.url(&format!("/sync/operations/{id}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_EARLY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "too_early");
    assert!(body["retry_at"].is_string());
}

#[tokio::test]
async fn list_filters_by_state_and_kind() {
    let srv = TestServer::spawn(no_backoff()).await;
    let client = reqwest::Client::new();

    submit(&client, &srv, &listing_body("product-one")).await;
    srv.gateway.inject_failure(GatewayError::Unknown("hiccup".into()));
    submit(&client, &srv, &json!({"payload": {"kind": "fetch_orders"}})).await;

    let retrying: Value = client
        .get(srv.url("/sync/operations?state=failed_retrying"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let retrying = retrying.as_array().unwrap();
    assert_eq!(retrying.len(), 1);
    assert_eq!(retrying[0]["kind"], "fetch_orders");

    let listings: Value = client
        .get(srv.url("/sync/operations?kind=create_listing&limit=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listings.as_array().unwrap().len(), 1);

    let res = client
        .get(srv.url("/sync/operations?kind=teleport"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sweep_and_stats() {
    let srv = TestServer::spawn(no_backoff()).await;
    let client = reqwest::Client::new();

    srv.gateway.inject_failure(GatewayError::Network("reset".into()));
    let (_, record) = submit(&client, &srv, &listing_body("product-sweep")).await;
    assert_eq!(record["state"], "failed_retrying");

    let report: Value = client
        .post(srv.url("/sync/sweep"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["retried"], 1);
    assert_eq!(report["succeeded"], 1);

    let stats: Value = client
        .get(srv.url("/sync/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["succeeded"], 1);
    assert_eq!(stats["failed_retrying"], 0);
    assert_eq!(stats["dead_letters"], 0);
    assert_eq!(stats["last_24h"]["succeeded"], 1);
}
