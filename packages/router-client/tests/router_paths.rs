//! Path-fallback behaviour against a mock router.

use std::time::Duration;

use router_client::{InferenceRequest, RouterClient, RouterConfig, RouterError};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> RouterClient {
    RouterClient::new(RouterConfig {
        base_url: server.uri(),
        timeout: Duration::from_secs(5),
    })
    .expect("client builds")
}

fn sample_request() -> InferenceRequest {
    InferenceRequest {
        model: "llama3.2-1b".to_string(),
        prompt: "Who are you?".to_string(),
        temperature: 0.0,
        max_tokens: 512,
        region_preference: Some("US".to_string()),
        cost_priority: false,
    }
}

fn ok_body() -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "response": "I am a language model.",
        "error": null,
        "provider_used": "modal-us-east",
        "inference_time": 1.25,
        "metadata": {}
    })
}

#[tokio::test]
async fn falls_back_to_second_path_on_404() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/inference"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/inference"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
        .mount(&server)
        .await;

    let response = client_for(&server)
        .run_inference(&sample_request(), None)
        .await
        .expect("fallback path succeeds");

    assert!(response.success);
    assert_eq!(response.response, "I am a language model.");
    assert_eq!(response.provider_used.as_deref(), Some("modal-us-east"));
}

#[tokio::test]
async fn http_500_on_first_path_stops_the_walk() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/inference"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;
    // Later paths must never be hit.
    Mock::given(method("POST"))
        .and(path("/api/v1/inference"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
        .expect(0)
        .mount(&server)
        .await;

    let err = client_for(&server)
        .run_inference(&sample_request(), None)
        .await
        .expect_err("500 is final");

    match err {
        RouterError::Http { status, body, url, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
            assert!(url.ends_with("/inference"));
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn all_paths_404_yields_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .run_inference(&sample_request(), None)
        .await
        .expect_err("nothing found");

    match err {
        RouterError::NotFound { tried } => assert_eq!(tried.len(), 4),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn http_503_preserves_rate_limit_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/inference"))
        .respond_with(
            ResponseTemplate::new(503)
                .insert_header("Retry-After", "30")
                .insert_header("X-RateLimit-Remaining", "0")
                .set_body_string("overloaded"),
        )
        .mount(&server)
        .await;

    let err = client_for(&server)
        .run_inference(&sample_request(), None)
        .await
        .expect_err("503 is final");

    match err {
        RouterError::Http { status, metadata, .. } => {
            assert_eq!(status, 503);
            assert_eq!(metadata["retry-after"], "30");
            assert_eq!(metadata["x-ratelimit-remaining"], "0");
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn router_level_failure_carries_the_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/inference"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "response": "",
            "error": "Model not available",
            "provider_used": "modal-asia",
            "inference_time": 0.0,
            "metadata": {}
        })))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .run_inference(&sample_request(), None)
        .await
        .expect_err("router rejection");

    match err {
        RouterError::Router { message, response } => {
            assert_eq!(message, "Model not available");
            assert_eq!(response.provider_used.as_deref(), Some("modal-asia"));
        }
        other => panic!("expected Router error, got {other:?}"),
    }
}

#[tokio::test]
async fn trace_id_is_propagated_as_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/inference"))
        .and(header("X-Trace-Id", "trace-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .run_inference(&sample_request(), Some("trace-123"))
        .await
        .expect("trace header matched");
}

#[tokio::test]
async fn providers_listing_decodes() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/providers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {
                "name": "modal-us-east",
                "type": "modal",
                "region": "US",
                "healthy": true,
                "cost_per_second": 0.0004,
                "avg_latency": 1.8,
                "success_rate": 0.99,
                "last_health_check": "2026-01-01T00:00:00Z"
            }
        ])))
        .mount(&server)
        .await;

    let providers = client_for(&server).get_providers().await.expect("decodes");
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].provider_type, "modal");
    assert!(providers[0].healthy);
}
