use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use llm_router::discovery::StaticServiceDiscovery;
use llm_router::proxy::{Proxy, ProxyConfig};
use llm_router::routing::round_robin::RoundRobinAffinity;
use llm_router::routing::{RequestContext, Router};
use llm_router::telemetry::RequestStatsMonitor;
use llm_router::types::Endpoint;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ctx(request_id: &str) -> RequestContext {
    RequestContext {
        request_id: request_id.to_string(),
        model: "opt-125m".to_string(),
        ..Default::default()
    }
}

fn proxy_over(endpoints: Vec<Endpoint>, max_failover_attempts: u32) -> Arc<Proxy> {
    let discovery = StaticServiceDiscovery::new(endpoints, Duration::from_secs(3600));
    let router = Arc::new(Router::new(vec![], Box::new(RoundRobinAffinity::new())));
    let request_stats = Arc::new(RequestStatsMonitor::new(60.0));
    Arc::new(Proxy::new(
        discovery,
        router,
        request_stats,
        None,
        ProxyConfig { aliases: HashMap::new(), max_failover_attempts },
        None,
    ))
}

#[tokio::test]
async fn round_robin_alternates_across_two_backends() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    for server in [&a, &b] {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(server)
            .await;
    }

    let endpoints = vec![
        Endpoint::new(a.uri(), vec!["opt-125m".to_string()]),
        Endpoint::new(b.uri(), vec!["opt-125m".to_string()]),
    ];
    let proxy = proxy_over(endpoints, 0);

    let mut hit = vec![];
    for i in 0..4 {
        let dispatched = proxy
            .dispatch(
                &ctx(&format!("r{i}")),
                serde_json::json!({"model": "opt-125m", "messages": []}),
                "/v1/chat/completions",
                reqwest::header::HeaderMap::new(),
                &HashMap::new(),
                0.0,
            )
            .await
            .expect("dispatch should succeed");
        hit.push(dispatched.endpoint_url);
    }

    assert_eq!(hit[0], hit[2]);
    assert_eq!(hit[1], hit[3]);
    assert_ne!(hit[0], hit[1]);
}

#[tokio::test]
async fn failover_skips_a_backend_returning_5xx() {
    let failing = MockServer::start().await;
    let healthy = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&failing)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
        .mount(&healthy)
        .await;

    // Endpoint order is deterministic: `RoundRobinAffinity` sorts candidates
    // by URL, so whichever of `failing`/`healthy` sorts first is tried first.
    let mut endpoints = vec![
        Endpoint::new(failing.uri(), vec!["opt-125m".to_string()]),
        Endpoint::new(healthy.uri(), vec!["opt-125m".to_string()]),
    ];
    endpoints.sort_by(|a, b| a.url.cmp(&b.url));
    let proxy = proxy_over(endpoints, 1);

    let dispatched = proxy
        .dispatch(
            &ctx("r1"),
            serde_json::json!({"model": "opt-125m", "messages": []}),
            "/v1/chat/completions",
            reqwest::header::HeaderMap::new(),
            &HashMap::new(),
            0.0,
        )
        .await
        .expect("should fail over to the healthy backend");

    assert_eq!(dispatched.endpoint_url, healthy.uri());
}

#[tokio::test]
async fn client_error_is_returned_without_failover() {
    let one = MockServer::start().await;
    let two = MockServer::start().await;
    // `RoundRobinAffinity` picks the lexicographically-first URL on the
    // first call; that server gets the 400 so the test can assert the
    // *other* server was never contacted.
    let (first, second) = if one.uri() < two.uri() { (one, two) } else { (two, one) };

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "bad request"})))
        .mount(&first)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&second)
        .await;

    let endpoints = vec![
        Endpoint::new(first.uri(), vec!["opt-125m".to_string()]),
        Endpoint::new(second.uri(), vec!["opt-125m".to_string()]),
    ];
    let proxy = proxy_over(endpoints, 3);

    let dispatched = proxy
        .dispatch(
            &ctx("r1"),
            serde_json::json!({"model": "opt-125m", "messages": []}),
            "/v1/chat/completions",
            reqwest::header::HeaderMap::new(),
            &HashMap::new(),
            0.0,
        )
        .await
        .expect("4xx responses are returned, not treated as a dispatch error");

    assert_eq!(dispatched.response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(second.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_model_yields_no_healthy_endpoint() {
    let endpoints = vec![Endpoint::new("http://127.0.0.1:1", vec!["opt-125m".to_string()])];
    let proxy = proxy_over(endpoints, 0);

    let unknown_model_ctx = RequestContext {
        request_id: "r1".to_string(),
        model: "does-not-exist".to_string(),
        ..Default::default()
    };
    let err = proxy
        .dispatch(
            &unknown_model_ctx,
            serde_json::json!({"model": "does-not-exist"}),
            "/v1/chat/completions",
            reqwest::header::HeaderMap::new(),
            &HashMap::new(),
            0.0,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, llm_router::error::RouterError::FailoverExhausted(_)));
}
