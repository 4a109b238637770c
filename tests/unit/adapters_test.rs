use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use oracle_control_plane::adapters::{
    create_adapter, AdapterConfig, AuthConfig, DataValue, RateLimitConfig, SourceAdapter,
    SourceKind,
};
use oracle_control_plane::errors::OracleError;
use oracle_control_plane::services::metrics_service::MetricsService;

use crate::fixtures::rest_source;
use crate::helpers::{spawn_json_server, spawn_json_server_with_status};

#[tokio::test]
async fn test_rest_fetch_parses_primitive_body() {
    let server = spawn_json_server(json!(101.25)).await;
    let adapter = create_adapter(rest_source("price", &server.url), None).expect("adapter");

    let point = adapter.fetch().await.expect("fetch succeeds");
    assert_eq!(point.value, DataValue::Numeric(101.25));
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rest_fetch_object_body_with_metadata() {
    let server = spawn_json_server(json!({"value": 42.0, "exchange": "mock"})).await;
    let adapter = create_adapter(rest_source("price", &server.url), None).expect("adapter");

    let point = adapter.fetch().await.expect("fetch succeeds");
    assert_eq!(point.value, DataValue::Numeric(42.0));
    assert_eq!(point.metadata.get("exchange"), Some(&json!("mock")));
}

#[tokio::test]
async fn test_rest_non_200_is_data_source_error() {
    let server = spawn_json_server_with_status(json!({"error": "boom"}), 500).await;
    let adapter = create_adapter(rest_source("price", &server.url), None).expect("adapter");

    let result = adapter.fetch().await;
    assert!(matches!(result, Err(OracleError::DataSource(_))));
}

#[tokio::test]
async fn test_cache_hit_skips_source_and_latency_sample() {
    let server = spawn_json_server(json!(7.0)).await;
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(MetricsService::new(&registry).expect("metrics"));

    let mut config = rest_source("cached", &server.url);
    config.cache_ttl = 60;
    let adapter = create_adapter(config, Some(Arc::clone(&metrics))).expect("adapter");

    let first = adapter.fetch().await.expect("first fetch");
    let second = adapter.fetch().await.expect("second fetch");

    // Identical point, one upstream request, one latency sample.
    assert_eq!(first, second);
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        metrics
            .source_latency
            .with_label_values(&["cached", "fetch", "rest"])
            .get_sample_count(),
        1
    );
}

#[tokio::test]
async fn test_rate_limiter_backpressure() {
    let server = spawn_json_server(json!(1.0)).await;
    let mut config = rest_source("limited", &server.url);
    config.rate_limit = Some(RateLimitConfig {
        calls: 2,
        period: 1,
    });
    let adapter = create_adapter(config, None).expect("adapter");

    let start = Instant::now();
    adapter.fetch().await.expect("first");
    adapter.fetch().await.expect("second");
    adapter.fetch().await.expect("third");

    // Third call may complete no earlier than the window allows.
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(server.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retries_recover_from_transient_failures() {
    // Unreachable endpoint: every attempt fails, bounded by max_attempts.
    let mut config = rest_source("flaky", "http://127.0.0.1:1/");
    config.retry.max_attempts = 2;
    let adapter = create_adapter(config, None).expect("adapter");

    let result = adapter.fetch().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_websocket_receiver_updates_latest_value() {
    use futures::SinkExt;
    use tokio_tungstenite::tungstenite::protocol::Message;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let frame = serde_json::json!({"value": 123.0}).to_string();
                ws.send(Message::Text(frame)).await.ok();
                // Keep the connection open so the receiver stays attached.
                tokio::time::sleep(Duration::from_secs(5)).await;
            });
        }
    });

    let mut config = rest_source("ws_src", &format!("ws://{}", addr));
    config.source_type = SourceKind::WebSocket;
    let adapter = create_adapter(config, None).expect("adapter");
    adapter.connect().await.expect("connect");

    // The first frame lands asynchronously; poll until it shows up.
    let mut point = None;
    for _ in 0..50 {
        match adapter.fetch().await {
            Ok(p) => {
                point = Some(p);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }

    let point = point.expect("latest value received");
    assert_eq!(point.value, DataValue::Numeric(123.0));
    adapter.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn test_oauth_bearer_header_flow() {
    use axum::routing::{get, post};
    use axum::{Json, Router};

    let token_app = Router::new().route(
        "/token",
        post(|| async { Json(json!({"access_token": "tok-123", "expires_in": 3600})) }),
    );
    let token_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let token_addr = token_listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(token_listener, token_app).await.ok();
    });

    // Data endpoint requires the bearer token issued above.
    let data_app = Router::new().route(
        "/",
        get(|headers: axum::http::HeaderMap| async move {
            let authorized = headers
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == "Bearer tok-123")
                .unwrap_or(false);
            if authorized {
                (axum::http::StatusCode::OK, Json(json!(55.5)))
            } else {
                (axum::http::StatusCode::UNAUTHORIZED, Json(json!("denied")))
            }
        }),
    );
    let data_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let data_addr = data_listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(data_listener, data_app).await.ok();
    });

    let mut config: AdapterConfig = rest_source("authed", &format!("http://{}/", data_addr));
    config.auth = Some(AuthConfig::Oauth2 {
        token_url: format!("http://{}/token", token_addr),
        client_id: "svc".to_string(),
        client_secret: "pw".to_string(),
        scope: String::new(),
    });
    let adapter = create_adapter(config, None).expect("adapter");

    let point = adapter.fetch().await.expect("authorized fetch");
    assert_eq!(point.value, DataValue::Numeric(55.5));
}
