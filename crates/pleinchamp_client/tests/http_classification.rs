//! End-to-end checks of the client against a local HTTP server.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::Query;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use common::{ErrorKind, Location};
use pleinchamp_client::PleinchampClient;

const SAMPLE_BODY: &str = r#"{
    "forecast": {
        "0": {"date": "2026-06-12", "maxAirTemperature": 24.1, "minAirTemperature": 12.3},
        "1": {"date": "2026-06-13", "maxAirTemperature": 22.0, "minAirTemperature": 11.0}
    },
    "meta": {"model": "arome"}
}"#;

fn backyard() -> Location {
    Location {
        id: "backyard".into(),
        name: "Backyard".into(),
        latitude: 45.764,
        longitude: 4.8357,
    }
}

async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}/")
}

fn client_for(base: &str, timeout: Duration) -> PleinchampClient {
    PleinchampClient::new(base, timeout).expect("client should build")
}

#[tokio::test]
async fn test_success_parses_payload_and_sends_key_and_coordinates() {
    let router = Router::new().route(
        "/forecasts-15d",
        get(
            |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| async move {
                let key_ok = headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    == Some("secret");
                let coords_ok = q.get("latitude").map(String::as_str) == Some("45.76")
                    && q.get("longitude").map(String::as_str) == Some("4.84");
                if key_ok && coords_ok {
                    (StatusCode::OK, SAMPLE_BODY)
                } else {
                    (StatusCode::BAD_REQUEST, "bad request")
                }
            },
        ),
    );
    let base = spawn_server(router).await;

    let payload = client_for(&base, Duration::from_secs(5))
        .fetch(&backyard(), "secret")
        .await
        .expect("fetch should succeed");

    let days = payload.forecast.expect("forecast present");
    assert_eq!(days.ordered().expect("ordered").len(), 2);
}

#[tokio::test]
async fn test_unauthorized_status() {
    let router = Router::new().route(
        "/forecasts-15d",
        get(|| async { (StatusCode::UNAUTHORIZED, "invalid key") }),
    );
    let base = spawn_server(router).await;

    let err = client_for(&base, Duration::from_secs(5))
        .fetch(&backyard(), "wrong")
        .await
        .expect_err("401 must fail");

    assert_eq!(err.kind, ErrorKind::Unauthorized);
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn test_rate_limited_carries_retry_after() {
    let router = Router::new().route(
        "/forecasts-15d",
        get(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "120")],
                "slow down",
            )
        }),
    );
    let base = spawn_server(router).await;

    let err = client_for(&base, Duration::from_secs(5))
        .fetch(&backyard(), "")
        .await
        .expect_err("429 must fail");

    assert_eq!(
        err.kind,
        ErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(120))
        }
    );
}

#[tokio::test]
async fn test_server_error_is_unreachable() {
    let router = Router::new().route(
        "/forecasts-15d",
        get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
    );
    let base = spawn_server(router).await;

    let err = client_for(&base, Duration::from_secs(5))
        .fetch(&backyard(), "")
        .await
        .expect_err("502 must fail");

    assert_eq!(err.kind, ErrorKind::Unreachable);
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let router = Router::new().route(
        "/forecasts-15d",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            (StatusCode::OK, SAMPLE_BODY)
        }),
    );
    let base = spawn_server(router).await;

    let err = client_for(&base, Duration::from_millis(200))
        .fetch(&backyard(), "")
        .await
        .expect_err("slow response must time out");

    assert_eq!(err.kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_non_json_body_is_malformed() {
    let router = Router::new().route(
        "/forecasts-15d",
        get(|| async { (StatusCode::OK, "<html>maintenance</html>") }),
    );
    let base = spawn_server(router).await;

    let err = client_for(&base, Duration::from_secs(5))
        .fetch(&backyard(), "")
        .await
        .expect_err("html must fail");

    assert_eq!(err.kind, ErrorKind::MalformedResponse);
}

#[tokio::test]
async fn test_connection_refused_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = client_for(&format!("http://{addr}/"), Duration::from_secs(5))
        .fetch(&backyard(), "")
        .await
        .expect_err("closed port must fail");

    assert_eq!(err.kind, ErrorKind::Unreachable);
}
