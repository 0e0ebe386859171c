//! Public tracking surface against a real router and in-memory DuckDB.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use opticdata_core::attribution::AttributionModel;
use opticdata_core::config::Config;
use opticdata_core::dns::StaticDnsResolver;
use opticdata_duckdb::site::CreateSiteParams;
use opticdata_duckdb::DuckDbBackend;
use opticdata_server::app::build_app;
use opticdata_server::state::AppState;

fn test_config() -> Config {
    Config {
        port: 0,
        data_dir: "/tmp/opticdata-test".to_string(),
        pixel_server_ip: "203.0.113.9".to_string(),
        public_url: "http://localhost:3000".to_string(),
        scheduler_hour_utc: 3,
        scheduler_tick_seconds: 60,
        epsilon_credit: 1e-4,
        epsilon_revenue: 0.01,
        half_life_days: 7.0,
        lookback_days: vec![7, 14, 30],
        default_model: AttributionModel::LastClick,
        attribution_batch_size: 500,
        duckdb_memory_limit: "256MB".to_string(),
    }
}

async fn setup() -> (Arc<AppState>, axum::Router, String) {
    let db = DuckDbBackend::open_in_memory().expect("in-memory DuckDB");
    let site = db
        .create_site(CreateSiteParams {
            tenant_id: "t1".to_string(),
            name: "Shop".to_string(),
        })
        .await
        .expect("seed site");
    let state = Arc::new(AppState::new(
        db,
        test_config(),
        Arc::new(StaticDnsResolver::default()),
    ));
    let app = build_app(Arc::clone(&state));
    (state, app, site.site_token)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", "1.2.3.4")
        .header("user-agent", "Mozilla/5.0 Chrome/120")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

async fn json_body(response: axum::http::Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("parse JSON")
}

fn event_batch(token: &str, aid: &str, sid: &str, events: Value) -> Value {
    json!({
        "token": token,
        "aid": aid,
        "sid": sid,
        "fp": "9f3a2b1c",
        "ts": 1_720_000_000_000_i64,
        "session": {
            "ref": "https://news.site/article",
            "lp": "https://shop.example/?gclid=click-1",
            "gc": "click-1",
            "dt": "desktop",
            "br": "Chrome",
            "os": "macOS",
            "sw": 1920,
            "sh": 1080,
            "ln": "en-US"
        },
        "events": events
    })
}

async fn count(state: &AppState, sql: &str) -> i64 {
    let conn = state.db.conn_for_test().await;
    let mut stmt = conn.prepare(sql).expect("prepare");
    stmt.query_row([], |row| row.get(0)).expect("count")
}

#[tokio::test]
async fn pixel_js_serves_the_tag_for_a_known_token() {
    let (_state, app, token) = setup().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/t/pixel.js?token={token}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/javascript; charset=utf-8")
    );
    assert_eq!(
        response
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("public, max-age=300")
    );
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let script = String::from_utf8(body.to_vec()).expect("utf8");
    assert!(script.contains(&format!("var TOKEN = '{token}';")));
    assert!(script.contains("var ENDPOINT = 'http://localhost:3000';"));
}

#[tokio::test]
async fn pixel_js_unknown_token_is_404() {
    let (_state, app, _token) = setup().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/t/pixel.js?token=st_nope")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "invalid_token");
}

#[tokio::test]
async fn event_batch_persists_session_touchpoint_and_events() {
    let (state, app, token) = setup().await;

    let body = event_batch(
        &token,
        "11111111-2222-3333-4444-555555555555",
        "sess-1",
        json!([
            { "n": "PageView", "u": "https://shop.example/" },
            { "n": "AddToCart", "u": "https://shop.example/cart", "c": "ecommerce" }
        ]),
    );
    let response = app
        .oneshot(post_json("/t/event", &body))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["accepted"], 2);

    assert_eq!(count(&state, "SELECT COUNT(*) FROM events").await, 2);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM sessions").await, 1);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM visitors").await, 1);
    // The gclid-tagged arrival produced exactly one google touchpoint.
    assert_eq!(
        count(
            &state,
            "SELECT COUNT(*) FROM touchpoints WHERE platform = 'google'"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn event_batch_with_unknown_token_is_404() {
    let (state, app, _token) = setup().await;
    let body = event_batch(
        "st_unknown",
        "11111111-2222-3333-4444-555555555555",
        "sess-1",
        json!([{ "n": "PageView" }]),
    );
    let response = app
        .oneshot(post_json("/t/event", &body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM events").await, 0);
}

#[tokio::test]
async fn malformed_batch_is_a_client_error() {
    let (_state, app, _token) = setup().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/t/event")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .expect("request"),
        )
        .await
        .expect("response");
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn duplicate_event_id_is_ingested_once() {
    let (state, app, token) = setup().await;
    let body = event_batch(
        &token,
        "11111111-2222-3333-4444-555555555555",
        "sess-1",
        json!([{ "n": "Purchase", "oid": "ord-1", "rev": "99.90", "eid": "evt-1" }]),
    );

    let first = app
        .clone()
        .oneshot(post_json("/t/event", &body))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::OK);
    let second = app
        .oneshot(post_json("/t/event", &body))
        .await
        .expect("response");
    assert_eq!(second.status(), StatusCode::OK);

    assert_eq!(
        count(&state, "SELECT COUNT(*) FROM events WHERE event_id = 'evt-1'").await,
        1
    );
}

#[tokio::test]
async fn identify_requires_at_least_one_identifier() {
    let (_state, app, token) = setup().await;
    let response = app
        .oneshot(post_json(
            "/t/identify",
            &json!({ "token": token, "aid": "aaa", "email": "  " }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn identify_merges_two_devices_sharing_an_email() {
    let (state, app, token) = setup().await;

    // Device A arrives via an ad click, then identifies.
    let batch_a = event_batch(&token, "device-a", "sess-a", json!([{ "n": "PageView" }]));
    app.clone()
        .oneshot(post_json("/t/event", &batch_a))
        .await
        .expect("batch a");
    app.clone()
        .oneshot(post_json(
            "/t/identify",
            &json!({ "token": token, "aid": "device-a", "email": "x@y.com" }),
        ))
        .await
        .expect("identify a");

    // Device B is a separate anonymous visitor until it identifies with
    // the same email.
    let batch_b = json!({
        "token": token,
        "aid": "device-b",
        "sid": "sess-b",
        "events": [{ "n": "PageView" }]
    });
    app.clone()
        .oneshot(post_json("/t/event", &batch_b))
        .await
        .expect("batch b");
    assert_eq!(count(&state, "SELECT COUNT(*) FROM visitors").await, 2);

    let response = app
        .oneshot(post_json(
            "/t/identify",
            &json!({ "token": token, "aid": "device-b", "email": "X@Y.com" }),
        ))
        .await
        .expect("identify b");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let canonical = body["visitor_id"].as_str().expect("visitor id").to_string();

    assert_eq!(count(&state, "SELECT COUNT(*) FROM identity_merges").await, 1);
    // Device A's touchpoint now belongs to the canonical row.
    let tp_visitor: String = {
        let conn = state.db.conn_for_test().await;
        let mut stmt = conn
            .prepare("SELECT visitor_id FROM touchpoints LIMIT 1")
            .expect("prepare");
        stmt.query_row([], |row| row.get(0)).expect("touchpoint")
    };
    assert_eq!(tp_visitor, canonical);
}

#[tokio::test]
async fn ping_gif_serves_pixel_and_records_a_pageview() {
    let (state, app, token) = setup().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/t/ping.gif?token={token}&u=https://shop.example/"))
                .header("x-forwarded-for", "1.2.3.4")
                .header("user-agent", "Mozilla/5.0 (noscript)")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("image/gif")
    );
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    assert_eq!(&body[0..6], b"GIF89a");

    assert_eq!(
        count(
            &state,
            "SELECT COUNT(*) FROM events WHERE event_name = 'PageView'"
        )
        .await,
        1
    );
    // Noscript identity is the hashed fallback, not a cookie UUID.
    let aid: String = {
        let conn = state.db.conn_for_test().await;
        let mut stmt = conn
            .prepare("SELECT anonymous_id FROM visitors LIMIT 1")
            .expect("prepare");
        stmt.query_row([], |row| row.get(0)).expect("visitor")
    };
    assert!(aid.starts_with("ns_"));
}

#[tokio::test]
async fn cors_preflight_allows_third_party_origins() {
    let (_state, app, _token) = setup().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/t/event")
                .header("origin", "https://shop.example")
                .header("access-control-request-method", "POST")
                .header("access-control-request-headers", "content-type")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert!(response.status().is_success());
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-max-age")
            .and_then(|v| v.to_str().ok()),
        Some("86400")
    );
}
