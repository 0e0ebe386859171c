//! Ingest → engine → verification → reports, end to end over HTTP.

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

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
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

/// One visitor: tagged arrival, browse, purchase.
async fn seed_conversion(app: &axum::Router, token: &str) {
    let browse = json!({
        "token": token,
        "aid": "buyer-1",
        "sid": "sess-1",
        "session": { "lp": "https://shop.example/?gclid=click-1", "gc": "click-1" },
        "events": [{ "n": "PageView", "u": "https://shop.example/" }]
    });
    let response = app
        .clone()
        .oneshot(post_json("/t/event", &browse))
        .await
        .expect("browse");
    assert_eq!(response.status(), StatusCode::OK);

    let purchase = json!({
        "token": token,
        "aid": "buyer-1",
        "sid": "sess-1",
        "events": [{
            "n": "Purchase", "oid": "ord-1", "rev": 250, "cur": "USD",
            "pids": ["sku-1"], "qty": 1, "eid": "evt-ord-1"
        }]
    });
    let response = app
        .clone()
        .oneshot(post_json("/t/event", &purchase))
        .await
        .expect("purchase");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn full_pipeline_attributes_verifies_and_reports() {
    let (_state, app, token) = setup().await;
    seed_conversion(&app, &token).await;

    // Run the engine for the tenant.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/attribution/t1/run",
            &json!({ "lookback_days": 30 }),
        ))
        .await
        .expect("run");
    assert_eq!(response.status(), StatusCode::OK);
    let run = json_body(response).await;
    assert_eq!(run["data"]["orders_seen"], 1);
    assert_eq!(run["data"]["orders_attributed"], 1);
    // One touchpoint × five models.
    assert_eq!(run["data"]["results_written"], 5);
    assert_eq!(run["data"]["verification"]["checked"], 5);
    assert_eq!(run["data"]["verification"]["normalized"], 0);

    // Verification status rolls up clean.
    let response = app
        .clone()
        .oneshot(get("/api/verification/t1/status"))
        .await
        .expect("status");
    let status = json_body(response).await;
    assert_eq!(status["data"]["status"], "verified");
    assert_eq!(status["data"]["credit_integrity_pct"], 100.0);
    assert_eq!(status["data"]["revenue_integrity_pct"], 100.0);

    // Platform report: all 250.00 lands on google.
    let response = app
        .clone()
        .oneshot(get(
            "/api/reports/t1/attribution?model=last_click&lookback_days=30&group_by=platform",
        ))
        .await
        .expect("report");
    let report = json_body(response).await;
    let rows = report["data"]["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["group_value"], "google");
    assert_eq!(rows[0]["revenue"], 250.0);
    assert_eq!(rows[0]["conversions"], 1.0);
    // No spend synced, so no ROAS/CPA.
    assert!(rows[0]["roas"].is_null());

    // Model comparison returns one report per model.
    let response = app
        .clone()
        .oneshot(get("/api/reports/t1/compare?lookback_days=30"))
        .await
        .expect("compare");
    let compare = json_body(response).await;
    assert_eq!(compare["data"].as_array().map(Vec::len), Some(5));

    // Journey: a single-touch order, converted after its first touch.
    let response = app
        .clone()
        .oneshot(get(
            "/api/reports/t1/journey?model=last_click&lookback_days=30",
        ))
        .await
        .expect("journey");
    let journey = json_body(response).await;
    assert_eq!(journey["data"]["orders"], 1);
    assert_eq!(journey["data"]["single_touch_orders"], 1);
    assert_eq!(journey["data"]["top_last_touch"][0]["platform"], "google");

    // Conversion paths.
    let response = app
        .clone()
        .oneshot(get(
            "/api/reports/t1/paths?model=last_click&lookback_days=30&limit=5",
        ))
        .await
        .expect("paths");
    let paths = json_body(response).await;
    assert_eq!(paths["data"][0]["path"], "google");
    assert_eq!(paths["data"][0]["orders"], 1);
}

#[tokio::test]
async fn run_rejects_invalid_lookback() {
    let (_state, app, _token) = setup().await;
    let response = app
        .oneshot(post_json(
            "/api/attribution/t1/run",
            &json!({ "lookback_days": 13 }),
        ))
        .await
        .expect("run");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn settings_roundtrip_and_validation() {
    let (_state, app, _token) = setup().await;

    // Defaults before anything is saved.
    let response = app
        .clone()
        .oneshot(get("/api/settings/t1"))
        .await
        .expect("get");
    let body = json_body(response).await;
    assert_eq!(body["data"]["default_lookback_days"], 30);
    assert_eq!(body["data"]["default_model"], "last_click");

    // Invalid lookback is rejected.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/settings/t1")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "default_lookback_days": 45, "default_model": "linear" }).to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("put");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Valid settings persist.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/settings/t1")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "default_lookback_days": 90,
                        "default_model": "time_decay",
                        "accounting_mode": "cash"
                    })
                    .to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("put");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/settings/t1")).await.expect("get");
    let body = json_body(response).await;
    assert_eq!(body["data"]["default_lookback_days"], 90);
    assert_eq!(body["data"]["default_model"], "time_decay");
    assert_eq!(body["data"]["accounting_mode"], "cash");
}

#[tokio::test]
async fn spend_enables_roas_and_cpa_on_platform_reports() {
    let (state, app, token) = setup().await;
    seed_conversion(&app, &token).await;
    app.clone()
        .oneshot(post_json(
            "/api/attribution/t1/run",
            &json!({ "lookback_days": 30 }),
        ))
        .await
        .expect("run");

    let today = chrono::Utc::now().date_naive().to_string();
    state
        .db
        .seed_platform_spend("t1", "google", &today, 125.0)
        .await
        .expect("seed spend");

    let response = app
        .oneshot(get(
            "/api/reports/t1/attribution?model=last_click&lookback_days=30&group_by=platform",
        ))
        .await
        .expect("report");
    let report = json_body(response).await;
    let row = &report["data"]["rows"][0];
    assert_eq!(row["spend"], 125.0);
    // roas = 250 / 125, cpa = 125 / 1.
    assert_eq!(row["roas"], 2.0);
    assert_eq!(row["cpa"], 125.0);
}
