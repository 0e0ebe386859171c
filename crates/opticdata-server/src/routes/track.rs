//! The public tracking surface: the server's untrusted input boundary.
//!
//! Everything here is unauthenticated beyond the site token. Host headers
//! are sanitised before use, client ip comes from the left-most
//! X-Forwarded-For hop, and per-event failures inside a batch are logged
//! without failing the batch — the pixel never retries on 4xx/5xx, so a
//! partial 200 loses less data than a clean error.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use opticdata_core::{
    event::{EventBatch, IdentifyPayload, SessionAttrs},
    pixel::generate_pixel_script,
    visitor::noscript_anonymous_id,
};
use opticdata_duckdb::identity::{NewEvent, VisitorIdentifiers};
use opticdata_duckdb::site::Site;

use crate::{error::AppError, state::AppState};

const TRANSPARENT_GIF: &[u8] = &[
    71, 73, 70, 56, 57, 97, 1, 0, 1, 0, 128, 0, 0, 0, 0, 0, 255, 255, 255, 33, 249, 4, 1, 0, 0, 0,
    0, 44, 0, 0, 0, 0, 1, 0, 1, 0, 0, 2, 2, 68, 1, 0, 59,
];

/// Batches beyond this are rejected outright; the pixel flushes at 20.
const MAX_BATCH_EVENTS: usize = 100;
const MAX_ID_BYTES: usize = 64;

#[derive(Debug)]
pub struct MaybeConnectInfo(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        ))
    }
}

/// Left-most X-Forwarded-For hop, falling back to the socket peer.
pub(crate) fn extract_client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| remote_addr.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Host / X-Forwarded-Host reduced to `[A-Za-z0-9.\-:]` — anything else is
/// attacker-controlled noise.
pub(crate) fn sanitized_host(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())?;
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn validate_client_id(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() || value.len() > MAX_ID_BYTES {
        return Err(AppError::BadRequest(format!(
            "{field} must be 1-{MAX_ID_BYTES} characters"
        )));
    }
    Ok(())
}

/// Serialise the click ids present in the session attrs for the event row.
fn click_ids_json(attrs: Option<&SessionAttrs>) -> Option<String> {
    let attrs = attrs?;
    let mut map = serde_json::Map::new();
    for (key, value) in [
        ("fbclid", &attrs.fbc),
        ("gclid", &attrs.gc),
        ("ttclid", &attrs.ttc),
        ("sclid", &attrs.sc),
        ("msclkid", &attrs.msc),
    ] {
        if let Some(value) = value {
            map.insert(key.to_string(), serde_json::Value::String(value.clone()));
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map).to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct PixelQuery {
    pub token: Option<String>,
}

/// `GET /t/pixel.js` — serve the tag for the site named by `?token=`, or,
/// when the token is missing, by the verified custom domain in the Host
/// header (the first-party serving path). Cacheable for 5 minutes.
#[tracing::instrument(skip(state, headers))]
pub async fn pixel_js(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PixelQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let host = sanitized_host(&headers);
    let site = state
        .resolve_site(query.token.as_deref(), host.as_deref())
        .await
        .map_err(AppError::Internal)?
        .ok_or(AppError::InvalidToken)?;

    let custom_domain = site
        .dns_verified
        .then_some(site.custom_domain.as_deref())
        .flatten();
    let script =
        generate_pixel_script(&site.site_token, &state.config.public_url, custom_domain);

    let mut response = Response::new(axum::body::Body::from(script));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    );
    Ok(response)
}

/// `POST /t/event` — ingest one pixel batch.
///
/// Events apply in the order supplied. A failing event is logged and
/// skipped; the batch still answers 200 so the tag does not retry and
/// double-deliver the events that did land.
#[tracing::instrument(skip(state, headers, batch))]
pub async fn collect_events(
    State(state): State<Arc<AppState>>,
    maybe_connect_info: MaybeConnectInfo,
    headers: HeaderMap,
    Json(batch): Json<EventBatch>,
) -> Result<Response, AppError> {
    let host = sanitized_host(&headers);
    let site = state
        .resolve_site(Some(&batch.token), host.as_deref())
        .await
        .map_err(AppError::Internal)?
        .ok_or(AppError::InvalidToken)?;

    validate_client_id(&batch.aid, "aid")?;
    validate_client_id(&batch.sid, "sid")?;
    if batch.events.is_empty() {
        return Err(AppError::BadRequest("empty batch".to_string()));
    }
    if batch.events.len() > MAX_BATCH_EVENTS {
        return Err(AppError::BadRequest(format!(
            "batch exceeds {MAX_BATCH_EVENTS} events"
        )));
    }

    let client_ip = extract_client_ip(&headers, maybe_connect_info.0);
    let ua = user_agent(&headers);
    let now = Utc::now();

    // aid/sid are scoped by the resolved tenant — they are never keys into
    // anyone else's data.
    let identifiers = VisitorIdentifiers {
        fingerprint: batch.fp.clone(),
        ..Default::default()
    };
    let visitor_id = state
        .db
        .resolve_visitor(&site.tenant_id, &site.id, &batch.aid, &identifiers, now)
        .await
        .map_err(AppError::Internal)?;

    let pageviews = batch.events.iter().filter(|e| e.n == "PageView").count() as i64;
    state
        .db
        .upsert_session(
            &site.tenant_id,
            &visitor_id,
            &batch.sid,
            batch.session.as_ref(),
            Some(&client_ip),
            Some(&ua),
            pageviews,
            batch.events.len() as i64,
            now,
        )
        .await
        .map_err(AppError::Internal)?;

    let click_ids = click_ids_json(batch.session.as_ref());
    let mut accepted = 0usize;
    for (idx, event) in batch.events.iter().enumerate() {
        let new_event = NewEvent::from_wire(event, click_ids.clone());
        // Deterministic in-batch ordering: later events sort (and classify)
        // after earlier ones even inside one flush.
        let event_now = now + chrono::Duration::microseconds(idx as i64);
        match state
            .db
            .record_event(&site.tenant_id, &visitor_id, &batch.sid, &new_event, event_now)
            .await
        {
            Ok(outcome) => {
                if outcome.inserted {
                    accepted += 1;
                }
            }
            Err(e) => {
                warn!(
                    tenant_id = %site.tenant_id,
                    event_name = %event.n,
                    error = %e,
                    "event dropped from batch"
                );
            }
        }
    }

    Ok((StatusCode::OK, Json(json!({ "ok": true, "accepted": accepted }))).into_response())
}

/// `POST /t/identify` — promote an anonymous visitor to a known one.
/// Providing a fresh email/phone/customer id is what triggers identity
/// merges.
#[tracing::instrument(skip(state, payload))]
pub async fn identify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<IdentifyPayload>,
) -> Result<Response, AppError> {
    let host = sanitized_host(&headers);
    let site = state
        .resolve_site(Some(&payload.token), host.as_deref())
        .await
        .map_err(AppError::Internal)?
        .ok_or(AppError::InvalidToken)?;

    validate_client_id(&payload.aid, "aid")?;
    if !payload.has_identifier() {
        return Err(AppError::BadRequest(
            "at least one of email, phone, cid is required".to_string(),
        ));
    }

    let identifiers = VisitorIdentifiers {
        email: payload.email.clone(),
        phone: payload.phone.clone(),
        customer_id: payload.cid.clone(),
        fingerprint: None,
    };
    let visitor_id = state
        .db
        .resolve_visitor(
            &site.tenant_id,
            &site.id,
            &payload.aid,
            &identifiers,
            Utc::now(),
        )
        .await
        .map_err(AppError::Internal)?;

    Ok((StatusCode::OK, Json(json!({ "ok": true, "visitor_id": visitor_id }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PingQuery {
    pub token: Option<String>,
    /// Page URL, when the noscript tag can template it in.
    pub u: Option<String>,
}

/// `GET /t/ping.gif` — noscript fallback: a 1×1 GIF whose fetch records a
/// single PageView. With no cookie access, identity degrades to an
/// ip+user-agent hash.
#[tracing::instrument(skip(state, headers))]
pub async fn ping_gif(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PingQuery>,
    maybe_connect_info: MaybeConnectInfo,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let host = sanitized_host(&headers);
    let site = state
        .resolve_site(query.token.as_deref(), host.as_deref())
        .await
        .map_err(AppError::Internal)?
        .ok_or(AppError::InvalidToken)?;

    let client_ip = extract_client_ip(&headers, maybe_connect_info.0);
    let ua = user_agent(&headers);
    let now = Utc::now();

    let aid = noscript_anonymous_id(&client_ip, &ua);
    // One noscript session per browser per day.
    let sid = format!("{}-{}", aid, now.format("%Y%m%d"));

    if let Err(e) = record_noscript_pageview(&state, &site, &aid, &sid, &query, &client_ip, &ua).await
    {
        // The GIF is served regardless; losing one noscript hit beats
        // breaking the embedding page.
        warn!(tenant_id = %site.tenant_id, error = %e, "noscript pageview dropped");
    }

    let mut response = Response::new(axum::body::Body::from(TRANSPARENT_GIF.to_vec()));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/gif"));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    Ok(response)
}

async fn record_noscript_pageview(
    state: &AppState,
    site: &Site,
    aid: &str,
    sid: &str,
    query: &PingQuery,
    client_ip: &str,
    ua: &str,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let visitor_id = state
        .db
        .resolve_visitor(
            &site.tenant_id,
            &site.id,
            aid,
            &VisitorIdentifiers::default(),
            now,
        )
        .await?;
    state
        .db
        .upsert_session(
            &site.tenant_id,
            &visitor_id,
            sid,
            None,
            Some(client_ip),
            Some(ua),
            1,
            1,
            now,
        )
        .await?;
    let event = NewEvent {
        name: "PageView".to_string(),
        page_url: query.u.clone(),
        currency: "USD".to_string(),
        ..Default::default()
    };
    state
        .db
        .record_event(&site.tenant_id, &visitor_id, sid, &event, now)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transparent_gif_has_valid_header() {
        assert_eq!(&TRANSPARENT_GIF[0..6], b"GIF89a");
    }

    #[test]
    fn client_ip_prefers_leftmost_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let socket: SocketAddr = "192.0.2.1:4000".parse().expect("addr");
        assert_eq!(extract_client_ip(&headers, Some(socket)), "203.0.113.7");

        let empty = HeaderMap::new();
        assert_eq!(extract_client_ip(&empty, Some(socket)), "192.0.2.1");
        assert_eq!(extract_client_ip(&empty, None), "unknown");
    }

    #[test]
    fn host_header_is_sanitised() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::HOST,
            HeaderValue::from_static("track.example.com:443"),
        );
        assert_eq!(
            sanitized_host(&headers).as_deref(),
            Some("track.example.com:443")
        );

        let mut hostile = HeaderMap::new();
        hostile.insert(
            "x-forwarded-host",
            HeaderValue::from_static("evil.com/<script>"),
        );
        assert_eq!(sanitized_host(&hostile).as_deref(), Some("evil.comscript"));
    }
}
