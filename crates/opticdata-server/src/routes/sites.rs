use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use opticdata_core::pixel::install_snippet;
use opticdata_duckdb::site::{CreateSiteParams, Site};

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateSiteRequest {
    pub tenant_id: String,
    pub name: String,
}

fn site_response(site: &Site, public_url: &str) -> Value {
    json!({
        "id": site.id,
        "tenant_id": site.tenant_id,
        "name": site.name,
        "site_token": site.site_token,
        "custom_domain": site.custom_domain,
        "dns_verified": site.dns_verified,
        "enabled": site.enabled,
        "created_at": site.created_at,
        "pixel_url": format!("{}/t/pixel.js?token={}", public_url.trim_end_matches('/'), site.site_token),
        "snippet": install_snippet(&site.site_token, public_url),
    })
}

/// `POST /api/sites` — register a site and mint its token.
pub async fn create_site(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSiteRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.tenant_id.trim().is_empty() {
        return Err(AppError::BadRequest("tenant_id is required".to_string()));
    }
    if req.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".to_string()));
    }
    if req.name.len() > 100 {
        return Err(AppError::BadRequest(
            "name must be 100 characters or fewer".to_string(),
        ));
    }

    let site = state
        .db
        .create_site(CreateSiteParams {
            tenant_id: req.tenant_id.trim().to_string(),
            name: req.name.trim().to_string(),
        })
        .await
        .map_err(AppError::Internal)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": site_response(&site, &state.config.public_url) })),
    ))
}

/// `GET /api/sites/{site_id}`
pub async fn get_site(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let site = state
        .db
        .get_site(&site_id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound("Site not found".to_string()))?;
    Ok(Json(json!({ "data": site_response(&site, &state.config.public_url) })))
}
