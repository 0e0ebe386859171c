//! Custom-domain challenge lifecycle.
//!
//! `generate` stores a fresh challenge and returns the records to publish;
//! `verify` resolves them and flips the site to verified on success.
//! Verification is idempotent — a failed attempt changes nothing and the
//! caller may retry after fixing their zone.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use opticdata_core::dns::{
    challenge_records, generate_challenge_token, validate_domain, verify_challenge,
};

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct GenerateChallengeRequest {
    pub domain: String,
}

/// `POST /api/sites/{site_id}/domain` — validate the domain, mint a
/// challenge token, and return the A + TXT records to publish.
pub async fn generate_challenge(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    Json(req): Json<GenerateChallengeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let site = state
        .db
        .get_site(&site_id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound("Site not found".to_string()))?;

    let domain = req.domain.trim().trim_end_matches('.').to_lowercase();
    validate_domain(&domain).map_err(|e| AppError::BadDomain(e.to_string()))?;

    let token = generate_challenge_token();
    state
        .db
        .set_dns_challenge(&site.id, &domain, &token)
        .await
        .map_err(AppError::Internal)?;

    let records = challenge_records(&domain, &state.config.pixel_server_ip, &token);
    Ok(Json(json!({ "domain": domain, "records": records })))
}

/// `POST /api/sites/{site_id}/domain/verify` — resolve both records and
/// compare. Failure is data (`verified: false` plus the error list), not
/// an HTTP error; ingestion is never affected either way.
pub async fn verify_domain(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let site = state
        .db
        .get_site(&site_id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound("Site not found".to_string()))?;

    let (Some(domain), Some(token)) = (site.custom_domain, site.dns_challenge_token) else {
        return Err(AppError::NoChallenge);
    };

    let outcome = verify_challenge(
        state.dns.as_ref(),
        &domain,
        &state.config.pixel_server_ip,
        &token,
    )
    .await;

    if outcome.verified {
        let now = Utc::now();
        state
            .db
            .mark_dns_verified(&site.id, now)
            .await
            .map_err(AppError::Internal)?;
        return Ok(Json(json!({
            "verified": true,
            "verified_at": now.to_rfc3339(),
            "errors": []
        })));
    }

    Ok(Json(json!({
        "verified": false,
        "errors": outcome.errors
    })))
}
