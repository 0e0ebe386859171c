use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use opticdata_core::attribution::AttributionModel;
use opticdata_duckdb::reporting::ReportGroupBy;

use crate::routes::attribution::{parse_models, parse_window};
use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub model: Option<String>,
    /// Comma-separated list, compare endpoint only.
    pub models: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub lookback_days: Option<u32>,
    pub group_by: Option<String>,
    pub limit: Option<usize>,
}

struct ResolvedQuery {
    model: AttributionModel,
    start: chrono::DateTime<Utc>,
    end: chrono::DateTime<Utc>,
    lookback_days: u32,
    group_by: ReportGroupBy,
}

async fn resolve_query(
    state: &AppState,
    tenant_id: &str,
    query: &ReportQuery,
) -> Result<ResolvedQuery, AppError> {
    let settings = state
        .db
        .get_attribution_settings(tenant_id)
        .await
        .map_err(AppError::Internal)?;
    let model = match query.model.as_deref() {
        Some(raw) => {
            AttributionModel::parse(raw).map_err(|e| AppError::BadRequest(e.to_string()))?
        }
        None => settings.default_model,
    };
    let (start, end) = parse_window(
        query.start_date.as_deref(),
        query.end_date.as_deref(),
        Utc::now(),
    )?;
    let group_by = match query.group_by.as_deref() {
        Some(raw) => ReportGroupBy::parse(raw).map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => ReportGroupBy::Platform,
    };
    Ok(ResolvedQuery {
        model,
        start,
        end,
        lookback_days: query.lookback_days.unwrap_or(settings.default_lookback_days),
        group_by,
    })
}

/// `GET /api/reports/{tenant_id}/attribution`
pub async fn attribution_report(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, AppError> {
    let q = resolve_query(&state, &tenant_id, &query).await?;
    let report = state
        .db
        .attribution_report(&tenant_id, q.model, q.start, q.end, q.lookback_days, q.group_by)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "data": report })))
}

/// `GET /api/reports/{tenant_id}/compare` — one report per model.
pub async fn compare_models(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, AppError> {
    let q = resolve_query(&state, &tenant_id, &query).await?;
    let names: Option<Vec<String>> = query
        .models
        .as_deref()
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect());
    let models = parse_models(names.as_deref())?;
    let reports = state
        .db
        .compare_models(&tenant_id, &models, q.start, q.end, q.lookback_days, q.group_by)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "data": reports })))
}

/// `GET /api/reports/{tenant_id}/journey`
pub async fn journey_analysis(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, AppError> {
    let q = resolve_query(&state, &tenant_id, &query).await?;
    let journey = state
        .db
        .journey_analysis(&tenant_id, q.model, q.start, q.end, q.lookback_days)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "data": journey })))
}

/// `GET /api/reports/{tenant_id}/paths` — top conversion paths.
pub async fn conversion_paths(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<impl IntoResponse, AppError> {
    let q = resolve_query(&state, &tenant_id, &query).await?;
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    let paths = state
        .db
        .conversion_paths(&tenant_id, q.model, q.start, q.end, q.lookback_days, limit)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "data": paths })))
}
