use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use opticdata_core::{attribution::AttributionModel, config::Config};
use opticdata_duckdb::site::{AccountingMode, AttributionSettings};

use crate::{error::AppError, state::AppState};

/// `GET /api/settings/{tenant_id}` — stored settings, or defaults.
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let settings = state
        .db
        .get_attribution_settings(&tenant_id)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "data": settings })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub default_lookback_days: u32,
    pub default_model: String,
    pub accounting_mode: Option<String>,
}

/// `PUT /api/settings/{tenant_id}`
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !Config::is_valid_lookback(req.default_lookback_days) {
        return Err(AppError::BadRequest(format!(
            "default_lookback_days must be one of {:?} (0 = infinite)",
            opticdata_core::config::VALID_LOOKBACK_DAYS
        )));
    }
    let default_model = AttributionModel::parse(&req.default_model)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let accounting_mode = match req.accounting_mode.as_deref() {
        Some(raw) => AccountingMode::parse(raw).map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => AccountingMode::Accrual,
    };

    let settings = AttributionSettings {
        tenant_id: tenant_id.clone(),
        default_lookback_days: req.default_lookback_days,
        default_model,
        accounting_mode,
    };
    state
        .db
        .upsert_attribution_settings(&settings)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "data": settings })))
}
