use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

use opticdata_core::attribution::AttributionModel;
use opticdata_duckdb::attribution::EngineParams;

use crate::{error::AppError, state::AppState};

/// Parse an inclusive `YYYY-MM-DD` range into half-open UTC instants.
/// Defaults to the scheduler's window: the last 90 days.
pub(crate) fn parse_window(
    start_date: Option<&str>,
    end_date: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
    let parse = |raw: &str, field: &str| {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| AppError::BadRequest(format!("{field} must be YYYY-MM-DD")))
    };
    let (start, end) = match (start_date, end_date) {
        (Some(s), Some(e)) => {
            let start = parse(s, "start_date")?;
            let end = parse(e, "end_date")?;
            if end < start {
                return Err(AppError::BadRequest(
                    "end_date must be on or after start_date".to_string(),
                ));
            }
            (
                start.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc(),
                (end + Duration::days(1))
                    .and_hms_opt(0, 0, 0)
                    .unwrap_or_default()
                    .and_utc(),
            )
        }
        (None, None) => (now - Duration::days(90), now),
        _ => {
            return Err(AppError::BadRequest(
                "start_date and end_date must be provided together".to_string(),
            ))
        }
    };
    Ok((start, end))
}

pub(crate) fn parse_models(raw: Option<&[String]>) -> Result<Vec<AttributionModel>, AppError> {
    match raw {
        None => Ok(AttributionModel::ALL.to_vec()),
        Some(names) => {
            let mut models = Vec::with_capacity(names.len());
            for name in names {
                models.push(
                    AttributionModel::parse(name)
                        .map_err(|e| AppError::BadRequest(e.to_string()))?,
                );
            }
            if models.is_empty() {
                Ok(AttributionModel::ALL.to_vec())
            } else {
                Ok(models)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunAttributionRequest {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub models: Option<Vec<String>>,
    pub lookback_days: Option<u32>,
}

/// `POST /api/attribution/{tenant_id}/run` — the scheduler's unit of work,
/// exposed for operators and tests. Guarded by the same per-tenant lock.
pub async fn run_attribution(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Json(req): Json<RunAttributionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let (start, end) = parse_window(req.start_date.as_deref(), req.end_date.as_deref(), now)?;
    let models = parse_models(req.models.as_deref())?;
    let lookback_days = match req.lookback_days {
        Some(days) if !opticdata_core::config::Config::is_valid_lookback(days) => {
            return Err(AppError::BadRequest(format!(
                "lookback_days must be one of {:?} (0 = infinite)",
                opticdata_core::config::VALID_LOOKBACK_DAYS
            )))
        }
        Some(days) => days,
        None => {
            state
                .db
                .get_attribution_settings(&tenant_id)
                .await
                .map_err(AppError::Internal)?
                .default_lookback_days
        }
    };

    if !state.begin_tenant_run(&tenant_id).await {
        return Err(AppError::RunInFlight);
    }
    let params = EngineParams {
        start,
        end,
        models,
        lookback_days,
        batch_size: state.config.attribution_batch_size,
        epsilon_credit: state.config.epsilon_credit,
        epsilon_revenue: state.config.epsilon_revenue,
        half_life_days: state.config.half_life_days,
    };
    let result = state.db.run_attribution(&tenant_id, &params, now).await;
    state.finish_tenant_run(&tenant_id).await;

    let run = result.map_err(AppError::Internal)?;
    Ok(Json(json!({ "data": run })))
}

/// `GET /api/verification/{tenant_id}/status`
pub async fn verification_status(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let status = state
        .db
        .verification_status(
            &tenant_id,
            state.config.epsilon_credit,
            state.config.epsilon_revenue,
        )
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "data": status })))
}
