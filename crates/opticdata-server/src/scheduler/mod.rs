//! Daily attribution scheduler.
//!
//! One slot per UTC day at the configured hour. Each tick checks whether
//! today's slot is due; a completed slot is not repeated until the next
//! day. Failures are isolated at every level: a failed window does not
//! abort its tenant, a failed tenant does not abort the sweep.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use tracing::{error, info, warn};

use opticdata_duckdb::attribution::EngineParams;

use crate::state::AppState;

/// Run the attribution sweep for every tenant. Returns the number of
/// completed (tenant, window) runs.
pub async fn process_once(state: &Arc<AppState>, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let tenants = state.db.list_tenants().await?;
    let mut runs = 0usize;

    for tenant_id in tenants {
        // The engine is single-threaded per tenant; an in-flight manual
        // run wins and this slot skips the tenant.
        if !state.begin_tenant_run(&tenant_id).await {
            warn!(tenant_id, "attribution already in flight, skipping tenant");
            continue;
        }
        let result = run_tenant(state, &tenant_id, now).await;
        state.finish_tenant_run(&tenant_id).await;
        match result {
            Ok(n) => runs += n,
            Err(e) => error!(tenant_id, error = %e, "tenant attribution sweep failed"),
        }
    }
    Ok(runs)
}

/// Compute all windows for one tenant: the standard set merged with the
/// tenant's configured default lookback.
async fn run_tenant(
    state: &Arc<AppState>,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let settings = state.db.get_attribution_settings(tenant_id).await?;
    let mut windows: BTreeSet<u32> = state.config.lookback_days.iter().copied().collect();
    windows.insert(settings.default_lookback_days);

    let start = now - Duration::days(90);
    let mut runs = 0usize;
    for lookback_days in windows {
        let params = EngineParams {
            start,
            end: now,
            models: opticdata_core::attribution::AttributionModel::ALL.to_vec(),
            lookback_days,
            batch_size: state.config.attribution_batch_size,
            epsilon_credit: state.config.epsilon_credit,
            epsilon_revenue: state.config.epsilon_revenue,
            half_life_days: state.config.half_life_days,
        };
        match state.db.run_attribution(tenant_id, &params, now).await {
            Ok(run) => {
                runs += 1;
                info!(
                    tenant_id,
                    lookback_days,
                    orders = run.orders_seen,
                    results = run.results_written,
                    "window computed"
                );
            }
            // Per-(tenant, window) isolation: the next window still runs.
            Err(e) => error!(tenant_id, lookback_days, error = %e, "window failed"),
        }
    }
    Ok(runs)
}

/// Background loop driving the daily slot. Spawned from `main.rs`; runs
/// until the process exits.
pub async fn run_scheduler_loop(state: Arc<AppState>) {
    let tick = state.config.scheduler_tick();
    let hour = state.config.scheduler_hour_utc;
    info!(
        tick_seconds = tick.as_secs(),
        hour_utc = hour,
        "attribution scheduler started"
    );

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_run: Option<NaiveDate> = None;

    loop {
        interval.tick().await;
        let now = Utc::now();
        if now.hour() < hour {
            continue;
        }
        if last_run == Some(now.date_naive()) {
            continue;
        }
        match process_once(&state, now).await {
            Ok(runs) => {
                last_run = Some(now.date_naive());
                info!(runs, "daily attribution sweep complete");
            }
            Err(e) => error!(error = %e, "attribution sweep failed, will retry next tick"),
        }
    }
}
