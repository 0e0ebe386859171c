use std::time::Duration;

use crate::attribution::AttributionModel;

/// Lookback windows (days) a tenant may configure. 0 means infinite.
pub const VALID_LOOKBACK_DAYS: &[u32] = &[7, 14, 30, 60, 90, 180, 365, 0];

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    /// Public IP of the pixel server; the A record custom domains must point at.
    pub pixel_server_ip: String,
    /// Base URL events are posted to when no verified custom domain exists.
    pub public_url: String,
    /// UTC hour (0-23) at which the daily attribution run starts.
    pub scheduler_hour_utc: u32,
    /// How often the scheduler checks whether the daily slot is due.
    pub scheduler_tick_seconds: u64,
    /// Tolerance for per-order credit sums (invariant: Σ credit = 1 ± ε).
    pub epsilon_credit: f64,
    /// Tolerance for attributed-revenue sums, in the order's currency.
    pub epsilon_revenue: f64,
    /// Time-decay half-life in days.
    pub half_life_days: f64,
    /// Lookback windows every tenant is computed for, merged with the
    /// tenant-configured default at schedule time.
    pub lookback_days: Vec<u32>,
    pub default_model: AttributionModel,
    /// Orders per attribution batch.
    pub attribution_batch_size: usize,
    /// DuckDB memory limit passed to `SET memory_limit = '...'` at init.
    /// Accepts any DuckDB size string: `"512MB"`, `"1GB"`, `"4GB"`, etc.
    pub duckdb_memory_limit: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            port: std::env::var("OPTICDATA_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| format!("invalid port: {e}"))?,
            data_dir: std::env::var("OPTICDATA_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            pixel_server_ip: std::env::var("OPTICDATA_PIXEL_SERVER_IP")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            public_url: std::env::var("OPTICDATA_PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            scheduler_hour_utc: std::env::var("OPTICDATA_SCHEDULER_HOUR_UTC")
                .unwrap_or_else(|_| "3".to_string())
                .parse::<u32>()
                .map(|v| v.min(23))
                .unwrap_or(3),
            scheduler_tick_seconds: std::env::var("OPTICDATA_SCHEDULER_TICK_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|v| v.clamp(10, 3600))
                .unwrap_or(60),
            epsilon_credit: std::env::var("OPTICDATA_EPSILON_CREDIT")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(1e-4),
            epsilon_revenue: std::env::var("OPTICDATA_EPSILON_REVENUE")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.01),
            half_life_days: std::env::var("OPTICDATA_HALF_LIFE_DAYS")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v > 0.0)
                .unwrap_or(7.0),
            lookback_days: std::env::var("OPTICDATA_LOOKBACK_DAYS")
                .map(|raw| {
                    raw.split(',')
                        .filter_map(|v| v.trim().parse::<u32>().ok())
                        .filter(|v| VALID_LOOKBACK_DAYS.contains(v))
                        .collect::<Vec<_>>()
                })
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| vec![7, 14, 30]),
            default_model: std::env::var("OPTICDATA_DEFAULT_MODEL")
                .ok()
                .as_deref()
                .map(AttributionModel::parse)
                .transpose()
                .map_err(|e| e.to_string())?
                .unwrap_or(AttributionModel::LastClick),
            attribution_batch_size: std::env::var("OPTICDATA_ATTRIBUTION_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(500),
            duckdb_memory_limit: std::env::var("OPTICDATA_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
        })
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_seconds)
    }

    /// True when `days` is an accepted lookback window (0 = infinite).
    pub fn is_valid_lookback(days: u32) -> bool {
        VALID_LOOKBACK_DAYS.contains(&days)
    }
}
