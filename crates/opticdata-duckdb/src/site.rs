use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use opticdata_core::attribution::AttributionModel;
use opticdata_core::config::Config;

use crate::backend::fmt_ts;
use crate::DuckDbBackend;

#[derive(Debug, Clone, Serialize)]
pub struct Site {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub site_token: String,
    pub custom_domain: Option<String>,
    pub dns_verified: bool,
    pub dns_challenge_token: Option<String>,
    pub dns_verified_at: Option<String>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct CreateSiteParams {
    pub tenant_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttributionSettings {
    pub tenant_id: String,
    pub default_lookback_days: u32,
    pub default_model: AttributionModel,
    pub accounting_mode: AccountingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountingMode {
    Accrual,
    Cash,
}

impl AccountingMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "accrual" => Ok(Self::Accrual),
            "cash" => Ok(Self::Cash),
            other => Err(anyhow!("invalid accounting_mode: {other}")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accrual => "accrual",
            Self::Cash => "cash",
        }
    }
}

fn random_alnum(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..36);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

/// Generate a site ID: "site_" + 10 random alphanumeric chars.
fn generate_site_id() -> String {
    format!("site_{}", random_alnum(10))
}

/// Generate a site token: "st_" + 24 random alphanumeric chars. The token
/// is a capability — globally unique and unguessable enough to gate event
/// ingestion on its own.
fn generate_site_token() -> String {
    format!("st_{}", random_alnum(24))
}

const SITE_COLUMNS: &str = "id, tenant_id, name, site_token, custom_domain, dns_verified, \
     dns_challenge_token, CAST(dns_verified_at AS VARCHAR), enabled, \
     CAST(created_at AS VARCHAR), CAST(updated_at AS VARCHAR)";

fn site_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        site_token: row.get(3)?,
        custom_domain: row.get(4)?,
        dns_verified: row.get(5)?,
        dns_challenge_token: row.get(6)?,
        dns_verified_at: row.get(7)?,
        enabled: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl DuckDbBackend {
    pub async fn create_site(&self, params: CreateSiteParams) -> Result<Site> {
        let conn = self.conn.lock().await;
        let id = generate_site_id();
        let token = generate_site_token();

        conn.execute(
            "INSERT INTO sites (id, tenant_id, name, site_token) VALUES (?1, ?2, ?3, ?4)",
            duckdb::params![id, params.tenant_id, params.name, token],
        )?;

        let mut stmt = conn.prepare(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"))?;
        let site = stmt.query_row(duckdb::params![id], site_from_row)?;
        Ok(site)
    }

    pub async fn get_site(&self, site_id: &str) -> Result<Option<Site>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"))?;
        let site = stmt.query_row(duckdb::params![site_id], site_from_row);
        match site {
            Ok(site) => Ok(Some(site)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a site by its token. The primary lookup on the tracking path;
    /// results are cached for ≤60 s by the server layer.
    pub async fn get_site_by_token(&self, token: &str) -> Result<Option<Site>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE site_token = ?1 AND enabled"
        ))?;
        match stmt.query_row(duckdb::params![token], site_from_row) {
            Ok(site) => Ok(Some(site)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fallback resolution for first-party serving: a verified, enabled
    /// custom domain uniquely names its site.
    pub async fn get_site_by_custom_domain(&self, domain: &str) -> Result<Option<Site>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SITE_COLUMNS} FROM sites \
             WHERE lower(custom_domain) = lower(?1) AND dns_verified AND enabled"
        ))?;
        match stmt.query_row(duckdb::params![domain], site_from_row) {
            Ok(site) => Ok(Some(site)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a freshly generated challenge. Resets any prior verification —
    /// changing the domain invalidates the old proof.
    pub async fn set_dns_challenge(&self, site_id: &str, domain: &str, token: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE sites SET custom_domain = ?2, dns_challenge_token = ?3, \
             dns_verified = FALSE, dns_verified_at = NULL, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?1",
            duckdb::params![site_id, domain, token],
        )?;
        if updated == 0 {
            return Err(anyhow!("site not found: {site_id}"));
        }
        Ok(())
    }

    pub async fn mark_dns_verified(&self, site_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sites SET dns_verified = TRUE, dns_verified_at = ?2, \
             updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
            duckdb::params![site_id, fmt_ts(now)],
        )?;
        Ok(())
    }

    /// Tenants with at least one site; the scheduler's work list.
    pub async fn list_tenants(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT DISTINCT tenant_id FROM sites ORDER BY tenant_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tenants = Vec::new();
        for row in rows {
            tenants.push(row?);
        }
        Ok(tenants)
    }

    /// Read tenant settings, falling back to defaults when the tenant has
    /// never saved any.
    pub async fn get_attribution_settings(&self, tenant_id: &str) -> Result<AttributionSettings> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT default_lookback_days, default_model, accounting_mode \
             FROM attribution_settings WHERE tenant_id = ?1",
        )?;
        let row = stmt.query_row(duckdb::params![tenant_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        });
        match row {
            Ok((lookback, model, mode)) => Ok(AttributionSettings {
                tenant_id: tenant_id.to_string(),
                default_lookback_days: lookback as u32,
                default_model: AttributionModel::parse(&model)?,
                accounting_mode: AccountingMode::parse(&mode)?,
            }),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(AttributionSettings {
                tenant_id: tenant_id.to_string(),
                default_lookback_days: 30,
                default_model: AttributionModel::LastClick,
                accounting_mode: AccountingMode::Accrual,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn upsert_attribution_settings(&self, settings: &AttributionSettings) -> Result<()> {
        if !Config::is_valid_lookback(settings.default_lookback_days) {
            return Err(anyhow!(
                "invalid lookback window: {} days",
                settings.default_lookback_days
            ));
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO attribution_settings \
             (tenant_id, default_lookback_days, default_model, accounting_mode, updated_at) \
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP) \
             ON CONFLICT (tenant_id) DO UPDATE SET \
             default_lookback_days = excluded.default_lookback_days, \
             default_model = excluded.default_model, \
             accounting_mode = excluded.accounting_mode, \
             updated_at = CURRENT_TIMESTAMP",
            duckdb::params![
                settings.tenant_id,
                settings.default_lookback_days as i64,
                settings.default_model.as_str(),
                settings.accounting_mode.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Seed daily spend for a platform. Fed by external syncers in
    /// production; exposed for tests and manual imports.
    pub async fn seed_platform_spend(
        &self,
        tenant_id: &str,
        platform: &str,
        spend_date: &str,
        amount: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO platform_spend (tenant_id, platform, spend_date, amount) \
             VALUES (?1, ?2, ?3, ?4)",
            duckdb::params![tenant_id, platform, spend_date, amount],
        )?;
        Ok(())
    }
}
