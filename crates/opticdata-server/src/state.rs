use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;

use opticdata_core::{config::Config, dns::DnsResolver};
use opticdata_duckdb::{site::Site, DuckDbBackend};

/// Site-token lookups are read-only and safe to cache briefly.
const SITE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    pub db: Arc<DuckDbBackend>,

    /// Parsed configuration, loaded once at startup from environment
    /// variables.
    pub config: Arc<Config>,

    /// DNS lookups for custom-domain verification. Tests inject a
    /// fixed-answer resolver here.
    pub dns: Arc<dyn DnsResolver>,

    /// In-process cache of token → site, entries valid for ≤60 s.
    /// Negative results are cached too so a bad token cannot hammer the DB.
    site_cache: Mutex<HashMap<String, (Instant, Option<Site>)>>,

    /// Tenants with an attribution run in flight. Guards against
    /// overlapping scheduler ticks; the engine is single-threaded per
    /// tenant.
    tenants_running: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(db: DuckDbBackend, config: Config, dns: Arc<dyn DnsResolver>) -> Self {
        Self {
            db: Arc::new(db),
            config: Arc::new(config),
            dns,
            site_cache: Mutex::new(HashMap::new()),
            tenants_running: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve a site by token through the 60-second cache.
    pub async fn site_by_token_cached(&self, token: &str) -> Result<Option<Site>> {
        {
            let cache = self.site_cache.lock().await;
            if let Some((at, site)) = cache.get(token) {
                if at.elapsed() < SITE_CACHE_TTL {
                    return Ok(site.clone());
                }
            }
        }

        let site = self.db.get_site_by_token(token).await?;
        let mut cache = self.site_cache.lock().await;
        cache.insert(token.to_string(), (Instant::now(), site.clone()));
        Ok(site)
    }

    /// Resolve a site for the tracking surface: token first, then the
    /// sanitised Host header against verified custom domains.
    pub async fn resolve_site(
        &self,
        token: Option<&str>,
        host: Option<&str>,
    ) -> Result<Option<Site>> {
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(site) = self.site_by_token_cached(token).await? {
                return Ok(Some(site));
            }
        }
        if let Some(host) = host {
            // Drop the port before matching against the stored domain.
            let domain = host.split(':').next().unwrap_or(host);
            if !domain.is_empty() {
                return self.db.get_site_by_custom_domain(domain).await;
            }
        }
        Ok(None)
    }

    /// Claim the per-tenant attribution lock. Returns false when a run is
    /// already in flight for the tenant.
    pub async fn begin_tenant_run(&self, tenant_id: &str) -> bool {
        let mut running = self.tenants_running.lock().await;
        running.insert(tenant_id.to_string())
    }

    pub async fn finish_tenant_run(&self, tenant_id: &str) {
        let mut running = self.tenants_running.lock().await;
        running.remove(tenant_id);
    }
}
