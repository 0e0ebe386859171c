/// DuckDB initialization SQL.
///
/// Executed once at database open time via `Connection::execute_batch`.
/// All statements use `IF NOT EXISTS` so they are safe to re-run on every
/// startup (idempotent).
///
/// `memory_limit` is passed at runtime from `Config.duckdb_memory_limit`
/// (env `OPTICDATA_DUCKDB_MEMORY`, default `"1GB"`).
///
/// Uniqueness that migrations must preserve:
///   - visitors (tenant_id, anonymous_id)
///   - sessions (tenant_id, session_id)
///   - events (tenant_id, event_id) when event_id is present
///   - attribution_results (touchpoint_id, order_id, model)
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- SITES
-- ===========================================
-- site_token is an opaque capability: knowing it is enough to post events.
CREATE TABLE IF NOT EXISTS sites (
    id                  VARCHAR PRIMARY KEY,        -- 'site_' + 10 alnum
    tenant_id           VARCHAR NOT NULL,
    name                VARCHAR NOT NULL,
    site_token          VARCHAR NOT NULL UNIQUE,    -- 'st_' + 24 alnum
    custom_domain       VARCHAR,
    dns_verified        BOOLEAN NOT NULL DEFAULT FALSE,
    dns_challenge_token VARCHAR,                    -- 64 hex chars (256-bit)
    dns_verified_at     TIMESTAMP,
    enabled             BOOLEAN NOT NULL DEFAULT TRUE,
    created_at          TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at          TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_sites_tenant        ON sites(tenant_id);
CREATE INDEX IF NOT EXISTS idx_sites_token         ON sites(site_token);
CREATE INDEX IF NOT EXISTS idx_sites_custom_domain ON sites(custom_domain);

-- ===========================================
-- VISITORS (identity graph)
-- ===========================================
-- canonical_id is NULL for canonical rows; merged rows point directly at
-- their canonical row (never at another merged row — no chains).
-- The effective id for joins is COALESCE(canonical_id, id).
CREATE TABLE IF NOT EXISTS visitors (
    id               VARCHAR PRIMARY KEY,           -- UUID v4
    tenant_id        VARCHAR NOT NULL,
    site_id          VARCHAR NOT NULL,
    anonymous_id     VARCHAR NOT NULL,
    email            VARCHAR,
    phone            VARCHAR,
    customer_id      VARCHAR,
    fingerprint      VARCHAR,
    canonical_id     VARCHAR,
    first_seen_at    TIMESTAMP NOT NULL,
    last_seen_at     TIMESTAMP NOT NULL,
    total_sessions   INTEGER NOT NULL DEFAULT 0,
    total_events     INTEGER NOT NULL DEFAULT 0,
    total_revenue    DOUBLE NOT NULL DEFAULT 0,
    first_order_date TIMESTAMP,
    merged_at        TIMESTAMP,
    UNIQUE (tenant_id, anonymous_id)
);
CREATE INDEX IF NOT EXISTS idx_visitors_tenant_email     ON visitors(tenant_id, email);
CREATE INDEX IF NOT EXISTS idx_visitors_tenant_phone     ON visitors(tenant_id, phone);
CREATE INDEX IF NOT EXISTS idx_visitors_tenant_customer  ON visitors(tenant_id, customer_id);
CREATE INDEX IF NOT EXISTS idx_visitors_tenant_fp        ON visitors(tenant_id, fingerprint);
CREATE INDEX IF NOT EXISTS idx_visitors_tenant_canonical ON visitors(tenant_id, canonical_id);

-- ===========================================
-- SESSIONS
-- ===========================================
-- session_id is the opaque client cookie value; the 30-min inactivity
-- boundary is enforced client-side by the pixel.
CREATE TABLE IF NOT EXISTS sessions (
    id             VARCHAR PRIMARY KEY,             -- UUID v4
    tenant_id      VARCHAR NOT NULL,
    session_id     VARCHAR NOT NULL,
    visitor_id     VARCHAR NOT NULL,
    referrer       VARCHAR,
    landing_page   VARCHAR,
    utm_source     VARCHAR,
    utm_medium     VARCHAR,
    utm_campaign   VARCHAR,
    utm_content    VARCHAR,
    utm_term       VARCHAR,
    fbclid         VARCHAR,
    gclid          VARCHAR,
    ttclid         VARCHAR,
    sclid          VARCHAR,
    msclkid        VARCHAR,
    device         VARCHAR,
    browser        VARCHAR,
    os             VARCHAR,
    screen         VARCHAR,                         -- e.g. '1920x1080'
    timezone       VARCHAR,
    language       VARCHAR,
    ip             VARCHAR,
    user_agent     VARCHAR,
    started_at     TIMESTAMP NOT NULL,
    last_activity  TIMESTAMP NOT NULL,
    page_count     INTEGER NOT NULL DEFAULT 0,
    event_count    INTEGER NOT NULL DEFAULT 0,
    has_conversion BOOLEAN NOT NULL DEFAULT FALSE,
    UNIQUE (tenant_id, session_id)
);
CREATE INDEX IF NOT EXISTS idx_sessions_tenant_visitor ON sessions(tenant_id, visitor_id, last_activity DESC);

-- ===========================================
-- TOUCHPOINTS (the unit of attribution credit)
-- ===========================================
-- Written only for tagged arrivals (click id or utm_source/utm_campaign);
-- direct/organic sessions never produce a row.
CREATE TABLE IF NOT EXISTS touchpoints (
    id           VARCHAR PRIMARY KEY,               -- UUID v4
    tenant_id    VARCHAR NOT NULL,
    visitor_id   VARCHAR NOT NULL,
    session_id   VARCHAR NOT NULL,
    platform     VARCHAR NOT NULL,                  -- meta|google|tiktok|snapchat|bing|newsbreak|referral|direct
    click_id     VARCHAR,
    utm_source   VARCHAR,
    utm_medium   VARCHAR,
    utm_campaign VARCHAR,
    utm_content  VARCHAR,
    utm_term     VARCHAR,
    referrer     VARCHAR,
    landing_page VARCHAR,
    touched_at   TIMESTAMP NOT NULL,                -- server-assigned at insert
    converted    BOOLEAN NOT NULL DEFAULT FALSE,
    order_id     VARCHAR,
    revenue      DOUBLE
);
CREATE INDEX IF NOT EXISTS idx_touchpoints_tenant_visitor ON touchpoints(tenant_id, visitor_id, touched_at);
CREATE INDEX IF NOT EXISTS idx_touchpoints_unconverted    ON touchpoints(tenant_id, visitor_id, converted, touched_at DESC);

-- ===========================================
-- EVENTS
-- ===========================================
CREATE TABLE IF NOT EXISTS events (
    id              VARCHAR PRIMARY KEY,            -- UUID v4
    tenant_id       VARCHAR NOT NULL,
    visitor_id      VARCHAR,
    session_id      VARCHAR NOT NULL,
    event_name      VARCHAR NOT NULL,
    event_category  VARCHAR,
    page_url        VARCHAR,
    page_title      VARCHAR,
    page_referrer   VARCHAR,
    order_id        VARCHAR,
    revenue         DOUBLE,
    currency        VARCHAR NOT NULL DEFAULT 'USD',
    product_ids     VARCHAR,                        -- JSON array string
    product_names   VARCHAR,                        -- JSON array string
    quantity        INTEGER,
    click_ids       VARCHAR,                        -- JSON object string
    properties      VARCHAR,                        -- JSON object string
    event_id        VARCHAR,                        -- client idempotency key
    client_ts       TIMESTAMP,
    is_new_customer BOOLEAN,
    created_at      TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_tenant_created  ON events(tenant_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_tenant_order    ON events(tenant_id, order_id);
CREATE INDEX IF NOT EXISTS idx_events_tenant_event_id ON events(tenant_id, event_id);
CREATE INDEX IF NOT EXISTS idx_events_tenant_visitor  ON events(tenant_id, visitor_id, created_at);

-- ===========================================
-- ATTRIBUTION RESULTS
-- ===========================================
CREATE TABLE IF NOT EXISTS attribution_results (
    id                 VARCHAR PRIMARY KEY,         -- UUID v4
    tenant_id          VARCHAR NOT NULL,
    visitor_id         VARCHAR NOT NULL,
    touchpoint_id      VARCHAR NOT NULL,
    order_id           VARCHAR NOT NULL,
    revenue            DOUBLE NOT NULL,
    model              VARCHAR NOT NULL,
    credit             DOUBLE NOT NULL,
    attributed_revenue DOUBLE NOT NULL,
    lookback_days      INTEGER NOT NULL,
    is_new_customer    BOOLEAN,
    credit_verified    BOOLEAN NOT NULL DEFAULT FALSE,
    computed_at        TIMESTAMP NOT NULL,
    UNIQUE (touchpoint_id, order_id, model)
);
CREATE INDEX IF NOT EXISTS idx_results_tenant_order    ON attribution_results(tenant_id, order_id, model);
CREATE INDEX IF NOT EXISTS idx_results_tenant_computed ON attribution_results(tenant_id, computed_at);

-- ===========================================
-- ATTRIBUTION SUMMARY (derived; always rebuildable from results)
-- ===========================================
CREATE TABLE IF NOT EXISTS attribution_summary (
    tenant_id               VARCHAR NOT NULL,
    summary_date            DATE NOT NULL,
    model                   VARCHAR NOT NULL,
    platform                VARCHAR NOT NULL,
    utm_source              VARCHAR,
    utm_medium              VARCHAR,
    utm_campaign            VARCHAR,
    utm_content             VARCHAR,
    attributed_conversions  DOUBLE NOT NULL,
    attributed_revenue      DOUBLE NOT NULL,
    touchpoints             BIGINT NOT NULL,
    unique_visitors         BIGINT NOT NULL,
    lookback_days           INTEGER NOT NULL,
    is_new_customer         BOOLEAN
);
CREATE INDEX IF NOT EXISTS idx_summary_tenant_date ON attribution_summary(tenant_id, summary_date, model);

-- ===========================================
-- VERIFICATION LOG (append-only audit)
-- ===========================================
CREATE TABLE IF NOT EXISTS verification_log (
    id              VARCHAR PRIMARY KEY,            -- UUID v4
    tenant_id       VARCHAR NOT NULL,
    order_id        VARCHAR NOT NULL,
    model           VARCHAR NOT NULL,
    actual_revenue  DOUBLE NOT NULL,
    total_credited  DOUBLE NOT NULL,
    credit_sum      DOUBLE NOT NULL,
    was_normalized  BOOLEAN NOT NULL,
    verified_at     TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_verification_tenant ON verification_log(tenant_id, verified_at DESC);

-- ===========================================
-- IDENTITY MERGES (append-only audit)
-- ===========================================
CREATE TABLE IF NOT EXISTS identity_merges (
    id                VARCHAR PRIMARY KEY,          -- UUID v4
    tenant_id         VARCHAR NOT NULL,
    source_visitor_id VARCHAR NOT NULL,
    target_visitor_id VARCHAR NOT NULL,
    merge_reason      VARCHAR NOT NULL,             -- email_match|phone_match|customer_id_match|identifier_match
    merged_at         TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_merges_tenant ON identity_merges(tenant_id, merged_at DESC);

-- ===========================================
-- ATTRIBUTION SETTINGS (per tenant)
-- ===========================================
CREATE TABLE IF NOT EXISTS attribution_settings (
    tenant_id             VARCHAR PRIMARY KEY,
    default_lookback_days INTEGER NOT NULL DEFAULT 30,
    default_model         VARCHAR NOT NULL DEFAULT 'last_click',
    accounting_mode       VARCHAR NOT NULL DEFAULT 'accrual',
    updated_at            TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- ===========================================
-- PLATFORM SPEND (fed by external syncers; empty by default)
-- ===========================================
CREATE TABLE IF NOT EXISTS platform_spend (
    tenant_id  VARCHAR NOT NULL,
    platform   VARCHAR NOT NULL,
    spend_date DATE NOT NULL,
    amount     DOUBLE NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spend_tenant ON platform_spend(tenant_id, platform, spend_date);
"#
    )
}
