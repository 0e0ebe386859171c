//! Identity graph: visitor resolution, merges, sessions, touchpoints,
//! events.
//!
//! The merge step re-points every dependent row inside one transaction per
//! merged candidate, so invariant "no canonical chains" holds even when a
//! merge is interrupted. The tie-break is always the row being resolved in
//! the active request: the caller has the freshest signal.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use duckdb::Connection;
use tracing::warn;
use uuid::Uuid;

use opticdata_core::event::{
    parse_money, parse_quantity, parse_string_list, SessionAttrs, TrackedEvent,
};
use opticdata_core::platform::{derive_platform, ClickIds};

use crate::backend::fmt_ts;
use crate::classify::classify_customer_sync;
use crate::DuckDbBackend;

/// Known identifiers arriving with a hit or an identify call.
#[derive(Debug, Clone, Default)]
pub struct VisitorIdentifiers {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub customer_id: Option<String>,
    pub fingerprint: Option<String>,
}

impl VisitorIdentifiers {
    /// Trim everything and lowercase email so equality is plain `=` in SQL.
    fn normalized(&self) -> Self {
        fn clean(v: &Option<String>) -> Option<String> {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        }
        Self {
            email: clean(&self.email).map(|e| e.to_lowercase()),
            phone: clean(&self.phone),
            customer_id: clean(&self.customer_id),
            fingerprint: clean(&self.fingerprint),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionUpsert {
    pub is_new: bool,
    /// Set when the new session was a tagged arrival and produced a
    /// touchpoint.
    pub touchpoint_id: Option<String>,
}

/// A fully parsed event ready for storage.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub name: String,
    pub category: Option<String>,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub page_referrer: Option<String>,
    pub order_id: Option<String>,
    pub revenue: Option<f64>,
    pub currency: String,
    pub product_ids: Vec<String>,
    pub product_names: Vec<String>,
    pub quantity: Option<i64>,
    pub click_ids_json: Option<String>,
    pub properties_json: Option<String>,
    pub event_id: Option<String>,
    pub client_ts: Option<DateTime<Utc>>,
}

impl NewEvent {
    /// Decode a wire event. `rev` and `qty` arrive as number-or-string and
    /// are parsed defensively; unparseable values become NULL, never errors.
    pub fn from_wire(evt: &TrackedEvent, click_ids_json: Option<String>) -> Self {
        Self {
            name: evt.n.clone(),
            category: evt.c.clone(),
            page_url: evt.u.clone(),
            page_title: evt.t.clone(),
            page_referrer: evt.r.clone(),
            order_id: evt
                .oid
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            revenue: parse_money(evt.rev.as_ref()),
            currency: evt
                .cur
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("USD")
                .to_uppercase(),
            product_ids: parse_string_list(evt.pids.as_ref()),
            product_names: parse_string_list(evt.pnames.as_ref()),
            quantity: parse_quantity(evt.qty.as_ref()),
            click_ids_json,
            properties_json: evt.p.as_ref().map(|v| v.to_string()),
            event_id: evt.eid.clone(),
            client_ts: evt
                .ts
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        }
    }

    pub fn is_purchase(&self) -> bool {
        self.name == "Purchase"
    }
}

#[derive(Debug, Clone)]
pub struct EventOutcome {
    /// False when the idempotency key had already been seen.
    pub inserted: bool,
    pub is_new_customer: Option<bool>,
}

fn merge_reason(
    current: (&Option<String>, &Option<String>, &Option<String>),
    candidate: (&Option<String>, &Option<String>, &Option<String>),
) -> &'static str {
    let same = |a: &Option<String>, b: &Option<String>| match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    if same(current.0, candidate.0) {
        "email_match"
    } else if same(current.1, candidate.1) {
        "phone_match"
    } else if same(current.2, candidate.2) {
        "customer_id_match"
    } else {
        "identifier_match"
    }
}

#[derive(Debug)]
struct MergeCandidate {
    id: String,
    email: Option<String>,
    phone: Option<String>,
    customer_id: Option<String>,
    fingerprint: Option<String>,
    total_sessions: i64,
    total_events: i64,
    total_revenue: f64,
    first_seen_at: String,
    first_order_date: Option<String>,
}

/// Merge every canonical visitor sharing an identifier with `current_id`
/// into `current_id`. Each candidate is handled in its own transaction; a
/// failed candidate is logged and skipped without touching the others.
fn attempt_merge_sync(
    conn: &mut Connection,
    tenant_id: &str,
    current_id: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let (email, phone, customer_id): (Option<String>, Option<String>, Option<String>) = {
        let mut stmt =
            conn.prepare("SELECT email, phone, customer_id FROM visitors WHERE id = ?1")?;
        stmt.query_row(duckdb::params![current_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
    };
    if email.is_none() && phone.is_none() && customer_id.is_none() {
        return Ok(0);
    }

    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = vec![
        Box::new(tenant_id.to_string()),
        Box::new(current_id.to_string()),
    ];
    let mut idx = 3;
    for (column, value) in [
        ("email", &email),
        ("phone", &phone),
        ("customer_id", &customer_id),
    ] {
        if let Some(value) = value {
            clauses.push(format!("{column} = ?{idx}"));
            params.push(Box::new(value.clone()));
            idx += 1;
        }
    }

    let sql = format!(
        "SELECT id, email, phone, customer_id, fingerprint, \
                total_sessions, total_events, total_revenue, \
                CAST(first_seen_at AS VARCHAR), CAST(first_order_date AS VARCHAR) \
         FROM visitors \
         WHERE tenant_id = ?1 AND canonical_id IS NULL AND id <> ?2 AND ({})",
        clauses.join(" OR ")
    );

    let candidates: Vec<MergeCandidate> = {
        let param_refs: Vec<&dyn duckdb::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(MergeCandidate {
                id: row.get(0)?,
                email: row.get(1)?,
                phone: row.get(2)?,
                customer_id: row.get(3)?,
                fingerprint: row.get(4)?,
                total_sessions: row.get(5)?,
                total_events: row.get(6)?,
                total_revenue: row.get(7)?,
                first_seen_at: row.get(8)?,
                first_order_date: row.get(9)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out
    };

    let now_str = fmt_ts(now);
    let mut merged = 0usize;
    for candidate in candidates {
        let reason = merge_reason(
            (&email, &phone, &customer_id),
            (&candidate.email, &candidate.phone, &candidate.customer_id),
        );
        match merge_one_candidate(conn, tenant_id, current_id, &candidate, reason, &now_str) {
            Ok(()) => merged += 1,
            Err(e) => {
                // IdentityMergeConflict disposition: log, skip, keep the
                // resolve result untouched.
                warn!(
                    tenant_id,
                    current = current_id,
                    candidate = %candidate.id,
                    error = %e,
                    "identity merge skipped"
                );
            }
        }
    }
    Ok(merged)
}

fn merge_one_candidate(
    conn: &mut Connection,
    tenant_id: &str,
    current_id: &str,
    candidate: &MergeCandidate,
    reason: &str,
    now_str: &str,
) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute(
        "UPDATE visitors SET canonical_id = ?2, merged_at = ?3 WHERE id = ?1",
        duckdb::params![candidate.id, current_id, now_str],
    )?;
    // Re-point rows that already pointed at the candidate, preserving
    // "no chains": every canonical_id keeps referencing a canonical row.
    tx.execute(
        "UPDATE visitors SET canonical_id = ?3 WHERE tenant_id = ?1 AND canonical_id = ?2",
        duckdb::params![tenant_id, candidate.id, current_id],
    )?;
    tx.execute(
        "UPDATE sessions SET visitor_id = ?3 WHERE tenant_id = ?1 AND visitor_id = ?2",
        duckdb::params![tenant_id, candidate.id, current_id],
    )?;
    tx.execute(
        "UPDATE touchpoints SET visitor_id = ?3 WHERE tenant_id = ?1 AND visitor_id = ?2",
        duckdb::params![tenant_id, candidate.id, current_id],
    )?;

    tx.execute(
        "UPDATE visitors SET \
            total_sessions = total_sessions + ?2, \
            total_events = total_events + ?3, \
            total_revenue = total_revenue + ?4, \
            first_seen_at = LEAST(first_seen_at, ?5), \
            email = COALESCE(email, ?6), \
            phone = COALESCE(phone, ?7), \
            customer_id = COALESCE(customer_id, ?8), \
            fingerprint = COALESCE(fingerprint, ?9) \
         WHERE id = ?1",
        duckdb::params![
            current_id,
            candidate.total_sessions,
            candidate.total_events,
            candidate.total_revenue,
            candidate.first_seen_at,
            candidate.email,
            candidate.phone,
            candidate.customer_id,
            candidate.fingerprint,
        ],
    )?;
    if let Some(ref first_order) = candidate.first_order_date {
        tx.execute(
            "UPDATE visitors SET first_order_date = CASE \
                WHEN first_order_date IS NULL OR first_order_date > ?2 THEN ?2 \
                ELSE first_order_date END \
             WHERE id = ?1",
            duckdb::params![current_id, first_order],
        )?;
    }
    // Counters have moved to the canonical row; zero them on the merged
    // row so a re-run can never double-accumulate.
    tx.execute(
        "UPDATE visitors SET total_sessions = 0, total_events = 0, total_revenue = 0 \
         WHERE id = ?1",
        duckdb::params![candidate.id],
    )?;

    tx.execute(
        "INSERT INTO identity_merges \
            (id, tenant_id, source_visitor_id, target_visitor_id, merge_reason, merged_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        duckdb::params![
            Uuid::new_v4().to_string(),
            tenant_id,
            candidate.id,
            current_id,
            reason,
            now_str
        ],
    )?;

    tx.commit()?;
    Ok(())
}

fn parse_screen_dim(value: Option<&serde_json::Value>) -> Option<u32> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64().map(|v| v as u32),
        serde_json::Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

impl DuckDbBackend {
    /// Resolve an anonymous id to a canonical visitor id, creating or
    /// merging rows as needed. Returns the effective visitor id every
    /// dependent row should reference.
    pub async fn resolve_visitor(
        &self,
        tenant_id: &str,
        site_id: &str,
        anonymous_id: &str,
        identifiers: &VisitorIdentifiers,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let idents = identifiers.normalized();
        let mut guard = self.conn.lock().await;
        let conn = &mut *guard;
        let now_str = fmt_ts(now);

        // 1. Known anonymous id. A merged row redirects through its
        //    canonical pointer; identifier fills land on the canonical row.
        let existing: Option<(String, Option<String>, Option<String>, Option<String>, Option<String>)> = {
            let mut stmt = conn.prepare(
                "SELECT id, canonical_id, email, phone, customer_id \
                 FROM visitors WHERE tenant_id = ?1 AND anonymous_id = ?2",
            )?;
            match stmt.query_row(duckdb::params![tenant_id, anonymous_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            }) {
                Ok(row) => Some(row),
                Err(duckdb::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };

        if let Some((id, canonical_id, email, phone, customer_id)) = existing {
            let target = canonical_id.unwrap_or(id);
            conn.execute(
                "UPDATE visitors SET last_seen_at = ?2, \
                    email = COALESCE(email, ?3), \
                    phone = COALESCE(phone, ?4), \
                    customer_id = COALESCE(customer_id, ?5), \
                    fingerprint = COALESCE(fingerprint, ?6) \
                 WHERE id = ?1",
                duckdb::params![
                    target,
                    now_str,
                    idents.email,
                    idents.phone,
                    idents.customer_id,
                    idents.fingerprint
                ],
            )?;

            let gained_identity = (idents.email.is_some() && email.is_none())
                || (idents.phone.is_some() && phone.is_none())
                || (idents.customer_id.is_some() && customer_id.is_none());
            if gained_identity {
                attempt_merge_sync(conn, tenant_id, &target, now)?;
            }
            return Ok(target);
        }

        // 2. Unknown anonymous id: search canonical rows by identifier, in
        //    priority order. A hit means this is a known person on a new
        //    device/cookie — record the alias row and the merge.
        for (column, value) in [
            ("email", &idents.email),
            ("phone", &idents.phone),
            ("customer_id", &idents.customer_id),
            ("fingerprint", &idents.fingerprint),
        ] {
            let Some(value) = value else { continue };
            let sql = format!(
                "SELECT id FROM visitors \
                 WHERE tenant_id = ?1 AND canonical_id IS NULL AND {column} = ?2 \
                 ORDER BY first_seen_at ASC LIMIT 1"
            );
            let found: Option<String> = {
                let mut stmt = conn.prepare(&sql)?;
                match stmt.query_row(duckdb::params![tenant_id, value], |row| row.get(0)) {
                    Ok(id) => Some(id),
                    Err(duckdb::Error::QueryReturnedNoRows) => None,
                    Err(e) => return Err(e.into()),
                }
            };
            if let Some(canonical) = found {
                let alias_id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO visitors \
                        (id, tenant_id, site_id, anonymous_id, email, phone, customer_id, \
                         fingerprint, canonical_id, first_seen_at, last_seen_at, merged_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    duckdb::params![
                        alias_id,
                        tenant_id,
                        site_id,
                        anonymous_id,
                        idents.email,
                        idents.phone,
                        idents.customer_id,
                        idents.fingerprint,
                        canonical,
                        now_str,
                        now_str,
                        now_str
                    ],
                )?;
                conn.execute(
                    "UPDATE visitors SET last_seen_at = ?2, \
                        email = COALESCE(email, ?3), \
                        phone = COALESCE(phone, ?4), \
                        customer_id = COALESCE(customer_id, ?5), \
                        fingerprint = COALESCE(fingerprint, ?6) \
                     WHERE id = ?1",
                    duckdb::params![
                        canonical,
                        now_str,
                        idents.email,
                        idents.phone,
                        idents.customer_id,
                        idents.fingerprint
                    ],
                )?;
                conn.execute(
                    "INSERT INTO identity_merges \
                        (id, tenant_id, source_visitor_id, target_visitor_id, merge_reason, merged_at) \
                     VALUES (?1, ?2, ?3, ?4, 'identifier_match', ?5)",
                    duckdb::params![
                        Uuid::new_v4().to_string(),
                        tenant_id,
                        alias_id,
                        canonical,
                        now_str
                    ],
                )?;
                return Ok(canonical);
            }
        }

        // 3. Genuinely new visitor.
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO visitors \
                (id, tenant_id, site_id, anonymous_id, email, phone, customer_id, fingerprint, \
                 first_seen_at, last_seen_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            duckdb::params![
                id,
                tenant_id,
                site_id,
                anonymous_id,
                idents.email,
                idents.phone,
                idents.customer_id,
                idents.fingerprint,
                now_str,
                now_str
            ],
        )?;
        Ok(id)
    }

    /// Create or touch the session for `session_id`. A brand-new session
    /// with a click id or utm_source/utm_campaign in its first-touch
    /// attributes also records the touchpoint for the arrival.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_session(
        &self,
        tenant_id: &str,
        visitor_id: &str,
        session_id: &str,
        attrs: Option<&SessionAttrs>,
        client_ip: Option<&str>,
        user_agent: Option<&str>,
        pageviews: i64,
        events: i64,
        now: DateTime<Utc>,
    ) -> Result<SessionUpsert> {
        let conn = self.conn.lock().await;
        let now_str = fmt_ts(now);

        let existing: Option<String> = {
            let mut stmt = conn
                .prepare("SELECT id FROM sessions WHERE tenant_id = ?1 AND session_id = ?2")?;
            match stmt.query_row(duckdb::params![tenant_id, session_id], |row| row.get(0)) {
                Ok(id) => Some(id),
                Err(duckdb::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(id) = existing {
            // visitor_id is refreshed because the visitor may have merged
            // since the session started.
            conn.execute(
                "UPDATE sessions SET last_activity = ?2, \
                    page_count = page_count + ?3, event_count = event_count + ?4, \
                    visitor_id = ?5 \
                 WHERE id = ?1",
                duckdb::params![id, now_str, pageviews, events, visitor_id],
            )?;
            return Ok(SessionUpsert {
                is_new: false,
                touchpoint_id: None,
            });
        }

        let default_attrs = SessionAttrs::default();
        let attrs = attrs.unwrap_or(&default_attrs);
        let screen = match (
            parse_screen_dim(attrs.sw.as_ref()),
            parse_screen_dim(attrs.sh.as_ref()),
        ) {
            (Some(w), Some(h)) => Some(format!("{w}x{h}")),
            _ => None,
        };

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sessions \
                (id, tenant_id, session_id, visitor_id, referrer, landing_page, \
                 utm_source, utm_medium, utm_campaign, utm_content, utm_term, \
                 fbclid, gclid, ttclid, sclid, msclkid, \
                 device, browser, os, screen, timezone, language, ip, user_agent, \
                 started_at, last_activity, page_count, event_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
            duckdb::params![
                id,
                tenant_id,
                session_id,
                visitor_id,
                attrs.referrer,
                attrs.lp,
                attrs.us,
                attrs.um,
                attrs.uc,
                attrs.uo,
                attrs.ut,
                attrs.fbc,
                attrs.gc,
                attrs.ttc,
                attrs.sc,
                attrs.msc,
                attrs.dt,
                attrs.br,
                attrs.os,
                screen,
                attrs.tz,
                attrs.ln,
                client_ip,
                user_agent,
                now_str,
                now_str,
                pageviews,
                events
            ],
        )?;
        conn.execute(
            "UPDATE visitors SET total_sessions = total_sessions + 1 WHERE id = ?1",
            duckdb::params![visitor_id],
        )?;

        let clicks = ClickIds {
            fbclid: attrs.fbc.clone(),
            gclid: attrs.gc.clone(),
            ttclid: attrs.ttc.clone(),
            sclid: attrs.sc.clone(),
            msclkid: attrs.msc.clone(),
        };
        let platform = derive_platform(
            &clicks,
            attrs.us.as_deref(),
            attrs.um.as_deref(),
            attrs.uc.as_deref(),
        );

        let touchpoint_id = if let Some(platform) = platform {
            let tp_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO touchpoints \
                    (id, tenant_id, visitor_id, session_id, platform, click_id, \
                     utm_source, utm_medium, utm_campaign, utm_content, utm_term, \
                     referrer, landing_page, touched_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                duckdb::params![
                    tp_id,
                    tenant_id,
                    visitor_id,
                    session_id,
                    platform.as_str(),
                    clicks.primary(),
                    attrs.us,
                    attrs.um,
                    attrs.uc,
                    attrs.uo,
                    attrs.ut,
                    attrs.referrer,
                    attrs.lp,
                    now_str
                ],
            )?;
            Some(tp_id)
        } else {
            None
        };

        Ok(SessionUpsert {
            is_new: true,
            touchpoint_id,
        })
    }

    /// Persist one event. Duplicate `event_id`s are dropped silently.
    /// Purchase events additionally stamp the visitor's revenue counters,
    /// convert the most recent unconverted touchpoint, and classify the
    /// customer inline so the event row carries `is_new_customer`.
    pub async fn record_event(
        &self,
        tenant_id: &str,
        visitor_id: &str,
        session_id: &str,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        if event.name.trim().is_empty() {
            return Err(anyhow!("event name is required"));
        }
        let conn = self.conn.lock().await;
        let now_str = fmt_ts(now);

        if let Some(ref event_id) = event.event_id {
            let mut stmt = conn.prepare(
                "SELECT COUNT(*) FROM events WHERE tenant_id = ?1 AND event_id = ?2",
            )?;
            let count: i64 =
                stmt.query_row(duckdb::params![tenant_id, event_id], |row| row.get(0))?;
            if count > 0 {
                return Ok(EventOutcome {
                    inserted: false,
                    is_new_customer: None,
                });
            }
        }

        let id = Uuid::new_v4().to_string();
        let product_ids = if event.product_ids.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.product_ids)?)
        };
        let product_names = if event.product_names.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.product_names)?)
        };
        conn.execute(
            "INSERT INTO events \
                (id, tenant_id, visitor_id, session_id, event_name, event_category, \
                 page_url, page_title, page_referrer, order_id, revenue, currency, \
                 product_ids, product_names, quantity, click_ids, properties, \
                 event_id, client_ts, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                     ?16, ?17, ?18, ?19, ?20)",
            duckdb::params![
                id,
                tenant_id,
                visitor_id,
                session_id,
                event.name,
                event.category,
                event.page_url,
                event.page_title,
                event.page_referrer,
                event.order_id,
                event.revenue,
                event.currency,
                product_ids,
                product_names,
                event.quantity,
                event.click_ids_json,
                event.properties_json,
                event.event_id,
                event.client_ts.map(fmt_ts),
                now_str
            ],
        )?;
        conn.execute(
            "UPDATE visitors SET total_events = total_events + 1, last_seen_at = ?2 WHERE id = ?1",
            duckdb::params![visitor_id, now_str],
        )?;

        let mut is_new_customer = None;
        if event.is_purchase() {
            if let Some(ref order_id) = event.order_id {
                let revenue = event.revenue.unwrap_or(0.0);
                conn.execute(
                    "UPDATE visitors SET total_revenue = total_revenue + ?2 WHERE id = ?1",
                    duckdb::params![visitor_id, revenue],
                )?;

                // Convert the most recent unconverted touchpoint. The inner
                // select picks exactly one row, so concurrent Purchases with
                // distinct order_ids can never double-mark one touchpoint.
                let marked = conn.execute(
                    "UPDATE touchpoints SET converted = TRUE, order_id = ?3, revenue = ?4 \
                     WHERE id = (SELECT id FROM touchpoints \
                                 WHERE tenant_id = ?1 AND visitor_id = ?2 AND NOT converted \
                                 ORDER BY touched_at DESC, id DESC LIMIT 1)",
                    duckdb::params![tenant_id, visitor_id, order_id, revenue],
                )?;
                if marked == 0 {
                    // The purchase may have raced ahead of the ad-click
                    // touchpoint that drove it; counted, not corrected.
                    warn!(
                        tenant_id,
                        visitor_id,
                        order_id = %order_id,
                        counter = "touchpoint_race",
                        "purchase with no unconverted touchpoint"
                    );
                }

                let email: Option<String> = {
                    let mut stmt =
                        conn.prepare("SELECT email FROM visitors WHERE id = ?1")?;
                    stmt.query_row(duckdb::params![visitor_id], |row| row.get(0))?
                };
                let is_new = classify_customer_sync(
                    &conn,
                    tenant_id,
                    email.as_deref(),
                    Some(visitor_id),
                    order_id,
                    now,
                )?;
                conn.execute(
                    "UPDATE events SET is_new_customer = ?2 WHERE id = ?1",
                    duckdb::params![id, is_new],
                )?;
                if is_new {
                    conn.execute(
                        "UPDATE visitors SET first_order_date = CASE \
                            WHEN first_order_date IS NULL OR first_order_date > ?2 THEN ?2 \
                            ELSE first_order_date END \
                         WHERE id = ?1",
                        duckdb::params![visitor_id, now_str],
                    )?;
                }
                conn.execute(
                    "UPDATE sessions SET has_conversion = TRUE \
                     WHERE tenant_id = ?1 AND session_id = ?2",
                    duckdb::params![tenant_id, session_id],
                )?;
                is_new_customer = Some(is_new);
            }
        }

        Ok(EventOutcome {
            inserted: true,
            is_new_customer,
        })
    }
}
