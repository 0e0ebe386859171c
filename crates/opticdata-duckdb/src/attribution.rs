//! Attribution engine: turns ordered touchpoints into credited results.
//!
//! The driver fetches orders and touchpoints in bulk, computes credits in
//! Rust with the pure model math from `opticdata-core`, and upserts result
//! rows in parameter-bounded sub-batches. Summary rebuild and verification
//! run at the end of every engine pass, so a completed run always leaves
//! the reporting cube and the audit log consistent.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use opticdata_core::attribution::{
    compute_credits, normalize_credits, round_cents, AttributionModel,
};

use crate::backend::{fmt_ts, parse_ts};
use crate::classify::classify_customer_sync;
use crate::verification::VerificationOutcome;
use crate::DuckDbBackend;

/// DuckDB accepts far more, but staying under the common relational-driver
/// ceiling keeps the chunking honest. 13 parameters per result row.
const MAX_PARAMS_PER_STATEMENT: usize = 60_000;
const RESULT_COLUMNS: usize = 13;

#[derive(Debug, Clone)]
pub struct EngineParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub models: Vec<AttributionModel>,
    /// 0 means infinite lookback.
    pub lookback_days: u32,
    pub batch_size: usize,
    pub epsilon_credit: f64,
    pub epsilon_revenue: f64,
    pub half_life_days: f64,
}

impl EngineParams {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, lookback_days: u32) -> Self {
        Self {
            start,
            end,
            models: AttributionModel::ALL.to_vec(),
            lookback_days,
            batch_size: 500,
            epsilon_credit: opticdata_core::attribution::DEFAULT_EPSILON_CREDIT,
            epsilon_revenue: opticdata_core::attribution::DEFAULT_EPSILON_REVENUE,
            half_life_days: opticdata_core::attribution::DEFAULT_HALF_LIFE_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineRun {
    pub orders_seen: usize,
    pub orders_attributed: usize,
    pub orders_skipped: usize,
    pub results_written: usize,
    pub summary_rows: usize,
    pub verification: VerificationOutcome,
}

#[derive(Debug, Clone)]
struct OrderRow {
    order_id: String,
    visitor_id: String,
    revenue: f64,
    converted_at: DateTime<Utc>,
    email: Option<String>,
}

#[derive(Debug, Clone)]
struct TouchRow {
    id: String,
    touched_at: DateTime<Utc>,
}

struct StagedResult {
    visitor_id: String,
    touchpoint_id: String,
    order_id: String,
    revenue: f64,
    model: AttributionModel,
    credit: f64,
    attributed_revenue: f64,
    is_new_customer: bool,
}

impl DuckDbBackend {
    /// Run the full engine pass for one tenant and window, then rebuild the
    /// summary and verify the processed orders. Per-order failures are
    /// logged and skipped; they never abort the tenant.
    pub async fn run_attribution(
        &self,
        tenant_id: &str,
        params: &EngineParams,
        now: DateTime<Utc>,
    ) -> Result<EngineRun> {
        let orders = self.fetch_orders(tenant_id, params).await?;
        let mut run = EngineRun {
            orders_seen: orders.len(),
            ..Default::default()
        };

        // Batch boundaries are also the cancellation points: each chunk
        // locks, commits, and releases before the next starts.
        for chunk in orders.chunks(params.batch_size.max(1)) {
            let (attributed, skipped, written) =
                self.attribute_order_batch(tenant_id, chunk, params, now).await?;
            run.orders_attributed += attributed;
            run.orders_skipped += skipped;
            run.results_written += written;
        }

        run.summary_rows = self
            .rebuild_summary(
                tenant_id,
                params.start.date_naive(),
                params.end.date_naive(),
                &params.models,
                params.lookback_days,
            )
            .await?;

        let order_ids: Vec<String> = orders.iter().map(|o| o.order_id.clone()).collect();
        run.verification = self
            .verify_orders(
                tenant_id,
                &order_ids,
                &params.models,
                params.epsilon_credit,
                params.epsilon_revenue,
                now,
            )
            .await?;

        info!(
            tenant_id,
            lookback_days = params.lookback_days,
            orders = run.orders_seen,
            attributed = run.orders_attributed,
            skipped = run.orders_skipped,
            results = run.results_written,
            "attribution run complete"
        );
        Ok(run)
    }

    /// Distinct Purchase orders in the window, joined to the canonical
    /// visitor for the classifier's email.
    async fn fetch_orders(&self, tenant_id: &str, params: &EngineParams) -> Result<Vec<OrderRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT e.order_id, \
                    COALESCE(v.canonical_id, v.id) AS visitor_id, \
                    MAX(COALESCE(e.revenue, 0)) AS revenue, \
                    MIN(CAST(e.created_at AS VARCHAR)) AS converted_at, \
                    MAX(cv.email) AS email \
             FROM events e \
             JOIN visitors v  ON v.tenant_id = e.tenant_id AND v.id = e.visitor_id \
             JOIN visitors cv ON cv.tenant_id = e.tenant_id \
                             AND cv.id = COALESCE(v.canonical_id, v.id) \
             WHERE e.tenant_id = ?1 AND e.event_name = 'Purchase' \
               AND e.order_id IS NOT NULL \
               AND e.created_at >= ?2 AND e.created_at < ?3 \
             GROUP BY e.order_id, COALESCE(v.canonical_id, v.id) \
             ORDER BY MIN(CAST(e.created_at AS VARCHAR)) ASC",
        )?;
        let rows = stmt.query_map(
            duckdb::params![tenant_id, fmt_ts(params.start), fmt_ts(params.end)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )?;

        let mut orders = Vec::new();
        for row in rows {
            let (order_id, visitor_id, revenue, converted_at, email) = row?;
            orders.push(OrderRow {
                order_id,
                visitor_id,
                revenue,
                converted_at: parse_ts(&converted_at)?,
                email,
            });
        }
        Ok(orders)
    }

    async fn attribute_order_batch(
        &self,
        tenant_id: &str,
        orders: &[OrderRow],
        params: &EngineParams,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize, usize)> {
        let mut guard = self.conn.lock().await;
        let conn = &mut *guard;

        // One bulk fetch for every visitor in the batch, grouped
        // client-side — not one query per order.
        let visitor_ids: Vec<String> = orders
            .iter()
            .map(|o| o.visitor_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut touches: BTreeMap<String, Vec<TouchRow>> = BTreeMap::new();
        if !visitor_ids.is_empty() {
            let placeholders: Vec<String> = (0..visitor_ids.len())
                .map(|i| format!("?{}", i + 2))
                .collect();
            let sql = format!(
                "SELECT id, visitor_id, CAST(touched_at AS VARCHAR) \
                 FROM touchpoints \
                 WHERE tenant_id = ?1 AND visitor_id IN ({}) \
                 ORDER BY touched_at ASC, id ASC",
                placeholders.join(", ")
            );
            let mut stage_params: Vec<Box<dyn duckdb::types::ToSql>> =
                vec![Box::new(tenant_id.to_string())];
            for id in &visitor_ids {
                stage_params.push(Box::new(id.clone()));
            }
            let param_refs: Vec<&dyn duckdb::types::ToSql> =
                stage_params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (id, visitor_id, touched_at) = row?;
                touches.entry(visitor_id).or_default().push(TouchRow {
                    id,
                    touched_at: parse_ts(&touched_at)?,
                });
            }
        }

        let mut staged: Vec<StagedResult> = Vec::new();
        let mut attributed = 0usize;
        let mut skipped = 0usize;
        let lookback_secs = i64::from(params.lookback_days) * 86_400;

        for order in orders {
            match stage_order(conn, tenant_id, order, &touches, params, lookback_secs) {
                Ok(Some(rows)) => {
                    attributed += 1;
                    staged.extend(rows);
                }
                Ok(None) => skipped += 1,
                Err(e) => {
                    // AttributionOrderFailed: one bad order never aborts
                    // the batch.
                    warn!(
                        tenant_id,
                        order_id = %order.order_id,
                        error = %e,
                        "order attribution failed"
                    );
                    skipped += 1;
                }
            }
        }

        let written = upsert_results(conn, tenant_id, &staged, params.lookback_days, now)?;
        Ok((attributed, skipped, written))
    }
}

fn stage_order(
    conn: &duckdb::Connection,
    tenant_id: &str,
    order: &OrderRow,
    touches: &BTreeMap<String, Vec<TouchRow>>,
    params: &EngineParams,
    lookback_secs: i64,
) -> Result<Option<Vec<StagedResult>>> {
    let is_new = classify_customer_sync(
        conn,
        tenant_id,
        order.email.as_deref(),
        Some(&order.visitor_id),
        &order.order_id,
        order.converted_at,
    )?;
    if is_new {
        conn.execute(
            "UPDATE visitors SET first_order_date = CASE \
                WHEN first_order_date IS NULL OR first_order_date > ?2 THEN ?2 \
                ELSE first_order_date END \
             WHERE id = ?1",
            duckdb::params![order.visitor_id, fmt_ts(order.converted_at)],
        )?;
    }

    // Eligible touches: at or before the conversion, inside the lookback
    // window (0 = infinite). Already sorted by touched_at, id.
    let eligible: Vec<&TouchRow> = touches
        .get(&order.visitor_id)
        .map(|list| {
            list.iter()
                .filter(|t| {
                    t.touched_at <= order.converted_at
                        && (params.lookback_days == 0
                            || (order.converted_at - t.touched_at).num_seconds() <= lookback_secs)
                })
                .collect()
        })
        .unwrap_or_default();
    if eligible.is_empty() {
        return Ok(None);
    }

    let touched_at: Vec<DateTime<Utc>> = eligible.iter().map(|t| t.touched_at).collect();
    let mut staged = Vec::new();
    for model in &params.models {
        let mut credits = compute_credits(
            *model,
            &touched_at,
            order.converted_at,
            params.half_life_days,
        );
        normalize_credits(&mut credits, params.epsilon_credit);
        for (touch, credit) in eligible.iter().zip(credits.iter()) {
            if *credit <= 0.0 {
                continue;
            }
            staged.push(StagedResult {
                visitor_id: order.visitor_id.clone(),
                touchpoint_id: touch.id.clone(),
                order_id: order.order_id.clone(),
                revenue: order.revenue,
                model: *model,
                credit: *credit,
                attributed_revenue: round_cents(order.revenue * credit),
                is_new_customer: is_new,
            });
        }
    }
    Ok(Some(staged))
}

/// Upsert staged rows in sub-batches bounded by the parameter limit,
/// re-numbering placeholders per chunk. Each sub-batch commits atomically.
fn upsert_results(
    conn: &mut duckdb::Connection,
    tenant_id: &str,
    staged: &[StagedResult],
    lookback_days: u32,
    now: DateTime<Utc>,
) -> Result<usize> {
    if staged.is_empty() {
        return Ok(0);
    }
    let rows_per_chunk = (MAX_PARAMS_PER_STATEMENT / RESULT_COLUMNS).max(1);
    let now_str = fmt_ts(now);
    let mut written = 0usize;

    for chunk in staged.chunks(rows_per_chunk) {
        let mut values: Vec<String> = Vec::with_capacity(chunk.len());
        let mut params: Vec<Box<dyn duckdb::types::ToSql>> =
            Vec::with_capacity(chunk.len() * RESULT_COLUMNS);
        for (row_idx, row) in chunk.iter().enumerate() {
            let base = row_idx * RESULT_COLUMNS;
            let placeholders: Vec<String> =
                (1..=RESULT_COLUMNS).map(|i| format!("?{}", base + i)).collect();
            values.push(format!("({})", placeholders.join(", ")));
            params.push(Box::new(Uuid::new_v4().to_string()));
            params.push(Box::new(tenant_id.to_string()));
            params.push(Box::new(row.visitor_id.clone()));
            params.push(Box::new(row.touchpoint_id.clone()));
            params.push(Box::new(row.order_id.clone()));
            params.push(Box::new(row.revenue));
            params.push(Box::new(row.model.as_str()));
            params.push(Box::new(row.credit));
            params.push(Box::new(row.attributed_revenue));
            params.push(Box::new(i64::from(lookback_days)));
            params.push(Box::new(row.is_new_customer));
            params.push(Box::new(true));
            params.push(Box::new(now_str.clone()));
        }

        let sql = format!(
            "INSERT INTO attribution_results \
                (id, tenant_id, visitor_id, touchpoint_id, order_id, revenue, model, \
                 credit, attributed_revenue, lookback_days, is_new_customer, \
                 credit_verified, computed_at) \
             VALUES {} \
             ON CONFLICT (touchpoint_id, order_id, model) DO UPDATE SET \
                credit = excluded.credit, \
                attributed_revenue = excluded.attributed_revenue, \
                revenue = excluded.revenue, \
                lookback_days = excluded.lookback_days, \
                computed_at = excluded.computed_at, \
                is_new_customer = excluded.is_new_customer, \
                credit_verified = TRUE",
            values.join(", ")
        );

        let tx = conn.transaction()?;
        {
            let param_refs: Vec<&dyn duckdb::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            tx.execute(&sql, param_refs.as_slice())?;
        }
        tx.commit()?;
        written += chunk.len();
    }
    Ok(written)
}
