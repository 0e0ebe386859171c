//! Verification pass: prove the attribution invariants, fix drift, audit.
//!
//! For every (order, model) pair the pass recomputes the credit sum and
//! the attributed-revenue sum from the persisted rows. In-tolerance pairs
//! are logged as passes; out-of-tolerance pairs are renormalised row by
//! row with the last row absorbing float drift and cent rounding. Every
//! check writes a `verification_log` row, pass or fix.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use opticdata_core::attribution::{round_cents, AttributionModel};

use crate::backend::fmt_ts;
use crate::DuckDbBackend;

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationOutcome {
    pub checked: usize,
    pub normalized: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationStatus {
    /// "verified" when the latest check of every pair passed untouched,
    /// "normalized" when any pair needed fixing.
    pub status: String,
    pub credit_integrity_pct: f64,
    pub revenue_integrity_pct: f64,
    pub checks: usize,
    pub normalized: usize,
}

#[derive(Debug)]
struct ResultRow {
    id: String,
    credit: f64,
    attributed_revenue: f64,
    revenue: f64,
}

impl DuckDbBackend {
    /// Verify (and where needed renormalise) every (order, model) pair in
    /// `order_ids` × `models`.
    pub async fn verify_orders(
        &self,
        tenant_id: &str,
        order_ids: &[String],
        models: &[AttributionModel],
        epsilon_credit: f64,
        epsilon_revenue: f64,
        now: DateTime<Utc>,
    ) -> Result<VerificationOutcome> {
        let mut guard = self.conn.lock().await;
        let conn = &mut *guard;
        let now_str = fmt_ts(now);
        let mut outcome = VerificationOutcome::default();

        for order_id in order_ids {
            for model in models {
                let rows: Vec<ResultRow> = {
                    let mut stmt = conn.prepare(
                        "SELECT id, credit, attributed_revenue, revenue \
                         FROM attribution_results \
                         WHERE tenant_id = ?1 AND order_id = ?2 AND model = ?3 \
                         ORDER BY id ASC",
                    )?;
                    let mapped = stmt.query_map(
                        duckdb::params![tenant_id, order_id, model.as_str()],
                        |row| {
                            Ok(ResultRow {
                                id: row.get(0)?,
                                credit: row.get(1)?,
                                attributed_revenue: row.get(2)?,
                                revenue: row.get(3)?,
                            })
                        },
                    )?;
                    let mut out = Vec::new();
                    for row in mapped {
                        out.push(row?);
                    }
                    out
                };
                if rows.is_empty() {
                    continue;
                }

                let revenue = rows[0].revenue;
                let credit_sum: f64 = rows.iter().map(|r| r.credit).sum();
                let total_credited: f64 = rows.iter().map(|r| r.attributed_revenue).sum();
                let credit_ok = (credit_sum - 1.0).abs() < epsilon_credit;
                let revenue_ok = (total_credited - revenue).abs() < epsilon_revenue;
                let needs_fix = !credit_ok || !revenue_ok;

                if needs_fix {
                    warn!(
                        tenant_id,
                        order_id = %order_id,
                        model = model.as_str(),
                        credit_sum,
                        total_credited,
                        revenue,
                        "attribution drift, renormalising"
                    );
                    renormalize_pair(conn, &rows, revenue, credit_sum)?;
                    outcome.normalized += 1;
                }

                conn.execute(
                    "INSERT INTO verification_log \
                        (id, tenant_id, order_id, model, actual_revenue, total_credited, \
                         credit_sum, was_normalized, verified_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    duckdb::params![
                        Uuid::new_v4().to_string(),
                        tenant_id,
                        order_id,
                        model.as_str(),
                        revenue,
                        total_credited,
                        credit_sum,
                        needs_fix,
                        now_str
                    ],
                )?;
                outcome.checked += 1;
            }
        }
        Ok(outcome)
    }

    /// Roll up the most recent check of every (order, model) pair into a
    /// tenant-level integrity report.
    pub async fn verification_status(
        &self,
        tenant_id: &str,
        epsilon_credit: f64,
        epsilon_revenue: f64,
    ) -> Result<VerificationStatus> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "WITH latest AS ( \
                SELECT order_id, model, MAX(verified_at) AS verified_at \
                FROM verification_log WHERE tenant_id = ?1 \
                GROUP BY order_id, model \
             ) \
             SELECT l.credit_sum, l.actual_revenue, l.total_credited, l.was_normalized \
             FROM verification_log l \
             JOIN latest ON latest.order_id = l.order_id \
                        AND latest.model = l.model \
                        AND latest.verified_at = l.verified_at \
             WHERE l.tenant_id = ?1",
        )?;
        let rows = stmt.query_map(duckdb::params![tenant_id], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;

        let mut checks = 0usize;
        let mut normalized = 0usize;
        let mut credit_ok = 0usize;
        let mut revenue_ok = 0usize;
        for row in rows {
            let (credit_sum, actual_revenue, total_credited, was_normalized) = row?;
            checks += 1;
            if was_normalized {
                normalized += 1;
            }
            if (credit_sum - 1.0).abs() < epsilon_credit {
                credit_ok += 1;
            }
            if (total_credited - actual_revenue).abs() < epsilon_revenue {
                revenue_ok += 1;
            }
        }

        let pct = |ok: usize| {
            if checks == 0 {
                100.0
            } else {
                round_cents(ok as f64 / checks as f64 * 100.0)
            }
        };
        let status = if normalized > 0 { "normalized" } else { "verified" };
        Ok(VerificationStatus {
            status: status.to_string(),
            credit_integrity_pct: pct(credit_ok),
            revenue_integrity_pct: pct(revenue_ok),
            checks,
            normalized,
        })
    }
}

/// Rewrite one (order, model)'s rows so credits sum to exactly 1 and
/// attributed revenue to exactly the order revenue. Rows keep insert
/// order; the last row absorbs float drift and cent-level rounding.
fn renormalize_pair(
    conn: &mut duckdb::Connection,
    rows: &[ResultRow],
    revenue: f64,
    credit_sum: f64,
) -> Result<()> {
    let n = rows.len();
    let mut new_credits: Vec<f64> = if credit_sum > 0.0 {
        rows.iter().map(|r| r.credit / credit_sum).collect()
    } else {
        vec![1.0 / n as f64; n]
    };
    let prior: f64 = new_credits[..n - 1].iter().sum();
    new_credits[n - 1] = 1.0 - prior;

    let mut new_revenues: Vec<f64> = new_credits
        .iter()
        .map(|c| round_cents(revenue * c))
        .collect();
    let prior_rev: f64 = new_revenues[..n - 1].iter().sum();
    new_revenues[n - 1] = round_cents(revenue - prior_rev);

    let tx = conn.transaction()?;
    for (row, (credit, attributed)) in rows
        .iter()
        .zip(new_credits.iter().zip(new_revenues.iter()))
    {
        tx.execute(
            "UPDATE attribution_results \
             SET credit = ?2, attributed_revenue = ?3, credit_verified = TRUE \
             WHERE id = ?1",
            duckdb::params![row.id, credit, attributed],
        )?;
    }
    tx.commit()?;
    Ok(())
}
