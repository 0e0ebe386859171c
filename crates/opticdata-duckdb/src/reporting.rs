//! Reporting over attribution results: grouped reports, model comparison,
//! journey analysis, conversion paths.
//!
//! Queries fetch flat rows and shape them in Rust. Spend comes from the
//! `platform_spend` table (fed by external syncers, empty by default), so
//! ROAS/CPA are `None` until spend exists for the platform.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use opticdata_core::attribution::{round_cents, AttributionModel};

use crate::backend::{fmt_ts, parse_ts};
use crate::DuckDbBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportGroupBy {
    Platform,
    Campaign,
    Source,
    Channel,
}

impl ReportGroupBy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "platform" => Ok(Self::Platform),
            "campaign" => Ok(Self::Campaign),
            "source" => Ok(Self::Source),
            "channel" => Ok(Self::Channel),
            other => Err(anyhow!(
                "group_by must be one of platform, campaign, source, channel (got {other})"
            )),
        }
    }

    /// SQL expression producing the group column, `t` = touchpoints.
    fn group_expr(&self) -> &'static str {
        match self {
            Self::Platform => "t.platform",
            Self::Campaign => "COALESCE(NULLIF(TRIM(t.utm_campaign), ''), '(none)')",
            Self::Source => "COALESCE(NULLIF(TRIM(t.utm_source), ''), '(none)')",
            // "source / medium", the channel label convention.
            Self::Channel => {
                "COALESCE(NULLIF(TRIM(t.utm_source), ''), t.platform) || ' / ' || \
                 COALESCE(NULLIF(TRIM(t.utm_medium), ''), 'referral')"
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub group_value: String,
    /// Fractional conversions: SUM(credit).
    pub conversions: f64,
    pub revenue: f64,
    pub touchpoints: i64,
    pub visitors: i64,
    pub spend: Option<f64>,
    pub roas: Option<f64>,
    pub cpa: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttributionReport {
    pub model: AttributionModel,
    pub lookback_days: u32,
    pub rows: Vec<ReportRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformCount {
    pub platform: String,
    pub orders: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JourneyAnalysis {
    pub orders: usize,
    pub avg_touchpoints: f64,
    pub median_touchpoints: f64,
    pub avg_hours_to_convert: f64,
    pub single_touch_orders: usize,
    pub multi_touch_orders: usize,
    pub top_first_touch: Vec<PlatformCount>,
    pub top_last_touch: Vec<PlatformCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionPath {
    pub path: String,
    pub orders: i64,
    pub revenue: f64,
}

#[derive(Debug)]
struct OrderJourney {
    platforms: Vec<String>,
    first_touch: DateTime<Utc>,
    converted_at: DateTime<Utc>,
    revenue: f64,
}

impl DuckDbBackend {
    /// Grouped attribution report for one model. Spend is keyed by
    /// platform, so only the platform grouping carries ROAS/CPA.
    #[allow(clippy::too_many_arguments)]
    pub async fn attribution_report(
        &self,
        tenant_id: &str,
        model: AttributionModel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback_days: u32,
        group_by: ReportGroupBy,
    ) -> Result<AttributionReport> {
        let conn = self.conn.lock().await;
        let group_expr = group_by.group_expr();
        let sql = format!(
            "SELECT {group_expr} AS grp, \
                    SUM(r.credit), SUM(r.attributed_revenue), \
                    COUNT(DISTINCT r.touchpoint_id), COUNT(DISTINCT r.visitor_id) \
             FROM attribution_results r \
             JOIN touchpoints t ON t.id = r.touchpoint_id \
             WHERE r.tenant_id = ?1 AND r.model = ?2 AND r.lookback_days = ?3 \
               AND r.computed_at >= ?4 AND r.computed_at < ?5 \
             GROUP BY {group_expr} \
             ORDER BY SUM(r.attributed_revenue) DESC"
        );

        let mut stmt = conn.prepare(&sql)?;
        let mapped = stmt.query_map(
            duckdb::params![
                tenant_id,
                model.as_str(),
                i64::from(lookback_days),
                fmt_ts(start),
                fmt_ts(end)
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;

        let mut grouped: BTreeMap<String, (f64, f64, i64, i64)> = BTreeMap::new();
        for row in mapped {
            let (grp, credit, revenue, touchpoints, visitors) = row?;
            let entry = grouped.entry(grp).or_insert((0.0, 0.0, 0, 0));
            entry.0 += credit;
            entry.1 += revenue;
            entry.2 += touchpoints;
            entry.3 += visitors;
        }

        let spend_by_platform: HashMap<String, f64> = {
            let mut stmt = conn.prepare(
                "SELECT platform, SUM(amount) FROM platform_spend \
                 WHERE tenant_id = ?1 AND spend_date >= CAST(?2 AS DATE) \
                   AND spend_date <= CAST(?3 AS DATE) \
                 GROUP BY platform",
            )?;
            let rows = stmt.query_map(
                duckdb::params![
                    tenant_id,
                    start.date_naive().to_string(),
                    end.date_naive().to_string()
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )?;
            let mut map = HashMap::new();
            for row in rows {
                let (platform, amount) = row?;
                map.insert(platform, amount);
            }
            map
        };

        let mut rows: Vec<ReportRow> = grouped
            .into_iter()
            .map(|(group_value, (conversions, revenue, touchpoints, visitors))| {
                // Spend is keyed by platform, so only the platform grouping
                // can join it.
                let spend = if group_by == ReportGroupBy::Platform {
                    spend_by_platform.get(&group_value).copied()
                } else {
                    None
                };
                let roas = spend
                    .filter(|s| *s > 0.0)
                    .map(|s| round_cents(revenue / s));
                let cpa = spend
                    .filter(|s| *s > 0.0 && conversions > 0.0)
                    .map(|s| round_cents(s / conversions));
                ReportRow {
                    group_value,
                    conversions,
                    revenue,
                    touchpoints,
                    visitors,
                    spend,
                    roas,
                    cpa,
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            b.revenue
                .partial_cmp(&a.revenue)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(AttributionReport {
            model,
            lookback_days,
            rows,
        })
    }

    /// One report per model, same window and grouping.
    #[allow(clippy::too_many_arguments)]
    pub async fn compare_models(
        &self,
        tenant_id: &str,
        models: &[AttributionModel],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback_days: u32,
        group_by: ReportGroupBy,
    ) -> Result<Vec<AttributionReport>> {
        let mut reports = Vec::with_capacity(models.len());
        for model in models {
            reports.push(
                self.attribution_report(tenant_id, *model, start, end, lookback_days, group_by)
                    .await?,
            );
        }
        Ok(reports)
    }

    async fn fetch_journeys(
        &self,
        tenant_id: &str,
        model: AttributionModel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback_days: u32,
    ) -> Result<Vec<OrderJourney>> {
        let conn = self.conn.lock().await;
        // Correlated subqueries are unreliable in DuckDB; conversion times
        // come from a CTE instead.
        let mut stmt = conn.prepare(
            "WITH conversions AS ( \
                SELECT order_id, MIN(created_at) AS converted_at \
                FROM events \
                WHERE tenant_id = ?1 AND event_name = 'Purchase' AND order_id IS NOT NULL \
                GROUP BY order_id \
             ) \
             SELECT r.order_id, t.platform, CAST(t.touched_at AS VARCHAR), \
                    CAST(c.converted_at AS VARCHAR), r.revenue \
             FROM attribution_results r \
             JOIN touchpoints t ON t.id = r.touchpoint_id \
             JOIN conversions c ON c.order_id = r.order_id \
             WHERE r.tenant_id = ?1 AND r.model = ?2 AND r.lookback_days = ?3 \
               AND r.computed_at >= ?4 AND r.computed_at < ?5 \
             ORDER BY r.order_id ASC, t.touched_at ASC, t.id ASC",
        )?;
        let mapped = stmt.query_map(
            duckdb::params![
                tenant_id,
                model.as_str(),
                i64::from(lookback_days),
                fmt_ts(start),
                fmt_ts(end)
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            },
        )?;

        let mut journeys: BTreeMap<String, OrderJourney> = BTreeMap::new();
        for row in mapped {
            let (order_id, platform, touched_at, converted_at, revenue) = row?;
            let touched_at = parse_ts(&touched_at)?;
            let converted_at = parse_ts(&converted_at)?;
            journeys
                .entry(order_id)
                .and_modify(|j| {
                    j.platforms.push(platform.clone());
                    if touched_at < j.first_touch {
                        j.first_touch = touched_at;
                    }
                })
                .or_insert_with(|| OrderJourney {
                    platforms: vec![platform],
                    first_touch: touched_at,
                    converted_at,
                    revenue,
                });
        }
        Ok(journeys.into_values().collect())
    }

    /// Journey shape statistics across converted orders.
    pub async fn journey_analysis(
        &self,
        tenant_id: &str,
        model: AttributionModel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback_days: u32,
    ) -> Result<JourneyAnalysis> {
        let journeys = self
            .fetch_journeys(tenant_id, model, start, end, lookback_days)
            .await?;
        let orders = journeys.len();
        if orders == 0 {
            return Ok(JourneyAnalysis {
                orders: 0,
                avg_touchpoints: 0.0,
                median_touchpoints: 0.0,
                avg_hours_to_convert: 0.0,
                single_touch_orders: 0,
                multi_touch_orders: 0,
                top_first_touch: Vec::new(),
                top_last_touch: Vec::new(),
            });
        }

        let mut counts: Vec<usize> = journeys.iter().map(|j| j.platforms.len()).collect();
        counts.sort_unstable();
        let median_touchpoints = if orders % 2 == 1 {
            counts[orders / 2] as f64
        } else {
            (counts[orders / 2 - 1] + counts[orders / 2]) as f64 / 2.0
        };
        let total_touches: usize = counts.iter().sum();
        let total_hours: f64 = journeys
            .iter()
            .map(|j| (j.converted_at - j.first_touch).num_seconds().max(0) as f64 / 3600.0)
            .sum();

        let mut first_counts: HashMap<String, i64> = HashMap::new();
        let mut last_counts: HashMap<String, i64> = HashMap::new();
        let mut single = 0usize;
        for journey in &journeys {
            if journey.platforms.len() == 1 {
                single += 1;
            }
            if let Some(first) = journey.platforms.first() {
                *first_counts.entry(first.clone()).or_default() += 1;
            }
            if let Some(last) = journey.platforms.last() {
                *last_counts.entry(last.clone()).or_default() += 1;
            }
        }
        let top = |counts: HashMap<String, i64>| {
            let mut list: Vec<PlatformCount> = counts
                .into_iter()
                .map(|(platform, orders)| PlatformCount { platform, orders })
                .collect();
            list.sort_by(|a, b| b.orders.cmp(&a.orders).then(a.platform.cmp(&b.platform)));
            list
        };

        Ok(JourneyAnalysis {
            orders,
            avg_touchpoints: total_touches as f64 / orders as f64,
            median_touchpoints,
            avg_hours_to_convert: total_hours / orders as f64,
            single_touch_orders: single,
            multi_touch_orders: orders - single,
            top_first_touch: top(first_counts),
            top_last_touch: top(last_counts),
        })
    }

    /// Top-N platform sequences, joined "meta -> google -> meta".
    #[allow(clippy::too_many_arguments)]
    pub async fn conversion_paths(
        &self,
        tenant_id: &str,
        model: AttributionModel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        lookback_days: u32,
        limit: usize,
    ) -> Result<Vec<ConversionPath>> {
        let journeys = self
            .fetch_journeys(tenant_id, model, start, end, lookback_days)
            .await?;

        let mut paths: BTreeMap<String, (i64, f64)> = BTreeMap::new();
        for journey in &journeys {
            let path = journey.platforms.join(" -> ");
            let entry = paths.entry(path).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += journey.revenue;
        }

        let mut rows: Vec<ConversionPath> = paths
            .into_iter()
            .map(|(path, (orders, revenue))| ConversionPath {
                path,
                orders,
                revenue: round_cents(revenue),
            })
            .collect();
        rows.sort_by(|a, b| {
            b.orders.cmp(&a.orders).then_with(|| {
                b.revenue
                    .partial_cmp(&a.revenue)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        rows.truncate(limit);
        Ok(rows)
    }
}
