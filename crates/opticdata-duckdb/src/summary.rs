//! Summary aggregation: the reporting cube, always rebuildable from
//! results.

use anyhow::Result;
use chrono::NaiveDate;

use opticdata_core::attribution::AttributionModel;

use crate::DuckDbBackend;

fn model_list(models: &[AttributionModel]) -> String {
    models
        .iter()
        .map(|m| format!("'{}'", m.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DuckDbBackend {
    /// Idempotent rebuild: delete the (tenant, window, models, lookback)
    /// slice, then re-insert it as a straight GROUP BY over results. Two
    /// consecutive rebuilds produce identical rows.
    pub async fn rebuild_summary(
        &self,
        tenant_id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        models: &[AttributionModel],
        lookback_days: u32,
    ) -> Result<usize> {
        if models.is_empty() {
            return Ok(0);
        }
        let mut guard = self.conn.lock().await;
        let conn = &mut *guard;
        let models_sql = model_list(models);
        let start = start_date.format("%Y-%m-%d").to_string();
        let end = end_date.format("%Y-%m-%d").to_string();

        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM attribution_summary \
                 WHERE tenant_id = ?1 AND summary_date >= ?2 AND summary_date <= ?3 \
                   AND lookback_days = ?4 AND model IN ({models_sql})"
            ),
            duckdb::params![tenant_id, start, end, i64::from(lookback_days)],
        )?;
        let inserted = tx.execute(
            &format!(
                "INSERT INTO attribution_summary \
                    (tenant_id, summary_date, model, platform, \
                     utm_source, utm_medium, utm_campaign, utm_content, \
                     attributed_conversions, attributed_revenue, touchpoints, \
                     unique_visitors, lookback_days, is_new_customer) \
                 SELECT r.tenant_id, CAST(r.computed_at AS DATE), r.model, t.platform, \
                        t.utm_source, t.utm_medium, t.utm_campaign, t.utm_content, \
                        SUM(r.credit), SUM(r.attributed_revenue), \
                        COUNT(DISTINCT r.touchpoint_id), COUNT(DISTINCT r.visitor_id), \
                        r.lookback_days, r.is_new_customer \
                 FROM attribution_results r \
                 JOIN touchpoints t ON t.id = r.touchpoint_id \
                 WHERE r.tenant_id = ?1 \
                   AND CAST(r.computed_at AS DATE) >= ?2 \
                   AND CAST(r.computed_at AS DATE) <= ?3 \
                   AND r.lookback_days = ?4 \
                   AND r.model IN ({models_sql}) \
                 GROUP BY r.tenant_id, CAST(r.computed_at AS DATE), r.model, t.platform, \
                          t.utm_source, t.utm_medium, t.utm_campaign, t.utm_content, \
                          r.lookback_days, r.is_new_customer"
            ),
            duckdb::params![tenant_id, start, end, i64::from(lookback_days)],
        )?;
        tx.commit()?;
        Ok(inserted)
    }
}
