//! New-vs-returning classification.
//!
//! An order is "new" iff no prior Purchase with a different order id exists
//! for the same person — matched through the effective visitor id
//! (`COALESCE(canonical_id, id)`) and, when known, the email across all
//! merged identities. The `order_id <> current` clause keeps the order
//! being classified out of its own evidence; `before` keeps later orders
//! out when the engine re-classifies historical conversions.

use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;

use crate::backend::fmt_ts;
use crate::DuckDbBackend;

pub(crate) fn classify_customer_sync(
    conn: &Connection,
    tenant_id: &str,
    email: Option<&str>,
    visitor_id: Option<&str>,
    order_id: &str,
    before: DateTime<Utc>,
) -> Result<bool> {
    let email = email.map(str::trim).filter(|e| !e.is_empty());
    let visitor_id = visitor_id.map(str::trim).filter(|v| !v.is_empty());

    // No identifier at all: nothing to look up, treat as new.
    if email.is_none() && visitor_id.is_none() {
        return Ok(true);
    }

    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = vec![
        Box::new(tenant_id.to_string()),
        Box::new(order_id.to_string()),
        Box::new(fmt_ts(before)),
    ];
    let mut idx = 4;

    if let Some(visitor_id) = visitor_id {
        clauses.push(format!("COALESCE(v.canonical_id, v.id) = ?{idx}"));
        params.push(Box::new(visitor_id.to_string()));
        idx += 1;
    }
    if let Some(email) = email {
        clauses.push(format!(
            "COALESCE(v.canonical_id, v.id) IN ( \
                SELECT COALESCE(canonical_id, id) FROM visitors \
                WHERE tenant_id = ?1 AND email IS NOT NULL AND lower(email) = lower(?{idx}))"
        ));
        params.push(Box::new(email.to_string()));
    }

    let sql = format!(
        "SELECT COUNT(*) FROM events e \
         JOIN visitors v ON v.tenant_id = e.tenant_id AND v.id = e.visitor_id \
         WHERE e.tenant_id = ?1 AND e.event_name = 'Purchase' \
           AND e.order_id IS NOT NULL AND e.order_id <> ?2 \
           AND e.created_at < ?3 \
           AND ({})",
        clauses.join(" OR ")
    );

    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let prior_purchases: i64 = stmt.query_row(param_refs.as_slice(), |row| row.get(0))?;
    Ok(prior_purchases == 0)
}

impl DuckDbBackend {
    /// Async wrapper over [`classify_customer_sync`] for callers outside
    /// the ingest path. `before` bounds the evidence: only purchases
    /// strictly earlier count as prior.
    pub async fn classify_customer(
        &self,
        tenant_id: &str,
        email: Option<&str>,
        visitor_id: Option<&str>,
        order_id: &str,
        before: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        classify_customer_sync(&conn, tenant_id, email, visitor_id, order_id, before)
    }
}
