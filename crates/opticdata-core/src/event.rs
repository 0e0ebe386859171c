//! Wire payloads for the public tracking endpoints.
//!
//! Keys are deliberately short — the pixel pays for every byte on
//! constrained networks. `rev` and `qty` may arrive as numbers or strings
//! depending on the merchant's data layer, so both are parsed defensively.

use serde::Deserialize;
use serde_json::Value;

/// Body of `POST /t/event`: one batch flushed by the browser tag.
#[derive(Debug, Clone, Deserialize)]
pub struct EventBatch {
    pub token: String,
    /// Anonymous id (400-day first-party cookie UUID).
    pub aid: String,
    /// Session id (1-day cookie, 30-min inactivity rollover).
    pub sid: String,
    /// Device fingerprint (djb2 hex).
    pub fp: Option<String>,
    /// Client clock at flush time, epoch millis.
    pub ts: Option<i64>,
    pub session: Option<SessionAttrs>,
    #[serde(default)]
    pub events: Vec<TrackedEvent>,
}

/// First-touch session attributes, sent with the first batch of a session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionAttrs {
    /// Referrer URL.
    #[serde(rename = "ref")]
    pub referrer: Option<String>,
    /// Landing page URL.
    pub lp: Option<String>,
    pub us: Option<String>,
    pub um: Option<String>,
    pub uc: Option<String>,
    /// utm_content.
    pub uo: Option<String>,
    /// utm_term.
    pub ut: Option<String>,
    pub fbc: Option<String>,
    pub gc: Option<String>,
    pub ttc: Option<String>,
    pub sc: Option<String>,
    pub msc: Option<String>,
    /// Device type: desktop | mobile | tablet.
    pub dt: Option<String>,
    pub br: Option<String>,
    pub os: Option<String>,
    pub sw: Option<Value>,
    pub sh: Option<Value>,
    pub tz: Option<String>,
    pub ln: Option<String>,
}

/// One tracked event inside a batch.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackedEvent {
    /// Event name, e.g. "PageView", "Purchase".
    pub n: String,
    /// Page URL.
    pub u: Option<String>,
    /// Page title.
    pub t: Option<String>,
    /// Referrer.
    pub r: Option<String>,
    /// Idempotency key supplied by the client.
    pub eid: Option<String>,
    /// Client timestamp, epoch millis.
    pub ts: Option<i64>,
    /// Event category.
    pub c: Option<String>,
    /// Order id for Purchase-like events.
    pub oid: Option<String>,
    /// Revenue — number or string.
    pub rev: Option<Value>,
    /// ISO currency code.
    pub cur: Option<String>,
    pub pids: Option<Vec<Value>>,
    pub pnames: Option<Vec<Value>>,
    /// Quantity — number or string.
    pub qty: Option<Value>,
    /// Free-form property bag.
    pub p: Option<Value>,
}

/// Body of `POST /t/identify`.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub aid: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub cid: Option<String>,
}

impl IdentifyPayload {
    pub fn has_identifier(&self) -> bool {
        non_empty(self.email.as_deref())
            || non_empty(self.phone.as_deref())
            || non_empty(self.cid.as_deref())
    }
}

fn non_empty(v: Option<&str>) -> bool {
    v.map(|s| !s.trim().is_empty()).unwrap_or(false)
}

/// Parse a monetary amount that may arrive as a JSON number or a string
/// like `"49.90"` or `" 49,90 "`. Returns `None` for anything unparseable.
pub fn parse_money(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => {
            let cleaned = s.trim().replace(',', ".");
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// Parse a quantity that may arrive as a JSON number or string.
pub fn parse_quantity(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|v| v as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Flatten a product-id/name list to strings, skipping non-scalar entries.
pub fn parse_string_list(values: Option<&Vec<Value>>) -> Vec<String> {
    values
        .map(|list| {
            list.iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revenue_parses_from_number_and_string() {
        assert_eq!(parse_money(Some(&json!(49.9))), Some(49.9));
        assert_eq!(parse_money(Some(&json!("49.90"))), Some(49.9));
        assert_eq!(parse_money(Some(&json!(" 49,90 "))), Some(49.9));
        assert_eq!(parse_money(Some(&json!("not money"))), None);
        assert_eq!(parse_money(Some(&json!({"a": 1}))), None);
        assert_eq!(parse_money(None), None);
    }

    #[test]
    fn quantity_parses_defensively() {
        assert_eq!(parse_quantity(Some(&json!(3))), Some(3));
        assert_eq!(parse_quantity(Some(&json!("3"))), Some(3));
        assert_eq!(parse_quantity(Some(&json!(2.0))), Some(2));
        assert_eq!(parse_quantity(Some(&json!([]))), None);
    }

    #[test]
    fn product_lists_keep_scalars_only() {
        let values = vec![json!("sku-1"), json!(42), json!({"bad": true})];
        assert_eq!(parse_string_list(Some(&values)), vec!["sku-1", "42"]);
    }

    #[test]
    fn batch_deserializes_short_keys() {
        let raw = json!({
            "token": "st_abc",
            "aid": "11111111-2222-3333-4444-555555555555",
            "sid": "s-1",
            "fp": "9f3a2b1c",
            "ts": 1720000000000_i64,
            "session": { "ref": "https://news.site/a", "lp": "https://shop.example/?gclid=x", "gc": "x", "dt": "mobile", "sw": 390, "sh": 844 },
            "events": [
                { "n": "PageView", "u": "https://shop.example/" },
                { "n": "Purchase", "oid": "ord-1", "rev": "120.50", "cur": "USD", "qty": "2", "eid": "evt-1" }
            ]
        });
        let batch: EventBatch = serde_json::from_value(raw).expect("batch parses");
        assert_eq!(batch.events.len(), 2);
        let purchase = &batch.events[1];
        assert_eq!(parse_money(purchase.rev.as_ref()), Some(120.5));
        assert_eq!(parse_quantity(purchase.qty.as_ref()), Some(2));
        let session = batch.session.expect("session attrs");
        assert_eq!(session.gc.as_deref(), Some("x"));
        assert_eq!(session.referrer.as_deref(), Some("https://news.site/a"));
    }

    #[test]
    fn identify_requires_at_least_one_identifier() {
        let none: IdentifyPayload = serde_json::from_value(json!({
            "token": "st_abc", "aid": "a", "email": "  "
        }))
        .expect("parses");
        assert!(!none.has_identifier());

        let some: IdentifyPayload = serde_json::from_value(json!({
            "token": "st_abc", "aid": "a", "cid": "cust-1"
        }))
        .expect("parses");
        assert!(some.has_identifier());
    }
}
