//! Identity-graph behaviour against a real in-memory DuckDB.

use chrono::Utc;
use serde_json::json;

use opticdata_core::event::{SessionAttrs, TrackedEvent};
use opticdata_duckdb::identity::{NewEvent, VisitorIdentifiers};
use opticdata_duckdb::DuckDbBackend;

const TENANT: &str = "t1";
const SITE: &str = "site_test";

fn idents_email(email: &str) -> VisitorIdentifiers {
    VisitorIdentifiers {
        email: Some(email.to_string()),
        ..Default::default()
    }
}

fn tagged_session(gclid: &str) -> SessionAttrs {
    SessionAttrs {
        gc: Some(gclid.to_string()),
        lp: Some("https://shop.example/?gclid=abc".to_string()),
        ..Default::default()
    }
}

fn purchase(order_id: &str, revenue: f64, event_id: Option<&str>) -> NewEvent {
    let wire: TrackedEvent = serde_json::from_value(json!({
        "n": "Purchase",
        "oid": order_id,
        "rev": revenue,
        "cur": "USD",
        "eid": event_id,
    }))
    .expect("wire event");
    NewEvent::from_wire(&wire, None)
}

async fn count(db: &DuckDbBackend, sql: &str) -> i64 {
    let conn = db.conn_for_test().await;
    let mut stmt = conn.prepare(sql).expect("prepare");
    stmt.query_row([], |row| row.get(0)).expect("count")
}

#[tokio::test]
async fn same_anonymous_id_resolves_to_one_row() {
    let db = DuckDbBackend::open_in_memory().expect("open");
    let now = Utc::now();

    let first = db
        .resolve_visitor(TENANT, SITE, "aaa", &VisitorIdentifiers::default(), now)
        .await
        .expect("resolve");
    let second = db
        .resolve_visitor(TENANT, SITE, "aaa", &VisitorIdentifiers::default(), now)
        .await
        .expect("resolve");

    assert_eq!(first, second);
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM visitors WHERE anonymous_id = 'aaa'").await,
        1
    );
}

#[tokio::test]
async fn tagged_session_creates_touchpoint_direct_does_not() {
    let db = DuckDbBackend::open_in_memory().expect("open");
    let now = Utc::now();
    let visitor = db
        .resolve_visitor(TENANT, SITE, "aaa", &VisitorIdentifiers::default(), now)
        .await
        .expect("resolve");

    let tagged = db
        .upsert_session(
            TENANT,
            &visitor,
            "sess-1",
            Some(&tagged_session("click-1")),
            Some("1.2.3.4"),
            Some("UA"),
            1,
            1,
            now,
        )
        .await
        .expect("session");
    assert!(tagged.is_new);
    assert!(tagged.touchpoint_id.is_some());

    let direct = db
        .upsert_session(TENANT, &visitor, "sess-2", None, None, None, 1, 1, now)
        .await
        .expect("session");
    assert!(direct.is_new);
    assert!(direct.touchpoint_id.is_none());

    // Re-touching an existing session never duplicates its touchpoint.
    let again = db
        .upsert_session(
            TENANT,
            &visitor,
            "sess-1",
            Some(&tagged_session("click-1")),
            None,
            None,
            1,
            1,
            now,
        )
        .await
        .expect("session");
    assert!(!again.is_new);
    assert_eq!(count(&db, "SELECT COUNT(*) FROM touchpoints").await, 1);

    let platform: String = {
        let conn = db.conn_for_test().await;
        let mut stmt = conn
            .prepare("SELECT platform FROM touchpoints LIMIT 1")
            .expect("prepare");
        stmt.query_row([], |row| row.get(0)).expect("platform")
    };
    assert_eq!(platform, "google");
}

#[tokio::test]
async fn merge_on_email_repoints_everything_to_current() {
    let db = DuckDbBackend::open_in_memory().expect("open");
    let now = Utc::now();

    // Visitor A arrives through an ad click: touchpoint P lands under A.
    let a = db
        .resolve_visitor(TENANT, SITE, "aaa", &VisitorIdentifiers::default(), now)
        .await
        .expect("resolve a");
    db.upsert_session(
        TENANT,
        &a,
        "sess-a",
        Some(&tagged_session("click-a")),
        None,
        None,
        1,
        1,
        now,
    )
    .await
    .expect("session a");
    db.resolve_visitor(TENANT, SITE, "aaa", &idents_email("x@y.com"), now)
        .await
        .expect("identify a");

    // Visitor B exists anonymously, then identifies with the same email.
    let b = db
        .resolve_visitor(TENANT, SITE, "bbb", &VisitorIdentifiers::default(), now)
        .await
        .expect("resolve b");
    let resolved = db
        .resolve_visitor(TENANT, SITE, "bbb", &idents_email("X@Y.com"), now)
        .await
        .expect("identify b");

    // The row in the active request wins: B stays canonical, A merges in.
    assert_eq!(resolved, b);
    let (a_canonical, merged_at): (Option<String>, Option<String>) = {
        let conn = db.conn_for_test().await;
        let mut stmt = conn
            .prepare(
                "SELECT canonical_id, CAST(merged_at AS VARCHAR) FROM visitors WHERE id = ?1",
            )
            .expect("prepare");
        stmt.query_row(opticdata_duckdb::duckdb::params![a], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .expect("a row")
    };
    assert_eq!(a_canonical.as_deref(), Some(b.as_str()));
    assert!(merged_at.is_some());

    // Touchpoint P followed the merge.
    let tp_visitor: String = {
        let conn = db.conn_for_test().await;
        let mut stmt = conn
            .prepare("SELECT visitor_id FROM touchpoints LIMIT 1")
            .expect("prepare");
        stmt.query_row([], |row| row.get(0)).expect("touchpoint")
    };
    assert_eq!(tp_visitor, b);

    // Audit row with the earliest matching reason.
    let reason: String = {
        let conn = db.conn_for_test().await;
        let mut stmt = conn
            .prepare(
                "SELECT merge_reason FROM identity_merges \
                 WHERE source_visitor_id = ?1 AND target_visitor_id = ?2",
            )
            .expect("prepare");
        stmt.query_row(opticdata_duckdb::duckdb::params![a, b], |row| row.get(0))
            .expect("merge log")
    };
    assert_eq!(reason, "email_match");

    // Re-entry via the merged anonymous id redirects to the canonical row.
    let via_old_aid = db
        .resolve_visitor(TENANT, SITE, "aaa", &VisitorIdentifiers::default(), now)
        .await
        .expect("re-resolve");
    assert_eq!(via_old_aid, b);
}

#[tokio::test]
async fn merges_never_leave_chains() {
    let db = DuckDbBackend::open_in_memory().expect("open");
    let now = Utc::now();

    // X is canonical with the email; Y already merged into X.
    let x = db
        .resolve_visitor(TENANT, SITE, "xxx", &idents_email("p@q.com"), now)
        .await
        .expect("x");
    let y_alias = db
        .resolve_visitor(TENANT, SITE, "yyy", &idents_email("p@q.com"), now)
        .await
        .expect("y");
    assert_eq!(y_alias, x);

    // Z arrives with the same email: X (and transitively Y's row) must
    // re-point to Z, with no pointer passing through X.
    let z = db
        .resolve_visitor(TENANT, SITE, "zzz", &VisitorIdentifiers::default(), now)
        .await
        .expect("z");
    let resolved = db
        .resolve_visitor(TENANT, SITE, "zzz", &idents_email("p@q.com"), now)
        .await
        .expect("z identify");
    assert_eq!(resolved, z);

    let chains = count(
        &db,
        "SELECT COUNT(*) FROM visitors v \
         JOIN visitors c ON c.id = v.canonical_id \
         WHERE c.canonical_id IS NOT NULL",
    )
    .await;
    assert_eq!(chains, 0, "canonical pointers must always hit canonical rows");

    let pointing_at_z = count(
        &db,
        "SELECT COUNT(*) FROM visitors WHERE canonical_id IS NOT NULL",
    )
    .await;
    assert_eq!(pointing_at_z, 2);
}

#[tokio::test]
async fn purchase_stamps_event_touchpoint_and_visitor() {
    let db = DuckDbBackend::open_in_memory().expect("open");
    let now = Utc::now();
    let visitor = db
        .resolve_visitor(TENANT, SITE, "aaa", &idents_email("buyer@shop.com"), now)
        .await
        .expect("resolve");
    db.upsert_session(
        TENANT,
        &visitor,
        "sess-1",
        Some(&tagged_session("click-1")),
        None,
        None,
        1,
        1,
        now,
    )
    .await
    .expect("session");

    let first = db
        .record_event(TENANT, &visitor, "sess-1", &purchase("ord-1", 100.0, None), now)
        .await
        .expect("purchase 1");
    assert!(first.inserted);
    assert_eq!(first.is_new_customer, Some(true));

    // The touchpoint converted with the order attached.
    let (converted, order_id, revenue): (bool, Option<String>, Option<f64>) = {
        let conn = db.conn_for_test().await;
        let mut stmt = conn
            .prepare("SELECT converted, order_id, revenue FROM touchpoints LIMIT 1")
            .expect("prepare");
        stmt.query_row([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .expect("touchpoint")
    };
    assert!(converted);
    assert_eq!(order_id.as_deref(), Some("ord-1"));
    assert_eq!(revenue, Some(100.0));

    // Visitor counters and first_order_date.
    let (total_revenue, first_order): (f64, Option<String>) = {
        let conn = db.conn_for_test().await;
        let mut stmt = conn
            .prepare(
                "SELECT total_revenue, CAST(first_order_date AS VARCHAR) \
                 FROM visitors WHERE id = ?1",
            )
            .expect("prepare");
        stmt.query_row(opticdata_duckdb::duckdb::params![visitor], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .expect("visitor")
    };
    assert_eq!(total_revenue, 100.0);
    assert!(first_order.is_some());

    // Session flagged as converting.
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM sessions WHERE has_conversion").await,
        1
    );

    // A second order from the same person is returning, not new.
    let second = db
        .record_event(TENANT, &visitor, "sess-1", &purchase("ord-2", 60.0, None), now)
        .await
        .expect("purchase 2");
    assert_eq!(second.is_new_customer, Some(false));
}

#[tokio::test]
async fn duplicate_event_id_inserts_once() {
    let db = DuckDbBackend::open_in_memory().expect("open");
    let now = Utc::now();
    let visitor = db
        .resolve_visitor(TENANT, SITE, "aaa", &VisitorIdentifiers::default(), now)
        .await
        .expect("resolve");
    db.upsert_session(TENANT, &visitor, "sess-1", None, None, None, 1, 1, now)
        .await
        .expect("session");

    let event = purchase("ord-1", 40.0, Some("evt-1"));
    let first = db
        .record_event(TENANT, &visitor, "sess-1", &event, now)
        .await
        .expect("first");
    let second = db
        .record_event(TENANT, &visitor, "sess-1", &event, now)
        .await
        .expect("second");

    assert!(first.inserted);
    assert!(!second.inserted);
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM events WHERE event_id = 'evt-1'").await,
        1
    );
}

#[tokio::test]
async fn classifier_matches_across_merged_identities_by_email() {
    let db = DuckDbBackend::open_in_memory().expect("open");
    let now = Utc::now();

    // First purchase under identity A.
    let a = db
        .resolve_visitor(TENANT, SITE, "aaa", &idents_email("same@person.com"), now)
        .await
        .expect("a");
    db.upsert_session(TENANT, &a, "sess-a", None, None, None, 1, 1, now)
        .await
        .expect("session a");
    db.record_event(TENANT, &a, "sess-a", &purchase("ord-1", 30.0, None), now)
        .await
        .expect("purchase a");

    let later = now + chrono::Duration::seconds(10);

    // A different, unmerged visitor with the same email: the email branch
    // alone must see A's purchase.
    let is_new = db
        .classify_customer(TENANT, Some("SAME@person.com"), None, "ord-2", later)
        .await
        .expect("classify");
    assert!(!is_new);

    // No identifiers at all: new by definition.
    assert!(db
        .classify_customer(TENANT, None, None, "ord-3", later)
        .await
        .expect("classify"));

    // The current order must not count as its own prior purchase.
    assert!(db
        .classify_customer(TENANT, Some("same@person.com"), Some(&a), "ord-1", later)
        .await
        .expect("classify"));
}
