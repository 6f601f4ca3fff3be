mod support;

use std::sync::Arc;

use corelib::time::to_millis;
use corelib::{NewAlert, Symbol, TimeRange};
use serde_json::json;
use tokio::task::JoinSet;
use tracing_test::traced_test;

use support::{bar, factor, minute, setup_db};
use surveillance::store::{
    AlertOrder, AlertQuery, AlertSink, AppendOutcome, SqlStore, TableLoader, TimeSeriesStore,
};

fn alert(sym: &str, m: i64, rule: &str, score: f64) -> NewAlert {
    let details = json!({ "spread_bp": score }).as_object().cloned().unwrap();
    NewAlert::new(sym.into(), minute(m), rule, score, details)
}

#[tokio::test]
async fn migrate_is_repeatable() {
    let db = setup_db().await;
    db.migrate().await.unwrap();
    db.migrate().await.unwrap();
}

#[tokio::test]
async fn series_reads_are_ordered_and_range_filtered() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    store
        .replace_bars(&[bar("BBB", 2, 3.0), bar("AAA", 1, 1.0), bar("BBB", 0, 2.0), bar("BBB", 1, 2.5)])
        .await
        .unwrap();

    let all = store.bars(&"BBB".into(), TimeRange::all()).await.unwrap();
    assert_eq!(all.iter().map(|b| b.close).collect::<Vec<_>>(), vec![2.0, 2.5, 3.0]);

    // half-open: [1, 2)
    let window = store
        .bars(&"BBB".into(), TimeRange::between(minute(1), minute(2)))
        .await
        .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].timestamp, minute(1));

    let recent = store.recent_bars(&"BBB".into(), 2).await.unwrap();
    assert_eq!(recent.iter().map(|b| b.close).collect::<Vec<_>>(), vec![3.0, 2.5]);
}

#[tokio::test]
async fn factors_round_trip_optional_columns() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    let mut f = factor("AAA", 0, 0.5);
    f.vol_5m = Some(0.01);
    f.fair_value = None;
    store.replace_factors(&[f.clone()]).await.unwrap();

    let back = store.factors(&"AAA".into(), TimeRange::all()).await.unwrap();
    assert_eq!(back, vec![f]);
}

#[tokio::test]
async fn load_batch_groups_rows_by_symbol() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    store.replace_bars(&[bar("AAA", 0, 1.0), bar("BBB", 0, 2.0)]).await.unwrap();
    store
        .replace_factors(&[factor("AAA", 0, 0.5), factor("BBB", 0, 1.5), factor("CCC", 0, 0.1)])
        .await
        .unwrap();

    let loaded = store.load_batch(TimeRange::all()).await.unwrap();
    assert_eq!(loaded.malformed_rows, 0);
    assert_eq!(loaded.batch.len(), 3);
    assert_eq!(loaded.batch.get("AAA").unwrap().bars.len(), 1);
    assert!(loaded.batch.get("CCC").unwrap().bars.is_empty());

    let symbols = store.symbols().await.unwrap();
    assert_eq!(
        symbols,
        vec![Symbol::from("AAA"), Symbol::from("BBB"), Symbol::from("CCC")]
    );
}

#[tokio::test]
async fn bars_before_returns_the_latest_rows_per_symbol() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    let mut bars: Vec<_> = (0..6).map(|m| bar("AAA", m, m as f64)).collect();
    bars.push(bar("BBB", 1, 10.0));
    bars.push(bar("BBB", 5, 11.0));
    store.replace_bars(&bars).await.unwrap();

    let history = store.bars_before(minute(4), 2).await.unwrap();
    assert_eq!(
        history
            .iter()
            .map(|b| (b.symbol.as_str(), b.timestamp))
            .collect::<Vec<_>>(),
        vec![("AAA", minute(2)), ("AAA", minute(3)), ("BBB", minute(1))]
    );

    let loaded = store
        .load_batch_with_history(TimeRange::since(minute(4)), 2)
        .await
        .unwrap();
    let closes: Vec<f64> = loaded.batch.get("AAA").unwrap().bars.iter().map(|b| b.close).collect();
    assert_eq!(closes, vec![2.0, 3.0, 4.0, 5.0]);
    assert_eq!(loaded.batch.get("BBB").unwrap().bars.len(), 2);
}

#[tokio::test]
async fn batch_replace_discards_previous_contents() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    store.replace_bars(&[bar("AAA", 0, 1.0), bar("AAA", 1, 1.0)]).await.unwrap();
    let written = store.replace_bars(&[bar("ZZZ", 0, 5.0)]).await.unwrap();
    assert_eq!(written, 1);

    assert!(store.bars(&"AAA".into(), TimeRange::all()).await.unwrap().is_empty());
    assert_eq!(store.symbols().await.unwrap(), vec![Symbol::from("ZZZ")]);
}

#[tokio::test]
#[traced_test]
async fn poison_rows_are_skipped_and_counted() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    store.replace_bars(&[bar("AAA", 0, 1.0)]).await.unwrap();

    // far beyond any representable timestamp
    sqlx::query(
        "INSERT INTO fact_bars_1m (symbol, ts_ms, open, high, low, close, volume) \
         VALUES ('AAA', 8000000000000000000, 1, 1, 1, 1, 1)",
    )
    .execute(&db.pool)
    .await
    .unwrap();

    let loaded = store.load_batch(TimeRange::all()).await.unwrap();
    assert_eq!(loaded.malformed_rows, 1);
    assert_eq!(loaded.batch.get("AAA").unwrap().bars.len(), 1);
    assert!(logs_contain("skipping malformed row"));
}

#[tokio::test]
async fn append_is_deduplicated_on_key() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    let batch = vec![alert("BBB", 0, "wide_spread", 1.5), alert("BBB", 1, "wide_spread", 2.0)];

    let first = store.append(&batch).await.unwrap();
    assert_eq!(first, AppendOutcome { inserted: 2, duplicates: 0 });

    let again = store.append(&batch).await.unwrap();
    assert_eq!(again, AppendOutcome { inserted: 0, duplicates: 2 });

    // same (symbol, ts) under another rule is a different observation
    let other_rule = store
        .append(&[alert("BBB", 0, "return_spike", 3.1)])
        .await
        .unwrap();
    assert_eq!(other_rule.inserted, 1);

    let rows = store.query(&AlertQuery::default()).await.unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn stored_alert_round_trips() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    let a = alert("BBB", 0, "wide_spread", 1.5);
    store.append(std::slice::from_ref(&a)).await.unwrap();

    let rows = store.query(&AlertQuery::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key(), a.key());
    assert_eq!(rows[0].score, 1.5);
    assert_eq!(rows[0].details_text(), r#"{"spread_bp":1.5}"#);

    let raw: (i64,) = sqlx::query_as("SELECT ts_ms FROM surveillance_alerts")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(raw.0, to_millis(minute(0)));
}

#[tokio::test]
async fn query_orders_filters_and_limits() {
    let db = setup_db().await;
    let store = SqlStore::from_db(&db);

    store
        .append(&[
            alert("AAA", 0, "wide_spread", 1.0),
            alert("AAA", 1, "wide_spread", 3.0),
            alert("BBB", 2, "wide_spread", 2.0),
        ])
        .await
        .unwrap();

    let newest_first = store.query(&AlertQuery::default()).await.unwrap();
    assert_eq!(
        newest_first.iter().map(|a| a.score).collect::<Vec<_>>(),
        vec![2.0, 3.0, 1.0]
    );

    let top = store
        .query(&AlertQuery::default().ordered_by(AlertOrder::ScoreDesc).limit(2))
        .await
        .unwrap();
    assert_eq!(top.iter().map(|a| a.score).collect::<Vec<_>>(), vec![3.0, 2.0]);

    let aaa_since = store
        .query(
            &AlertQuery::default()
                .for_symbol("AAA")
                .in_range(TimeRange::since(minute(1))),
        )
        .await
        .unwrap();
    assert_eq!(aaa_since.len(), 1);
    assert_eq!(aaa_since[0].score, 3.0);
}

#[tokio::test]
async fn concurrent_appends_record_each_key_once() {
    let db = setup_db().await;
    let store = Arc::new(SqlStore::from_db(&db));
    let batch: Vec<NewAlert> = (0..5).map(|m| alert("AAA", m, "wide_spread", 1.0)).collect();

    let mut set = JoinSet::new();
    for _ in 0..4 {
        let store = store.clone();
        let batch = batch.clone();
        set.spawn(async move { store.append(&batch).await });
    }

    let mut inserted = 0;
    let mut duplicates = 0;
    while let Some(res) = set.join_next().await {
        // sqlite may report a busy shared-cache lock; a failed append records nothing
        if let Ok(Ok(outcome)) = res {
            inserted += outcome.inserted;
            duplicates += outcome.duplicates;
        }
    }

    assert!(inserted <= 5);
    let rows = store.query(&AlertQuery::default()).await.unwrap();
    assert_eq!(rows.len(), inserted);
    assert_eq!((inserted + duplicates) % 5, 0);
}
