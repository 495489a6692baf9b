//! `SqliteStore` against a real database file.

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use etl_harness::config::Config;
use etl_harness::sqlite_store::SqliteStore;
use etl_harness::{db, migrate};
use etl_harness_core::extract::extract;
use etl_harness_core::schema::{evolve_schema, infer_and_merge};
use etl_harness_core::store::{CommitOutcome, QueryEvent, Store, UploadEvent};
use etl_harness_core::{FragmentType, Record};

async fn open_store() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("data/etl.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, SqliteStore::new(pool))
}

fn record(value: Value) -> Record {
    value.as_object().unwrap().clone()
}

fn records(values: Vec<Value>) -> Vec<Record> {
    values.into_iter().map(record).collect()
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (_tmp, store) = open_store().await;
    migrate::apply(store.pool()).await.unwrap();
    migrate::apply(store.pool()).await.unwrap();
}

#[tokio::test]
async fn insert_assigns_ids_and_keeps_order() {
    let (_tmp, store) = open_store().await;
    let inserted = store
        .insert_many(
            "json_data",
            records(vec![
                json!({"name": "a", "n": 3}),
                json!({"name": "b", "n": 1}),
                json!({"name": "c", "n": 2}),
            ]),
        )
        .await
        .unwrap();
    assert_eq!(inserted, 3);

    let all = store
        .find("json_data", &Record::new(), &Record::new(), usize::MAX)
        .await
        .unwrap();
    let names: Vec<_> = all.iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    for doc in &all {
        assert!(doc["_id"]["$oid"].is_string());
    }
    assert_ne!(all[0]["_id"], all[1]["_id"]);

    let other = store
        .find("csv_data", &Record::new(), &Record::new(), usize::MAX)
        .await
        .unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn find_filters_projects_and_limits() {
    let (_tmp, store) = open_store().await;
    store
        .insert_many(
            "csv_data",
            records(vec![
                json!({"city": "Rome", "pop": 2800}),
                json!({"city": "Oslo", "pop": 700}),
                json!({"city": "Lima", "pop": 9700}),
            ]),
        )
        .await
        .unwrap();

    let big = store
        .find(
            "csv_data",
            &record(json!({"pop": {"$gt": 1000}})),
            &record(json!({"_id": 0, "city": 1})),
            usize::MAX,
        )
        .await
        .unwrap();
    assert_eq!(
        big,
        records(vec![json!({"city": "Rome"}), json!({"city": "Lima"})])
    );

    let limited = store
        .find("csv_data", &Record::new(), &record(json!({"_id": 0})), 1)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0]["city"], "Rome");
}

#[tokio::test]
async fn aggregate_groups_and_sorts() {
    let (_tmp, store) = open_store().await;
    store
        .insert_many(
            "json_data",
            records(vec![
                json!({"team": "red", "score": 4}),
                json!({"team": "blue", "score": 7}),
                json!({"team": "red", "score": 5}),
            ]),
        )
        .await
        .unwrap();

    let totals = store
        .aggregate(
            "json_data",
            &[
                json!({"$group": {"_id": "$team", "total": {"$sum": "$score"}}}),
                json!({"$sort": {"total": -1}}),
            ],
            usize::MAX,
        )
        .await
        .unwrap();
    assert_eq!(
        totals,
        records(vec![
            json!({"_id": "red", "total": 9}),
            json!({"_id": "blue", "total": 7}),
        ])
    );

    let err = store
        .aggregate("json_data", &[json!({"$bogus": {}})], usize::MAX)
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn commit_schema_is_conditional_on_version() {
    let (_tmp, store) = open_store().await;
    let fragments = extract(r#"{"id": 1, "name": "first"}"#);
    let v1 = infer_and_merge("src", &fragments, None, Utc::now());

    assert_eq!(
        store.commit_schema(&v1, None).await.unwrap(),
        CommitOutcome::Committed
    );
    // A second "first commit" loses.
    assert_eq!(
        store.commit_schema(&v1, None).await.unwrap(),
        CommitOutcome::VersionConflict { found: Some(1) }
    );

    let v2 = infer_and_merge("src", &fragments, Some(&v1), Utc::now());
    assert_eq!(
        store.commit_schema(&v2, Some(1)).await.unwrap(),
        CommitOutcome::Committed
    );
    // Stale writer still expects version 1.
    assert_eq!(
        store.commit_schema(&v2, Some(1)).await.unwrap(),
        CommitOutcome::VersionConflict { found: Some(2) }
    );

    let current = store.read_schema("src").await.unwrap().unwrap();
    assert_eq!(current.version, 2);
    let history: Vec<u64> = store
        .schema_history("src")
        .await
        .unwrap()
        .iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(history, vec![1, 2]);

    assert!(store.read_schema("other").await.unwrap().is_none());
    assert!(store.schema_history("other").await.unwrap().is_empty());
}

#[tokio::test]
async fn evolve_schema_round_trips_through_sqlite() {
    let (_tmp, store) = open_store().await;
    let first = extract(r#"{"id": 1, "price": 10}"#);
    let second = extract(r#"{"id": 2, "price": "ten", "note": "late"}"#);

    evolve_schema(&store, "shop", &first).await.unwrap();
    let schema = evolve_schema(&store, "shop", &second).await.unwrap();

    assert_eq!(schema.version, 2);
    let fields = &schema.collections["json_data"].fields;
    assert_eq!(
        serde_json::to_value(&fields["price"]).unwrap()["type"],
        "string"
    );
    assert!(fields["id"].required);
    assert!(!fields["note"].required);
    assert!(schema.data_types_present.contains(&FragmentType::Json));

    let stored = store.read_schema("shop").await.unwrap().unwrap();
    assert_eq!(stored, schema);
}

#[tokio::test]
async fn logs_are_newest_first_per_source() {
    let (_tmp, store) = open_store().await;
    for (i, source) in ["a", "b", "a"].iter().enumerate() {
        store
            .log_upload(&UploadEvent {
                source_id: source.to_string(),
                filename: format!("file{}.txt", i),
                uploaded_at: Utc::now(),
                content_hash: "00".to_string(),
                fragment_count: 1,
                record_count: 1,
                data_types: vec![FragmentType::Json],
                schema_version: i as u64 + 1,
            })
            .await
            .unwrap();
        store
            .log_query(&QueryEvent {
                source_id: source.to_string(),
                query_type: "DB".to_string(),
                query_text: format!("q{}", i),
                executed_query: None,
                result_count: 0,
                error: None,
                executed_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let uploads: Vec<_> = store
        .uploads("a")
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.filename)
        .collect();
    assert_eq!(uploads, vec!["file2.txt", "file0.txt"]);

    let queries: Vec<_> = store
        .queries("b")
        .await
        .unwrap()
        .into_iter()
        .map(|q| q.query_text)
        .collect();
    assert_eq!(queries, vec!["q1"]);
}

#[tokio::test]
async fn scoped_reads_only_see_their_source() {
    let (_tmp, store) = open_store().await;
    store
        .insert_many(
            "json_data",
            records(vec![
                json!({"_source_id": "north", "item": "axe", "qty": 2}),
                json!({"_source_id": "south", "item": "rope", "qty": 9}),
                json!({"_source_id": "north", "item": "tent", "qty": 5}),
                json!({"item": "unscoped", "qty": 1}),
            ]),
        )
        .await
        .unwrap();

    let scoped = record(json!({"$and": [{"_source_id": "north"}, {"qty": {"$gt": 1}}]}));
    let found = store
        .find("json_data", &scoped, &record(json!({"_id": 0, "item": 1})), usize::MAX)
        .await
        .unwrap();
    assert_eq!(
        found,
        records(vec![json!({"item": "axe"}), json!({"item": "tent"})])
    );

    let counted = store
        .aggregate(
            "json_data",
            &[
                json!({"$match": {"_source_id": "south"}}),
                json!({"$count": "n"}),
            ],
            usize::MAX,
        )
        .await
        .unwrap();
    assert_eq!(counted, records(vec![json!({"n": 1})]));

    // No pinned source: the whole collection is scanned.
    let everything = store
        .find("json_data", &record(json!({"qty": {"$gte": 1}})), &Record::new(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(everything.len(), 4);
}

#[tokio::test]
async fn legacy_records_table_gains_a_backfilled_source_column() {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_db_path(tmp.path().join("data/etl.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    sqlx::query(
        "CREATE TABLE records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            collection TEXT NOT NULL,
            body_json TEXT NOT NULL
        )",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO records (id, collection, body_json) VALUES (?, ?, ?)")
        .bind("old1")
        .bind("json_data")
        .bind(r#"{"_id": {"$oid": "old1"}, "_source_id": "legacy", "v": 1}"#)
        .execute(&pool)
        .await
        .unwrap();

    migrate::apply(&pool).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let store = SqliteStore::new(pool);
    let found = store
        .find(
            "json_data",
            &record(json!({"_source_id": "legacy"})),
            &record(json!({"_id": 0, "v": 1})),
            usize::MAX,
        )
        .await
        .unwrap();
    assert_eq!(found, records(vec![json!({"v": 1})]));
}
