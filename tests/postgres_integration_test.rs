// ABOUTME: Integration tests against a live PostgreSQL with wal_level=logical
// ABOUTME: Covers the catalog, the session, the test_decoding slot and a full sync lifecycle

use document_replicator::node::Node;
use document_replicator::postgres::{self, PgCatalog, PgReplicationSource, PgSession};
use document_replicator::schema::{CachedCatalog, SchemaCatalog};
use document_replicator::sink::MemorySink;
use document_replicator::sync::{JobContext, MemoryBuffer, MemoryCheckpointStore, SyncJob, SyncOptions};
use serde_json::json;
use std::env;
use std::sync::Arc;

/// Helper to get the test database URL from the environment
fn get_source_url() -> Option<String> {
    env::var("TEST_SOURCE_URL").ok()
}

async fn setup_tables(client: &tokio_postgres::Client, prefix: &str) -> anyhow::Result<()> {
    client
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS "public"."{p}_book" CASCADE;
            DROP TABLE IF EXISTS "public"."{p}_publisher" CASCADE;
            CREATE TABLE "public"."{p}_publisher" (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE "public"."{p}_book" (
                isbn TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                price NUMERIC(6, 2),
                publisher_id INTEGER REFERENCES "public"."{p}_publisher" (id)
            );
            INSERT INTO "public"."{p}_publisher" VALUES (1, 'Tiger publishing');
            INSERT INTO "public"."{p}_book" VALUES
                ('abc', 'The Tiger Club', 9.99, 1),
                ('def', 'The Lion Club', NULL, NULL);
            "#,
            p = prefix
        ))
        .await?;
    Ok(())
}

async fn cleanup(client: &tokio_postgres::Client, prefix: &str, slot: &str) {
    let _ = client
        .execute(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await;
    let _ = client
        .batch_execute(&format!(
            r#"DROP TABLE IF EXISTS "public"."{p}_book" CASCADE;
               DROP TABLE IF EXISTS "public"."{p}_publisher" CASCADE;"#,
            p = prefix
        ))
        .await;
}

#[tokio::test]
#[ignore]
async fn test_catalog_describes_keys() {
    let source_url = get_source_url().expect("TEST_SOURCE_URL must be set");
    let client = postgres::connect(&source_url).await.expect("Failed to connect to source");
    setup_tables(&client, "catalog").await.expect("Failed to setup test tables");

    let catalog = PgCatalog::new(Arc::new(client), "public");
    let book = catalog
        .describe_table("catalog_book")
        .await
        .expect("Failed to describe table")
        .expect("Table should exist");

    assert_eq!(book.column_names(), vec!["isbn", "title", "price", "publisher_id"]);
    assert_eq!(book.primary_key, vec!["isbn"]);
    assert_eq!(book.foreign_keys.len(), 1);
    assert_eq!(book.foreign_keys[0].referenced_table, "catalog_publisher");
    assert_eq!(book.foreign_keys[0].columns, vec!["publisher_id"]);
    assert!(catalog.describe_table("catalog_missing").await.unwrap().is_none());

    let admin = postgres::connect(&source_url).await.unwrap();
    cleanup(&admin, "catalog", "").await;
}

#[tokio::test]
#[ignore]
async fn test_full_lifecycle_over_logical_slot() {
    let source_url = get_source_url().expect("TEST_SOURCE_URL must be set");
    let admin = postgres::connect(&source_url).await.expect("Failed to connect to source");
    let prefix = "lifecycle";
    let slot = "replicator_it_lifecycle";
    cleanup(&admin, prefix, slot).await;
    setup_tables(&admin, prefix).await.expect("Failed to setup test tables");

    let catalog = Arc::new(CachedCatalog::new(PgCatalog::new(
        Arc::new(postgres::connect(&source_url).await.unwrap()),
        "public",
    )));
    let node = Node::from_value(&json!({
        "table": "lifecycle_book",
        "columns": ["isbn", "title", "price"],
        "children": [{"table": "lifecycle_publisher", "columns": ["name"]}]
    }))
    .unwrap();
    let schema = catalog.load(&node.tables()).await.unwrap();

    let sink = Arc::new(MemorySink::new());
    let mut options = SyncOptions::new("books");
    options.slot_name = slot.to_string();
    let ctx = JobContext {
        session: Box::new(PgSession::new(postgres::connect(&source_url).await.unwrap(), "public")),
        source: Arc::new(PgReplicationSource::new(
            postgres::connect(&source_url).await.unwrap(),
            "public",
            catalog.clone(),
        )),
        buffer: Arc::new(MemoryBuffer::new()),
        sink: sink.clone(),
        checkpoints: Arc::new(MemoryCheckpointStore::new()),
    };
    let mut job = SyncJob::new(&node, &schema, options, ctx).expect("Node should validate");

    let stats = job.full_resync().await.expect("Full resync failed");
    assert_eq!(stats.upserted, 2);
    let abc = sink.get("books", "abc").unwrap();
    assert_eq!(abc.source["price"], json!("9.99"));
    assert_eq!(abc.source["lifecycle_publisher"], json!({"name": "Tiger publishing"}));
    assert_eq!(sink.get("books", "def").unwrap().source["lifecycle_publisher"], json!({}));

    admin
        .batch_execute(
            r#"UPDATE "public"."lifecycle_book" SET isbn = 'cba' WHERE isbn = 'abc';
               UPDATE "public"."lifecycle_publisher" SET name = 'Tiger press' WHERE id = 1;
               DELETE FROM "public"."lifecycle_book" WHERE isbn = 'def';"#,
        )
        .await
        .unwrap();

    let stats = job.receive_once().await.expect("Receive cycle failed");
    assert!(stats.changes >= 3, "expected the slot to report 3 changes, got {}", stats.changes);
    assert!(sink.get("books", "abc").is_none());
    assert!(sink.get("books", "def").is_none());
    assert_eq!(
        sink.get("books", "cba").unwrap().source["lifecycle_publisher"],
        json!({"name": "Tiger press"})
    );

    // Nothing new: the next cycle writes nothing
    let idle = job.receive_once().await.expect("Idle cycle failed");
    assert_eq!(idle.mutations(), 0);

    println!("✓ Full lifecycle over slot {} converged", slot);
    cleanup(&admin, prefix, slot).await;
}
