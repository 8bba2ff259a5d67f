//! Integration tests for connection lifecycle and sharing.

mod common;

use common::{CORRELATION_ID, Dummy, persistence_config, test_url};
use pg_persistence::config::{ConnectionParams, PoolOptions};
use pg_persistence::db::{PostgresConnection, SqlValue, executor};
use pg_persistence::persistence::{PostgresPersistence, RelationalConverter, SchemaManager};
use pg_persistence::DbError;
use std::sync::Arc;

#[tokio::test]
async fn test_open_close() {
    let Some(url) = test_url() else { return };

    let connection = PostgresConnection::from_params(
        ConnectionParams::from_uri(url),
        PoolOptions::default(),
    );
    assert!(!connection.is_open().await);

    connection.open(CORRELATION_ID).await.unwrap();
    assert!(connection.is_open().await);
    assert!(!connection.database_name().await.is_empty());

    // Opening twice is a no-op
    connection.open(CORRELATION_ID).await.unwrap();

    connection.close(CORRELATION_ID).await.unwrap();
    assert!(!connection.is_open().await);
    assert_eq!(connection.database_name().await, "");

    // Closing twice is a no-op
    connection.close(CORRELATION_ID).await.unwrap();
}

#[tokio::test]
async fn test_shared_connection_stays_open() {
    let Some(url) = test_url() else { return };

    let connection = Arc::new(PostgresConnection::from_params(
        ConnectionParams::from_uri(url.clone()),
        PoolOptions::default(),
    ));

    // A persistence does not open a shared connection itself
    let mut persistence =
        PostgresPersistence::new("dummies_shared", RelationalConverter::<Dummy>::new());
    persistence.configure(&persistence_config(&url, "dummies_shared"));
    persistence.set_connection(connection.clone());
    let err = persistence.open(CORRELATION_ID).await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));

    connection.open(CORRELATION_ID).await.unwrap();
    persistence.open(CORRELATION_ID).await.unwrap();
    assert!(persistence.is_open());
    assert_eq!(
        persistence.database_name().await,
        connection.database_name().await
    );

    // Closing the persistence leaves the shared connection open
    persistence.close(CORRELATION_ID).await.unwrap();
    assert!(!persistence.is_open());
    assert!(connection.is_open().await);

    connection.close(CORRELATION_ID).await.unwrap();
}

async fn table_exists(connection: &PostgresConnection, table: &str) -> bool {
    let pool = connection.pool().await.unwrap();
    let row = executor::fetch_optional(
        &pool,
        "SELECT to_regclass($1)::text AS regclass",
        &[SqlValue::String(format!("\"{}\"", table))],
    )
    .await
    .unwrap()
    .unwrap();
    !row["regclass"].is_null()
}

#[tokio::test]
async fn test_missing_table_is_created_on_open() {
    let Some(url) = test_url() else { return };

    let connection = Arc::new(PostgresConnection::from_params(
        ConnectionParams::from_uri(url.clone()),
        PoolOptions::default(),
    ));
    connection.open(CORRELATION_ID).await.unwrap();
    let pool = connection.pool().await.unwrap();

    let table = "dummies_bootstrap";
    let marker = "dummies_bootstrap_marker";
    executor::execute(&pool, &format!("DROP TABLE IF EXISTS \"{}\"", table), &[])
        .await
        .unwrap();
    executor::execute(&pool, &format!("DROP TABLE IF EXISTS \"{}\"", marker), &[])
        .await
        .unwrap();
    assert!(!table_exists(&connection, table).await);

    let mut persistence = PostgresPersistence::new(table, RelationalConverter::<Dummy>::new())
        .with_schema(|schema: &mut SchemaManager| {
            // A failing statement does not stop the rest
            schema.ensure_schema("CREATE TABLE broken (");
            schema.ensure_schema(format!(
                "CREATE TABLE IF NOT EXISTS {} (\"id\" TEXT PRIMARY KEY, \"key\" TEXT, \"content\" TEXT)",
                schema.table().quoted()
            ));
        });
    persistence.configure(&persistence_config(&url, table));
    persistence.set_connection(connection.clone());
    persistence.open(CORRELATION_ID).await.unwrap();
    assert!(table_exists(&connection, table).await);
    assert_eq!(
        persistence.get_count_by_filter(CORRELATION_ID, None).await.unwrap(),
        0
    );
    persistence.close(CORRELATION_ID).await.unwrap();

    // Statements are skipped once the table exists
    let mut reopened = PostgresPersistence::new(table, RelationalConverter::<Dummy>::new())
        .with_schema(move |schema: &mut SchemaManager| {
            schema.ensure_schema(format!("CREATE TABLE \"{}\" (\"id\" TEXT)", marker));
        });
    reopened.configure(&persistence_config(&url, table));
    reopened.set_connection(connection.clone());
    reopened.open(CORRELATION_ID).await.unwrap();
    assert!(!table_exists(&connection, marker).await);
    reopened.close(CORRELATION_ID).await.unwrap();

    connection.close(CORRELATION_ID).await.unwrap();
}

#[tokio::test]
async fn test_schema_check_failure_is_connection_error() {
    let Some(url) = test_url() else { return };

    // The server rejects NUL bytes in text, so the existence check fails
    let table = "broken\0table";
    let mut persistence = PostgresPersistence::new(table, RelationalConverter::<Dummy>::new())
        .with_schema(|schema: &mut SchemaManager| {
            schema.ensure_schema("CREATE TABLE never_created (\"id\" TEXT)");
        });
    persistence.configure(&persistence_config(&url, table));

    let err = persistence.open(CORRELATION_ID).await.unwrap_err();
    assert!(matches!(
        err,
        DbError::Connection {
            source: Some(_),
            ..
        }
    ));
    assert_eq!(err.code(), Some("CONNECT_FAILED"));
    assert!(!persistence.is_open());
}
