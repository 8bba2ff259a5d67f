//! Generic persistence engine.
//!
//! [`PostgresPersistence`] stores entities of type `T` in one table. Entity
//! conversion is delegated to a [`Converter`] and table provisioning to an
//! optional [`SchemaDefinition`], both supplied at construction.
//!
//! Filter, sort and select arguments are raw SQL fragments inserted verbatim
//! into statements. They are trusted input and are never escaped or
//! parameterized; entity values are always bound as parameters.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut persistence = PostgresPersistence::new("dummies", RelationalConverter::<Dummy>::new())
//!     .with_schema(|schema: &mut SchemaManager| {
//!         schema.ensure_schema(r#"CREATE TABLE IF NOT EXISTS "dummies" ("id" TEXT PRIMARY KEY, "key" TEXT)"#);
//!     });
//! persistence.configure(&config);
//! persistence.open("123").await?;
//! let page = persistence
//!     .get_page_by_filter("123", Some("key='A'"), &PagingParams::new(Some(0), Some(10), true), None, None)
//!     .await?;
//! ```

use crate::config::{ConnectionParams, DEFAULT_MAX_PAGE_SIZE, PersistenceConfig, PoolOptions};
use crate::db::executor;
use crate::db::resolver::ConnectionResolver;
use crate::db::types::SqlValue;
use crate::db::PostgresConnection;
use crate::error::{DbError, DbResult};
use crate::persistence::converter::Converter;
use crate::persistence::paging::{DataPage, PagingParams};
use crate::persistence::query_builder::{ColumnTypes, Row, bind_row};
use crate::persistence::schema::{SchemaDefinition, SchemaManager, TableName};
use rand::Rng;
use sqlx::PgPool;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

/// Persistence of entities of type `T` in a PostgreSQL table.
pub struct PostgresPersistence<T, C> {
    table: TableName,
    max_page_size: i64,
    converter: C,
    definition: Option<Box<dyn SchemaDefinition>>,
    schema: SchemaManager,
    column_types: ColumnTypes,
    connection_params: ConnectionParams,
    pool_options: PoolOptions,
    resolver: Option<Arc<dyn ConnectionResolver>>,
    connection: Option<Arc<PostgresConnection>>,
    local_connection: bool,
    opened: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> PostgresPersistence<T, C>
where
    C: Converter<T>,
{
    pub fn new(table: impl Into<String>, converter: C) -> Self {
        let table = TableName::new(None, table);
        Self {
            schema: SchemaManager::new(table.clone()),
            table,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            converter,
            definition: None,
            column_types: ColumnTypes::default(),
            connection_params: ConnectionParams::default(),
            pool_options: PoolOptions::default(),
            resolver: None,
            connection: None,
            local_connection: false,
            opened: false,
            _marker: PhantomData,
        }
    }

    /// Set the hook that defines the table schema on open.
    pub fn with_schema(mut self, definition: impl SchemaDefinition + 'static) -> Self {
        self.definition = Some(Box::new(definition));
        self
    }

    /// Apply table, schema, paging and connection settings.
    pub fn configure(&mut self, config: &PersistenceConfig) {
        let table = config
            .table
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.table.table.clone());
        let schema = config.schema.clone().or_else(|| self.table.schema.clone());
        self.table = TableName::new(schema, table);
        self.max_page_size = config.max_page_size_or_default();
        self.connection_params = config.connection.clone();
        self.pool_options = config.options.clone();
    }

    /// Use a shared connection. A shared connection is never opened or closed here.
    pub fn set_connection(&mut self, connection: Arc<PostgresConnection>) {
        self.connection = Some(connection);
        self.local_connection = false;
    }

    /// Resolve connection strings with `resolver` when a local connection is created.
    pub fn set_resolver(&mut self, resolver: Arc<dyn ConnectionResolver>) {
        self.resolver = Some(resolver);
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Open the persistence: connect and create the table when it is missing.
    pub async fn open(&mut self, correlation_id: &str) -> DbResult<()> {
        if self.opened {
            return Ok(());
        }

        if self.table.table.is_empty() {
            return Err(DbError::invalid_state(
                correlation_id,
                "NO_TABLE",
                "Table name is not set",
            ));
        }

        if self.connection.is_none() {
            self.connection = Some(Arc::new(self.create_connection()));
            self.local_connection = true;
        }
        let Some(connection) = self.connection.clone() else {
            return Err(DbError::invalid_state(
                correlation_id,
                "NO_CONNECTION",
                "PostgreSQL connection is missing",
            ));
        };

        if self.local_connection {
            connection.open(correlation_id).await?;
        }

        if !connection.is_open().await {
            return Err(DbError::connection(
                correlation_id,
                "CONNECT_FAILED",
                "PostgreSQL connection is not opened",
            ));
        }

        let pool = self.connection_pool(&connection, correlation_id).await?;

        self.schema = SchemaManager::new(self.table.clone());
        self.schema.ensure_default_schema();
        if let Some(definition) = &self.definition {
            definition.define_schema(&mut self.schema);
        }
        self.schema
            .create_schema(&pool, correlation_id)
            .await
            .map_err(|e| open_failure(correlation_id, e))?;
        self.column_types = self
            .schema
            .load_column_types(&pool)
            .await
            .map_err(|e| open_failure(correlation_id, e))?;

        self.opened = true;
        debug!(correlation_id, table = %self.table, "Opened persistence");
        Ok(())
    }

    /// Close the persistence. Only a locally created connection is closed.
    pub async fn close(&mut self, correlation_id: &str) -> DbResult<()> {
        if !self.opened {
            return Ok(());
        }

        if self.local_connection {
            if let Some(connection) = &self.connection {
                connection.close(correlation_id).await?;
            }
        }

        self.opened = false;
        debug!(correlation_id, table = %self.table, "Closed persistence");
        Ok(())
    }

    fn create_connection(&self) -> PostgresConnection {
        match &self.resolver {
            Some(resolver) => {
                PostgresConnection::with_resolver(self.pool_options.clone(), resolver.clone())
            }
            None => PostgresConnection::from_params(
                self.connection_params.clone(),
                self.pool_options.clone(),
            ),
        }
    }

    async fn connection_pool(
        &self,
        connection: &PostgresConnection,
        correlation_id: &str,
    ) -> DbResult<PgPool> {
        connection.pool().await.ok_or_else(|| {
            DbError::invalid_state(
                correlation_id,
                "NO_CONNECTION",
                "PostgreSQL connection is missing",
            )
        })
    }

    /// Get the pool of an opened persistence.
    pub(crate) async fn pool(&self, correlation_id: &str) -> DbResult<PgPool> {
        if !self.opened {
            return Err(DbError::invalid_state(
                correlation_id,
                "NOT_OPENED",
                "Persistence is not opened",
            ));
        }
        match &self.connection {
            Some(connection) => self.connection_pool(connection, correlation_id).await,
            None => Err(DbError::invalid_state(
                correlation_id,
                "NO_CONNECTION",
                "PostgreSQL connection is missing",
            )),
        }
    }

    pub(crate) fn converter(&self) -> &C {
        &self.converter
    }

    /// Declared column types, loaded on open.
    pub(crate) fn column_types(&self) -> &ColumnTypes {
        &self.column_types
    }

    /// Run a write with `RETURNING *` and convert the row before committing.
    pub(crate) async fn write_one(
        &self,
        pool: &PgPool,
        query: &str,
        values: &[SqlValue],
    ) -> DbResult<Option<T>> {
        executor::write_returning(pool, query, values, |row| self.converter.from_row(row)).await
    }

    pub(crate) fn to_items(&self, rows: Vec<Row>) -> DbResult<Vec<T>> {
        rows.into_iter()
            .map(|row| self.converter.from_row(row))
            .collect()
    }

    pub(crate) fn to_item(&self, row: Option<Row>) -> DbResult<Option<T>> {
        row.map(|row| self.converter.from_row(row)).transpose()
    }

    pub fn table_name(&self) -> &str {
        &self.table.table
    }

    pub fn schema_name(&self) -> Option<&str> {
        self.table.schema.as_deref()
    }

    /// Quoted, schema-qualified table name for use in statements.
    pub fn quoted_table_name(&self) -> String {
        self.table.quoted()
    }

    pub fn max_page_size(&self) -> i64 {
        self.max_page_size
    }

    /// Database name of the underlying connection, empty when not connected.
    pub async fn database_name(&self) -> String {
        match &self.connection {
            Some(connection) => connection.database_name().await,
            None => String::new(),
        }
    }

    /// Get a page of items matching `filter`.
    ///
    /// When `paging.total` is set, the total is counted with a second,
    /// independent query.
    pub async fn get_page_by_filter(
        &self,
        correlation_id: &str,
        filter: Option<&str>,
        paging: &PagingParams,
        sort: Option<&str>,
        select: Option<&str>,
    ) -> DbResult<DataPage<T>> {
        let pool = self.pool(correlation_id).await?;

        let mut query = format!(
            "SELECT {} FROM {}{}{}",
            select_clause(select),
            self.quoted_table_name(),
            where_clause(filter),
            order_clause(sort)
        );
        if let Some(skip) = paging.skip() {
            query.push_str(&format!(" OFFSET {}", skip));
        }
        query.push_str(&format!(" LIMIT {}", paging.take(self.max_page_size)));

        let rows = executor::fetch_rows(&pool, &query, &[]).await?;
        let items = self.to_items(rows)?;

        trace!(correlation_id, count = items.len(), table = %self.table, "Retrieved {} from {}", items.len(), self.table);

        if !paging.total {
            return Ok(DataPage::new(items, None));
        }

        let query = format!(
            "SELECT COUNT(*) AS count FROM {}{}",
            self.quoted_table_name(),
            where_clause(filter)
        );
        let total = executor::fetch_count(&pool, &query).await?;
        Ok(DataPage::new(items, Some(total)))
    }

    /// Count items matching `filter`.
    pub async fn get_count_by_filter(
        &self,
        correlation_id: &str,
        filter: Option<&str>,
    ) -> DbResult<i64> {
        let pool = self.pool(correlation_id).await?;

        let query = format!(
            "SELECT COUNT(*) AS count FROM {}{}",
            self.quoted_table_name(),
            where_clause(filter)
        );
        let count = executor::fetch_count(&pool, &query).await?;

        trace!(correlation_id, count, table = %self.table, "Counted {} items in {}", count, self.table);
        Ok(count)
    }

    /// Get all items matching `filter`, without paging.
    pub async fn get_list_by_filter(
        &self,
        correlation_id: &str,
        filter: Option<&str>,
        sort: Option<&str>,
        select: Option<&str>,
    ) -> DbResult<Vec<T>> {
        let pool = self.pool(correlation_id).await?;

        let query = format!(
            "SELECT {} FROM {}{}{}",
            select_clause(select),
            self.quoted_table_name(),
            where_clause(filter),
            order_clause(sort)
        );
        let rows = executor::fetch_rows(&pool, &query, &[]).await?;
        let items = self.to_items(rows)?;

        trace!(correlation_id, count = items.len(), table = %self.table, "Retrieved {} from {}", items.len(), self.table);
        Ok(items)
    }

    /// Get a random item matching `filter`, `None` when nothing matches.
    ///
    /// The count and the fetch are separate queries; concurrent writes between
    /// them can shift the picked row or leave the offset past the end.
    pub async fn get_one_random(
        &self,
        correlation_id: &str,
        filter: Option<&str>,
    ) -> DbResult<Option<T>> {
        let pool = self.pool(correlation_id).await?;

        let query = format!(
            "SELECT COUNT(*) AS count FROM {}{}",
            self.quoted_table_name(),
            where_clause(filter)
        );
        let count = executor::fetch_count(&pool, &query).await?;
        if count <= 0 {
            trace!(correlation_id, table = %self.table, "Random item wasn't found from {}", self.table);
            return Ok(None);
        }

        let pos = rand::thread_rng().gen_range(0..count);
        let query = format!(
            "SELECT * FROM {}{} OFFSET {} LIMIT 1",
            self.quoted_table_name(),
            where_clause(filter),
            pos
        );
        let row = executor::fetch_optional(&pool, &query, &[]).await?;
        let item = self.to_item(row)?;

        if item.is_some() {
            trace!(correlation_id, table = %self.table, "Retrieved random item from {}", self.table);
        } else {
            trace!(correlation_id, table = %self.table, "Random item wasn't found from {}", self.table);
        }
        Ok(item)
    }

    /// Insert an item and return the stored row.
    pub async fn create(&self, correlation_id: &str, item: &T) -> DbResult<Option<T>> {
        let row = self.converter.to_row(item)?;
        self.insert(correlation_id, row, None).await
    }

    /// Insert a row. `key` overrides the bound value of the `id` column.
    pub(crate) async fn insert(
        &self,
        correlation_id: &str,
        mut row: Row,
        key: Option<SqlValue>,
    ) -> DbResult<Option<T>> {
        let pool = self.pool(correlation_id).await?;

        // Leave unset ids to the column default
        if key.is_none() && row.get("id").is_some_and(|id| id.is_null()) {
            row.remove("id");
        }

        let bound = bind_row(&row, &self.column_types, key.as_ref());
        let query = if row.is_empty() {
            format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING *",
                self.quoted_table_name()
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                self.quoted_table_name(),
                bound.columns,
                bound.parameters
            )
        };

        let item = self.write_one(&pool, &query, &bound.values).await?;

        trace!(correlation_id, table = %self.table, "Created in {}", self.table);
        Ok(item)
    }

    /// Delete items matching `filter`. Returns the number of deleted rows.
    pub async fn delete_by_filter(
        &self,
        correlation_id: &str,
        filter: Option<&str>,
    ) -> DbResult<u64> {
        let pool = self.pool(correlation_id).await?;

        let query = format!(
            "DELETE FROM {}{}",
            self.quoted_table_name(),
            where_clause(filter)
        );
        let count = executor::execute(&pool, &query, &[]).await?;

        trace!(correlation_id, count, table = %self.table, "Deleted {} items from {}", count, self.table);
        Ok(count)
    }

    /// Delete every row of the table.
    pub async fn clear(&self, correlation_id: &str) -> DbResult<()> {
        if self.table.table.is_empty() {
            return Err(DbError::invalid_state(
                correlation_id,
                "NO_TABLE",
                "Table name is not set",
            ));
        }
        let pool = self.pool(correlation_id).await?;

        let query = format!("DELETE FROM {}", self.quoted_table_name());
        executor::execute(&pool, &query, &[]).await?;

        debug!(correlation_id, table = %self.table, "Cleared {}", self.table);
        Ok(())
    }
}

impl<T, C> std::fmt::Debug for PostgresPersistence<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPersistence")
            .field("table", &self.table)
            .field("max_page_size", &self.max_page_size)
            .field("local_connection", &self.local_connection)
            .field("opened", &self.opened)
            .finish()
    }
}

/// Report a driver failure while preparing the table as a connection error.
fn open_failure(correlation_id: &str, err: DbError) -> DbError {
    match err {
        DbError::Query(source) => DbError::connection_caused_by(
            correlation_id,
            "CONNECT_FAILED",
            "Failed to create database objects",
            source,
        ),
        other => other,
    }
}

fn non_empty(fragment: Option<&str>) -> Option<&str> {
    fragment.map(str::trim).filter(|f| !f.is_empty())
}

pub(crate) fn where_clause(filter: Option<&str>) -> String {
    non_empty(filter)
        .map(|f| format!(" WHERE {}", f))
        .unwrap_or_default()
}

fn order_clause(sort: Option<&str>) -> String {
    non_empty(sort)
        .map(|s| format!(" ORDER BY {}", s))
        .unwrap_or_default()
}

fn select_clause(select: Option<&str>) -> &str {
    non_empty(select).unwrap_or("*")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::converter::RelationalConverter;
    use crate::persistence::query_builder::row_from_object;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Dummy {
        id: String,
        key: String,
    }

    #[test]
    fn test_clauses() {
        assert_eq!(where_clause(None), "");
        assert_eq!(where_clause(Some("  ")), "");
        assert_eq!(where_clause(Some("key='A'")), " WHERE key='A'");
        assert_eq!(order_clause(Some("key DESC")), " ORDER BY key DESC");
        assert_eq!(select_clause(None), "*");
        assert_eq!(select_clause(Some("id, key")), "id, key");
    }

    #[test]
    fn test_key_overrides_id() {
        let row = row_from_object(json!({"id": "x", "key": "A"})).unwrap();
        let key = SqlValue::Uuid(uuid::Uuid::nil());
        let types = ColumnTypes::new([("id", "uuid"), ("key", "text")]);
        let bound = bind_row(&row, &types, Some(&key));
        assert_eq!(bound.values, vec![key, SqlValue::String("A".to_string())]);
        assert_eq!(bound.parameters, "$1,$2");

        let bound = bind_row(&row, &types, None);
        assert_eq!(bound.values[0], SqlValue::String("x".to_string()));
        assert_eq!(bound.parameters, "$1::uuid,$2");
    }

    #[test]
    fn test_open_failure_wraps_driver_errors() {
        let err = open_failure("123", DbError::Query(sqlx::Error::RowNotFound));
        assert!(matches!(
            err,
            DbError::Connection {
                source: Some(_),
                ..
            }
        ));
        assert_eq!(err.code(), Some("CONNECT_FAILED"));

        let err = open_failure("123", DbError::conversion("bad row"));
        assert!(matches!(err, DbError::Conversion { .. }));
    }

    #[test]
    fn test_configure() {
        let mut persistence =
            PostgresPersistence::new("dummies", RelationalConverter::<Dummy>::new());
        assert_eq!(persistence.max_page_size(), DEFAULT_MAX_PAGE_SIZE);

        let config: PersistenceConfig = serde_json::from_value(json!({
            "collection": "other",
            "schema": "app",
            "max_page_size": 10,
        }))
        .unwrap();
        persistence.configure(&config);

        assert_eq!(persistence.table_name(), "other");
        assert_eq!(persistence.schema_name(), Some("app"));
        assert_eq!(persistence.quoted_table_name(), "\"app\".\"other\"");
        assert_eq!(persistence.max_page_size(), 10);

        // Unset values fall back to the default page size
        persistence.configure(&PersistenceConfig::default());
        assert_eq!(persistence.max_page_size(), DEFAULT_MAX_PAGE_SIZE);
        assert_eq!(persistence.table_name(), "other");
    }

    #[tokio::test]
    async fn test_operations_require_open() {
        let persistence = PostgresPersistence::new("dummies", RelationalConverter::<Dummy>::new());
        assert!(!persistence.is_open());

        let err = persistence
            .get_count_by_filter("123", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("NOT_OPENED"));
        assert_eq!(persistence.database_name().await, "");
    }

    #[tokio::test]
    async fn test_open_requires_table() {
        let mut persistence = PostgresPersistence::new("", RelationalConverter::<Dummy>::new());
        let err = persistence.open("123").await.unwrap_err();
        assert_eq!(err.code(), Some("NO_TABLE"));

        // Closing an unopened persistence is a no-op
        persistence.close("123").await.unwrap();
    }

    #[tokio::test]
    async fn test_open_without_connection_settings_fails() {
        let mut persistence =
            PostgresPersistence::new("dummies", RelationalConverter::<Dummy>::new());
        let err = persistence.open("123").await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(!persistence.is_open());
    }
}
