//! Schema bootstrap.
//!
//! DDL statements are queued in a [`SchemaManager`] while a persistence
//! instance opens. They are executed only when the target table does not
//! exist yet; an existing table is never diffed or migrated.

use crate::db::executor;
use crate::db::types::SqlValue;
use crate::error::DbResult;
use crate::persistence::query_builder::{ColumnTypes, quote_identifier};
use sqlx::PgPool;
use tracing::{debug, error};

pub const DEFAULT_ID_COLUMN_TYPE: &str = "TEXT";
pub const DEFAULT_DATA_COLUMN_TYPE: &str = "JSONB";

/// A table name, optionally qualified by a schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.filter(|s| !s.is_empty()),
            table: table.into(),
        }
    }

    /// Quoted, schema-qualified name, e.g. `"app"."dummies"`.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!(
                "{}.{}",
                quote_identifier(schema),
                quote_identifier(&self.table)
            ),
            None => quote_identifier(&self.table),
        }
    }

    /// Qualify another object name (e.g. an index) with this table's schema.
    pub fn qualify(&self, name: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(name)),
            None => quote_identifier(name),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => f.write_str(&self.table),
        }
    }
}

/// One key of an index, in declaration order.
///
/// The key is inserted as written, so expressions like `(data->'key')` work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub key: String,
    pub descending: bool,
}

impl IndexKey {
    pub fn asc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            descending: false,
        }
    }

    pub fn desc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub unique: bool,
    /// Index method, e.g. `USING GIN`
    pub index_type: Option<String>,
}

impl IndexOptions {
    pub fn unique() -> Self {
        Self {
            unique: true,
            index_type: None,
        }
    }
}

/// Pending DDL statements for one table.
#[derive(Debug, Clone, Default)]
pub struct SchemaManager {
    table: TableName,
    statements: Vec<String>,
}

impl SchemaManager {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            statements: Vec::new(),
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Queue a DDL statement. Statements are not deduplicated.
    pub fn ensure_schema(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }

    /// Queue a `CREATE INDEX IF NOT EXISTS` statement.
    pub fn ensure_index(&mut self, name: &str, keys: &[IndexKey], options: IndexOptions) {
        let mut builder = String::from("CREATE");
        if options.unique {
            builder.push_str(" UNIQUE");
        }
        builder.push_str(" INDEX IF NOT EXISTS ");
        builder.push_str(&self.table.qualify(name));
        builder.push_str(" ON ");
        builder.push_str(&self.table.quoted());
        if let Some(index_type) = options.index_type.as_deref().filter(|t| !t.is_empty()) {
            builder.push(' ');
            builder.push_str(index_type);
        }

        let fields = keys
            .iter()
            .map(|k| {
                if k.descending {
                    format!("{} DESC", k.key)
                } else {
                    k.key.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        builder.push_str(" (");
        builder.push_str(&fields);
        builder.push(')');

        self.ensure_schema(builder);
    }

    /// Queue the two-column `(id, data)` table used by document storage.
    pub fn ensure_document_table(&mut self, id_type: Option<&str>, data_type: Option<&str>) {
        let id_type = id_type.unwrap_or(DEFAULT_ID_COLUMN_TYPE);
        let data_type = data_type.unwrap_or(DEFAULT_DATA_COLUMN_TYPE);
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {} (\"id\" {} PRIMARY KEY, \"data\" {})",
            self.table.quoted(),
            id_type,
            data_type
        );
        self.ensure_schema(statement);
    }

    /// Queue `CREATE SCHEMA IF NOT EXISTS` when the table is schema-qualified.
    pub(crate) fn ensure_default_schema(&mut self) {
        if let Some(schema) = self.table.schema.clone() {
            self.ensure_schema(format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_identifier(&schema)
            ));
        }
    }

    pub fn clear_schema(&mut self) {
        self.statements.clear();
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Execute the queued statements if the table does not exist yet.
    ///
    /// Statement failures are logged and do not stop the remaining statements.
    pub async fn create_schema(&self, pool: &PgPool, correlation_id: &str) -> DbResult<()> {
        if self.statements.is_empty() {
            return Ok(());
        }

        let existing = executor::fetch_optional(
            pool,
            "SELECT to_regclass($1)::text AS regclass",
            &[SqlValue::String(self.table.quoted())],
        )
        .await?;
        let exists = existing
            .and_then(|row| row.get("regclass").cloned())
            .is_some_and(|v| !v.is_null());
        if exists {
            return Ok(());
        }

        debug!(correlation_id, table = %self.table, "Table does not exist. Creating database objects...");

        for statement in &self.statements {
            if let Err(e) = executor::execute(pool, statement, &[]).await {
                error!(
                    correlation_id,
                    table = %self.table,
                    statement = %statement,
                    error = %e,
                    "Failed to autocreate database object"
                );
            }
        }
        Ok(())
    }

    /// Read the declared types of the table columns. Empty when the table is missing.
    pub async fn load_column_types(&self, pool: &PgPool) -> DbResult<ColumnTypes> {
        let rows = executor::fetch_rows(
            pool,
            "SELECT a.attname::text AS name, format_type(a.atttypid, NULL) AS type \
             FROM pg_attribute a \
             WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped",
            &[SqlValue::String(self.table.quoted())],
        )
        .await?;

        Ok(ColumnTypes::new(rows.into_iter().filter_map(|row| {
            let name = row.get("name")?.as_str()?.to_string();
            let declared = row.get("type")?.as_str()?.to_string();
            Some((name, declared))
        })))
    }
}

/// Entity-specific schema definition, invoked on every open.
pub trait SchemaDefinition: Send + Sync {
    fn define_schema(&self, schema: &mut SchemaManager);
}

impl<F> SchemaDefinition for F
where
    F: Fn(&mut SchemaManager) + Send + Sync,
{
    fn define_schema(&self, schema: &mut SchemaManager) {
        self(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_quoting() {
        let plain = TableName::new(None, "dummies");
        assert_eq!(plain.quoted(), "\"dummies\"");
        assert_eq!(plain.to_string(), "dummies");

        let qualified = TableName::new(Some("App".to_string()), "Dummies");
        assert_eq!(qualified.quoted(), "\"App\".\"Dummies\"");
        assert_eq!(qualified.to_string(), "App.Dummies");

        let empty_schema = TableName::new(Some(String::new()), "dummies");
        assert_eq!(empty_schema.schema, None);
    }

    #[test]
    fn test_ensure_index_unique() {
        let mut schema = SchemaManager::new(TableName::new(None, "dummies"));
        schema.ensure_index("dummies_key", &[IndexKey::asc("key")], IndexOptions::unique());
        assert_eq!(
            schema.statements(),
            ["CREATE UNIQUE INDEX IF NOT EXISTS \"dummies_key\" ON \"dummies\" (key)"]
        );
    }

    #[test]
    fn test_ensure_index_type_and_order() {
        let mut schema = SchemaManager::new(TableName::new(Some("app".to_string()), "events"));
        schema.ensure_index(
            "events_idx",
            &[IndexKey::asc("kind"), IndexKey::desc("created")],
            IndexOptions {
                unique: false,
                index_type: Some("USING BTREE".to_string()),
            },
        );
        assert_eq!(
            schema.statements(),
            ["CREATE INDEX IF NOT EXISTS \"app\".\"events_idx\" ON \"app\".\"events\" USING BTREE (kind, created DESC)"]
        );
    }

    #[test]
    fn test_ensure_document_table() {
        let mut schema = SchemaManager::new(TableName::new(None, "dummies_json"));
        schema.ensure_document_table(None, None);
        schema.ensure_document_table(Some("UUID"), Some("JSON"));
        assert_eq!(
            schema.statements(),
            [
                "CREATE TABLE IF NOT EXISTS \"dummies_json\" (\"id\" TEXT PRIMARY KEY, \"data\" JSONB)",
                "CREATE TABLE IF NOT EXISTS \"dummies_json\" (\"id\" UUID PRIMARY KEY, \"data\" JSON)",
            ]
        );
    }

    #[test]
    fn test_statements_are_not_deduplicated() {
        let mut schema = SchemaManager::new(TableName::new(None, "t"));
        schema.ensure_schema("CREATE TABLE t (id TEXT)");
        schema.ensure_schema("CREATE TABLE t (id TEXT)");
        assert_eq!(schema.statements().len(), 2);

        schema.clear_schema();
        assert!(schema.statements().is_empty());
    }

    #[test]
    fn test_default_schema_statement() {
        let mut schema = SchemaManager::new(TableName::new(Some("app".to_string()), "t"));
        schema.ensure_default_schema();
        assert_eq!(schema.statements(), ["CREATE SCHEMA IF NOT EXISTS \"app\""]);

        let mut schema = SchemaManager::new(TableName::new(None, "t"));
        schema.ensure_default_schema();
        assert!(schema.statements().is_empty());
    }

    #[test]
    fn test_closure_schema_definition() {
        let definition = |schema: &mut SchemaManager| {
            schema.ensure_schema("CREATE TABLE IF NOT EXISTS \"t\" (\"id\" TEXT PRIMARY KEY)");
        };
        let mut schema = SchemaManager::new(TableName::new(None, "t"));
        definition.define_schema(&mut schema);
        assert_eq!(schema.statements().len(), 1);
    }
}
