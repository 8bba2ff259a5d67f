//! Persistence of identifiable entities.
//!
//! [`IdentifiablePostgresPersistence`] extends [`PostgresPersistence`] with
//! operations addressed by the entity key. The table must have a primary key
//! column named `id`.
//!
//! Base operations are available through `Deref`; [`create`](IdentifiablePostgresPersistence::create)
//! is replaced by a version that generates missing ids.

use crate::db::executor;
use crate::db::types::SqlValue;
use crate::error::{DbError, DbResult};
use crate::persistence::converter::{Converter, DocumentConverter, PartialUpdate};
use crate::persistence::identity::{IdType, Identifiable};
use crate::persistence::postgres::PostgresPersistence;
use crate::persistence::query_builder::{Row, bind_row};
use crate::persistence::schema::SchemaDefinition;
use serde_json::Value as JsonValue;
use std::ops::{Deref, DerefMut};
use tracing::trace;

/// Persistence of entities stored as a single JSON document next to their id.
///
/// The table is `("id" <id type> PRIMARY KEY, "data" JSONB)`; see
/// [`SchemaManager::ensure_document_table`](crate::persistence::SchemaManager::ensure_document_table).
pub type JsonPostgresPersistence<T> = IdentifiablePostgresPersistence<T, DocumentConverter<T>>;

/// Persistence of entities with a unique `id` key.
pub struct IdentifiablePostgresPersistence<T, C> {
    base: PostgresPersistence<T, C>,
}

impl<T, C> Deref for IdentifiablePostgresPersistence<T, C> {
    type Target = PostgresPersistence<T, C>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<T, C> DerefMut for IdentifiablePostgresPersistence<T, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl<T, C> std::fmt::Debug for IdentifiablePostgresPersistence<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdentifiablePostgresPersistence")
            .field(&self.base)
            .finish()
    }
}

impl<T> IdentifiablePostgresPersistence<T, DocumentConverter<T>>
where
    T: Identifiable + serde::Serialize + serde::de::DeserializeOwned + Clone,
{
    /// Create a document persistence for `table`.
    pub fn documents(table: impl Into<String>) -> Self {
        Self::new(table, DocumentConverter::new())
    }
}

impl<T, C> IdentifiablePostgresPersistence<T, C>
where
    T: Identifiable + Clone,
    C: Converter<T>,
{
    pub fn new(table: impl Into<String>, converter: C) -> Self {
        Self {
            base: PostgresPersistence::new(table, converter),
        }
    }

    /// Set the hook that defines the table schema on open.
    pub fn with_schema(self, definition: impl SchemaDefinition + 'static) -> Self {
        Self {
            base: self.base.with_schema(definition),
        }
    }

    /// Get the underlying generic persistence.
    pub fn base(&self) -> &PostgresPersistence<T, C> {
        &self.base
    }

    /// Placeholders for `keys`, cast to the declared type of the `id` column.
    fn key_parameters(&self, keys: &[SqlValue], first: usize) -> String {
        keys.iter()
            .enumerate()
            .map(|(offset, key)| self.base.column_types().placeholder("id", first + offset, key))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Get items by their ids. Missing ids are skipped.
    pub async fn get_list_by_ids(
        &self,
        correlation_id: &str,
        ids: &[T::Key],
    ) -> DbResult<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.base.pool(correlation_id).await?;

        let params = ids.iter().map(IdType::to_sql_value).collect::<Vec<_>>();
        let query = format!(
            "SELECT * FROM {} WHERE \"id\" IN({})",
            self.quoted_table_name(),
            self.key_parameters(&params, 1)
        );
        let rows = executor::fetch_rows(&pool, &query, &params).await?;
        let items = self.base.to_items(rows)?;

        trace!(correlation_id, count = items.len(), table = %self.table_name(), "Retrieved {} from {}", items.len(), self.table_name());
        Ok(items)
    }

    /// Get an item by its id, `None` when it does not exist.
    pub async fn get_one_by_id(&self, correlation_id: &str, id: &T::Key) -> DbResult<Option<T>> {
        let pool = self.base.pool(correlation_id).await?;

        let key = id.to_sql_value();
        let query = format!(
            "SELECT * FROM {} WHERE \"id\"={}",
            self.quoted_table_name(),
            self.key_parameters(std::slice::from_ref(&key), 1)
        );
        let row = executor::fetch_optional(&pool, &query, &[key]).await?;
        let item = self.base.to_item(row)?;

        if item.is_some() {
            trace!(correlation_id, id = %id, table = %self.table_name(), "Retrieved from {} with id = {}", self.table_name(), id);
        } else {
            trace!(correlation_id, id = %id, table = %self.table_name(), "Nothing found from {} with id = {}", self.table_name(), id);
        }
        Ok(item)
    }

    /// Create an item, generating its id when it is not set.
    pub async fn create(&self, correlation_id: &str, item: &T) -> DbResult<Option<T>> {
        let mut item = item.clone();
        item.ensure_id();

        let row = self.base.converter().to_row(&item)?;
        let key = item.id().map(IdType::to_sql_value);
        self.base.insert(correlation_id, row, key).await
    }

    /// Create the item when its id is new, otherwise replace the stored one.
    pub async fn set(&self, correlation_id: &str, item: &T) -> DbResult<Option<T>> {
        let pool = self.base.pool(correlation_id).await?;

        let mut item = item.clone();
        item.ensure_id();
        let key = item.id().map(IdType::to_sql_value);

        let mut row = self.base.converter().to_row(&item)?;
        if key.is_none() && row.get("id").is_some_and(|id| id.is_null()) {
            row.remove("id");
        }
        let bound = bind_row(&row, self.base.column_types(), key.as_ref());

        let query = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (\"id\") DO UPDATE SET {} RETURNING *",
            self.quoted_table_name(),
            bound.columns,
            bound.parameters,
            bound.set_parameters
        );
        let stored = self.base.write_one(&pool, &query, &bound.values).await?;

        trace!(correlation_id, id = ?item.id(), table = %self.table_name(), "Set in {} with id = {:?}", self.table_name(), item.id());
        Ok(stored)
    }

    /// Replace the stored item with the same id. `None` when it does not exist.
    pub async fn update(&self, correlation_id: &str, item: &T) -> DbResult<Option<T>> {
        let Some(id) = item.id() else {
            return Err(DbError::invalid_input("Cannot update an item without an id"));
        };
        let pool = self.base.pool(correlation_id).await?;

        let mut row = self.base.converter().to_row(item)?;
        row.remove("id");
        if row.is_empty() {
            return self.get_one_by_id(correlation_id, id).await;
        }

        let (query, values) = self.update_statement(&row, id);
        let updated = self.base.write_one(&pool, &query, &values).await?;

        trace!(correlation_id, id = %id, table = %self.table_name(), "Updated in {} with id = {}", self.table_name(), id);
        Ok(updated)
    }

    /// Update selected fields of an item. `None` when it does not exist.
    ///
    /// Relational tables assign the patch fields to their columns; document
    /// tables merge the patch into the stored document (`data || patch`).
    pub async fn update_partially(
        &self,
        correlation_id: &str,
        id: &T::Key,
        patch: JsonValue,
    ) -> DbResult<Option<T>> {
        let pool = self.base.pool(correlation_id).await?;

        let (query, values) = match self.base.converter().partial_update(patch)? {
            PartialUpdate::Columns(mut row) => {
                row.remove("id");
                if row.is_empty() {
                    return self.get_one_by_id(correlation_id, id).await;
                }
                self.update_statement(&row, id)
            }
            PartialUpdate::MergeDocument(document) => {
                let key = id.to_sql_value();
                let query = format!(
                    "UPDATE {} SET \"data\"=\"data\"||$2 WHERE \"id\"={} RETURNING *",
                    self.quoted_table_name(),
                    self.key_parameters(std::slice::from_ref(&key), 1)
                );
                (query, vec![key, SqlValue::Json(document)])
            }
        };

        let updated = self.base.write_one(&pool, &query, &values).await?;

        trace!(correlation_id, id = %id, table = %self.table_name(), "Updated partially in {} with id = {}", self.table_name(), id);
        Ok(updated)
    }

    /// Delete an item by its id and return it. `None` when it does not exist.
    pub async fn delete_by_id(&self, correlation_id: &str, id: &T::Key) -> DbResult<Option<T>> {
        let pool = self.base.pool(correlation_id).await?;

        let key = id.to_sql_value();
        let query = format!(
            "DELETE FROM {} WHERE \"id\"={} RETURNING *",
            self.quoted_table_name(),
            self.key_parameters(std::slice::from_ref(&key), 1)
        );
        let deleted = self.base.write_one(&pool, &query, &[key]).await?;

        trace!(correlation_id, id = %id, table = %self.table_name(), "Deleted from {} with id = {}", self.table_name(), id);
        Ok(deleted)
    }

    /// Delete items by their ids. Returns the number of deleted rows.
    pub async fn delete_by_ids(&self, correlation_id: &str, ids: &[T::Key]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let pool = self.base.pool(correlation_id).await?;

        let params = ids.iter().map(IdType::to_sql_value).collect::<Vec<_>>();
        let query = format!(
            "DELETE FROM {} WHERE \"id\" IN({})",
            self.quoted_table_name(),
            self.key_parameters(&params, 1)
        );
        let count = executor::execute(&pool, &query, &params).await?;

        trace!(correlation_id, count, table = %self.table_name(), "Deleted {} items from {}", count, self.table_name());
        Ok(count)
    }

    /// `UPDATE ... SET <row> WHERE "id"=<key> RETURNING *` with its parameters.
    fn update_statement(&self, row: &Row, id: &T::Key) -> (String, Vec<SqlValue>) {
        let bound = bind_row(row, self.base.column_types(), None);
        let key = id.to_sql_value();
        let key_parameter = self.key_parameters(std::slice::from_ref(&key), bound.values.len() + 1);

        let query = format!(
            "UPDATE {} SET {} WHERE \"id\"={} RETURNING *",
            self.quoted_table_name(),
            bound.set_parameters,
            key_parameter
        );
        let mut values = bound.values;
        values.push(key);
        (query, values)
    }
}
