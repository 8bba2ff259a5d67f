//! Conversion between entities and row projections.
//!
//! Two strategies are provided:
//! - [`RelationalConverter`]: one column per entity field.
//! - [`DocumentConverter`]: an `(id, data)` row holding the whole entity as JSON.
//!
//! Conversion failures are reported as [`DbError::Conversion`]; they are never
//! turned into empty entities.

use crate::error::{DbError, DbResult};
use crate::persistence::identity::Identifiable;
use crate::persistence::query_builder::{Row, row_from_object};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::marker::PhantomData;

/// The SET part of a partial update.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialUpdate {
    /// Assign the listed columns.
    Columns(Row),
    /// Shallow-merge the object into the `data` column.
    MergeDocument(JsonValue),
}

/// Maps entities of type `T` to rows and back.
pub trait Converter<T>: Send + Sync {
    /// Convert an entity into a row projection.
    fn to_row(&self, item: &T) -> DbResult<Row>;

    /// Convert a result row into an entity.
    fn from_row(&self, row: Row) -> DbResult<T>;

    /// Convert a patch object into the SET part of a partial update.
    fn partial_update(&self, patch: JsonValue) -> DbResult<PartialUpdate>;
}

fn to_object<T: Serialize>(item: &T) -> DbResult<Row> {
    let value = serde_json::to_value(item)?;
    row_from_object(value)
        .ok_or_else(|| DbError::conversion("Entity must serialize to a JSON object"))
}

fn patch_object(patch: JsonValue) -> DbResult<serde_json::Map<String, JsonValue>> {
    match patch {
        JsonValue::Object(map) => Ok(map),
        other => Err(DbError::invalid_input(format!(
            "Partial update must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// One column per serialized field.
pub struct RelationalConverter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> RelationalConverter<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for RelationalConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for RelationalConverter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RelationalConverter")
    }
}

impl<T> Converter<T> for RelationalConverter<T>
where
    T: Serialize + DeserializeOwned,
{
    fn to_row(&self, item: &T) -> DbResult<Row> {
        to_object(item)
    }

    fn from_row(&self, row: Row) -> DbResult<T> {
        let value = JsonValue::Object(row.into_iter().collect());
        Ok(serde_json::from_value(value)?)
    }

    fn partial_update(&self, patch: JsonValue) -> DbResult<PartialUpdate> {
        Ok(PartialUpdate::Columns(
            patch_object(patch)?.into_iter().collect(),
        ))
    }
}

/// Whole entity in a JSON `data` column next to its `id`.
pub struct DocumentConverter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> DocumentConverter<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for DocumentConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for DocumentConverter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DocumentConverter")
    }
}

impl<T> Converter<T> for DocumentConverter<T>
where
    T: Identifiable + Serialize + DeserializeOwned,
{
    fn to_row(&self, item: &T) -> DbResult<Row> {
        let id = match item.id() {
            Some(id) => serde_json::to_value(id)?,
            None => JsonValue::Null,
        };
        let data = serde_json::to_value(item)?;

        let mut row = Row::new();
        row.insert("id".to_string(), id);
        row.insert("data".to_string(), data);
        Ok(row)
    }

    fn from_row(&self, mut row: Row) -> DbResult<T> {
        // Rows without a data column are read as the entity itself (map-shaped entities)
        let value = match row.remove("data") {
            Some(data) => data,
            None => JsonValue::Object(row.into_iter().collect()),
        };
        Ok(serde_json::from_value(value)?)
    }

    fn partial_update(&self, patch: JsonValue) -> DbResult<PartialUpdate> {
        Ok(PartialUpdate::MergeDocument(JsonValue::Object(
            patch_object(patch)?,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Dummy {
        id: Option<String>,
        key: String,
        content: Option<String>,
    }

    impl Identifiable for Dummy {
        type Key = String;

        fn id(&self) -> Option<&String> {
            self.id.as_ref()
        }

        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }
    }

    fn dummy() -> Dummy {
        Dummy {
            id: Some("1".to_string()),
            key: "Key 1".to_string(),
            content: Some("Content 1".to_string()),
        }
    }

    #[test]
    fn test_relational_to_row() {
        let converter = RelationalConverter::<Dummy>::new();
        let row = converter.to_row(&dummy()).unwrap();
        assert_eq!(
            row.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["content", "id", "key"]
        );
        assert_eq!(row["key"], json!("Key 1"));
    }

    #[test]
    fn test_relational_from_row() {
        let converter = RelationalConverter::<Dummy>::new();
        let row = converter.to_row(&dummy()).unwrap();
        assert_eq!(converter.from_row(row).unwrap(), dummy());
    }

    #[test]
    fn test_relational_decode_error_is_reported() {
        let converter = RelationalConverter::<Dummy>::new();
        let row = row_from_object(json!({"id": "1", "key": 42})).unwrap();
        let err = converter.from_row(row).unwrap_err();
        assert!(matches!(err, DbError::Conversion { .. }));
    }

    #[test]
    fn test_relational_rejects_non_object_entity() {
        let converter = RelationalConverter::<i64>::new();
        let err = converter.to_row(&5).unwrap_err();
        assert!(matches!(err, DbError::Conversion { .. }));
    }

    #[test]
    fn test_relational_partial_update() {
        let converter = RelationalConverter::<Dummy>::new();
        let update = converter.partial_update(json!({"content": "new"})).unwrap();
        let PartialUpdate::Columns(columns) = update else {
            panic!("expected column assignments");
        };
        assert_eq!(columns.len(), 1);
        assert_eq!(columns["content"], json!("new"));

        let err = converter.partial_update(json!([1])).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_document_to_row() {
        let converter = DocumentConverter::<Dummy>::new();
        let row = converter.to_row(&dummy()).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row["id"], json!("1"));
        assert_eq!(row["data"]["content"], json!("Content 1"));
    }

    #[test]
    fn test_document_to_row_without_id() {
        let converter = DocumentConverter::<Dummy>::new();
        let mut item = dummy();
        item.id = None;
        let row = converter.to_row(&item).unwrap();
        assert!(row["id"].is_null());
    }

    #[test]
    fn test_document_from_row() {
        let converter = DocumentConverter::<Dummy>::new();
        let row = converter.to_row(&dummy()).unwrap();
        assert_eq!(converter.from_row(row).unwrap(), dummy());
    }

    #[test]
    fn test_document_from_row_without_data_column() {
        let converter = DocumentConverter::<serde_json::Map<String, JsonValue>>::new();
        let row = row_from_object(json!({"id": "1", "key": "A"})).unwrap();
        let item = converter.from_row(row).unwrap();
        assert_eq!(item.get("key"), Some(&json!("A")));
    }

    #[test]
    fn test_document_partial_update() {
        let converter = DocumentConverter::<Dummy>::new();
        let update = converter.partial_update(json!({"b": 5})).unwrap();
        assert_eq!(update, PartialUpdate::MergeDocument(json!({"b": 5})));
    }
}
