//! Entity identifiers.
//!
//! An entity is *identifiable* when it exposes a unique key. Keys of type
//! `String` and `Uuid` can be generated for entities created without one.

use crate::db::types::SqlValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::fmt::{Debug, Display};

/// Generates unique object ids.
pub struct IdGenerator;

impl IdGenerator {
    /// Generate a 32-character hex id (a UUID v4 without dashes).
    pub fn next_long() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// A primary key type.
pub trait IdType: Clone + Debug + Display + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Generate a new key, or `None` when the database assigns keys.
    fn generate() -> Option<Self>;

    /// The key as a statement parameter.
    fn to_sql_value(&self) -> SqlValue;
}

impl IdType for String {
    fn generate() -> Option<Self> {
        Some(IdGenerator::next_long())
    }

    fn to_sql_value(&self) -> SqlValue {
        SqlValue::String(self.clone())
    }
}

impl IdType for uuid::Uuid {
    fn generate() -> Option<Self> {
        Some(uuid::Uuid::new_v4())
    }

    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Uuid(*self)
    }
}

impl IdType for i64 {
    fn generate() -> Option<Self> {
        None
    }

    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Int(*self)
    }
}

impl IdType for i32 {
    fn generate() -> Option<Self> {
        None
    }

    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Int(*self as i64)
    }
}

/// An entity with a unique `id`.
pub trait Identifiable {
    type Key: IdType;

    fn id(&self) -> Option<&Self::Key>;

    fn set_id(&mut self, id: Self::Key);

    /// Assign a generated id when none is set.
    fn ensure_id(&mut self) {
        if self.id().is_none() {
            if let Some(id) = Self::Key::generate() {
                self.set_id(id);
            }
        }
    }
}

/// Loosely-typed map entities keep their id in a string `"id"` field.
///
/// Non-string ids are not recognized; an empty string counts as unset.
impl Identifiable for Map<String, JsonValue> {
    type Key = String;

    fn id(&self) -> Option<&String> {
        match self.get("id") {
            Some(JsonValue::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    fn set_id(&mut self, id: String) {
        self.insert("id".to_string(), JsonValue::String(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_long_format() {
        let id = IdGenerator::next_long();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, IdGenerator::next_long());
    }

    #[test]
    fn test_integer_keys_are_not_generated() {
        assert!(i64::generate().is_none());
        assert_eq!(7i32.to_sql_value(), SqlValue::Int(7));
    }

    #[test]
    fn test_map_entity_ensure_id() {
        let mut item = json!({"key": "A"}).as_object().unwrap().clone();
        assert!(item.id().is_none());
        item.ensure_id();
        let id = item.id().cloned().unwrap();
        assert_eq!(id.len(), 32);

        // An existing id is kept
        item.ensure_id();
        assert_eq!(item.id(), Some(&id));
    }

    #[test]
    fn test_map_entity_empty_id_is_unset() {
        let item = json!({"id": ""}).as_object().unwrap().clone();
        assert!(item.id().is_none());
    }
}
