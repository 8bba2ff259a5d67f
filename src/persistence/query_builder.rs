//! SQL fragment generation from row projections.
//!
//! All functions are pure. A [`Row`] iterates its columns in sorted order, so
//! column lists, placeholders and value lists derived from the same row always
//! line up.

use crate::db::types::{RowMap, SqlValue};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Column name to value mapping for one entity.
pub type Row = RowMap;

/// Quote an identifier so case-sensitive names survive.
///
/// Empty values and values starting with `'` are returned unchanged.
/// Embedded double quotes are doubled.
pub fn quote_identifier(value: &str) -> String {
    if value.is_empty() || value.starts_with('\'') {
        return value.to_string();
    }
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Split a column list produced by [`generate_columns`] back into raw names.
fn split_columns(columns: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = columns.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => names.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    names.push(current.trim().to_string());
    names
}

/// Generate a list of column names like: `"column1","column2","column3"`.
pub fn generate_columns(values: &Row) -> String {
    values
        .keys()
        .map(|k| quote_identifier(k))
        .collect::<Vec<_>>()
        .join(",")
}

/// Generate a list of value parameters like: `$1,$2,$3`.
pub fn generate_parameters(values: &Row) -> String {
    generate_parameters_count(values.len())
}

/// Generate `count` positional parameters starting at `$1`.
pub fn generate_parameters_count(count: usize) -> String {
    (1..=count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(",")
}

/// Generate a list of column sets for UPDATE statements like: `"column1"=$1,"column2"=$2`.
///
/// Returns the SET list together with the column list it was derived from.
pub fn generate_set_parameters(values: &Row) -> (String, String) {
    let mut set_params = Vec::with_capacity(values.len());
    let mut columns = Vec::with_capacity(values.len());
    for (index, column) in values.keys().enumerate() {
        let quoted = quote_identifier(column);
        set_params.push(format!("{}=${}", quoted, index + 1));
        columns.push(quoted);
    }
    (set_params.join(","), columns.join(","))
}

/// Generate the ordered parameter values for a column list.
///
/// `columns` must come from [`generate_columns`] or [`generate_set_parameters`]
/// on the same row. Columns missing from the row bind as NULL.
pub fn generate_values(columns: &str, values: &Row) -> Vec<SqlValue> {
    if columns.is_empty() {
        return Vec::new();
    }
    split_columns(columns)
        .iter()
        .map(|column| {
            values
                .get(column)
                .cloned()
                .map(SqlValue::from)
                .unwrap_or(SqlValue::Null)
        })
        .collect()
}

/// Build a projection from any JSON object.
pub fn row_from_object(value: JsonValue) -> Option<Row> {
    match value {
        JsonValue::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}

/// Declared column types of a table, as rendered by `format_type`.
///
/// Parameters are bound with the type of their JSON value (text, bigint,
/// double precision, boolean, jsonb). Placeholders of columns declared with
/// another type are cast to it, so strings reach timestamp, uuid or numeric
/// columns through the type's text input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnTypes(HashMap<String, String>);

impl ColumnTypes {
    pub fn new<I, K, V>(types: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            types
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    /// Adapt a value to its column: JSON arrays bound to array columns become array literals.
    pub fn adapt(&self, column: &str, value: SqlValue) -> SqlValue {
        match (self.get(column), value) {
            (Some(declared), SqlValue::Json(JsonValue::Array(items))) if declared.ends_with("[]") => {
                SqlValue::String(array_literal(&items))
            }
            (_, value) => value,
        }
    }

    /// Placeholder `$index` for `column`, cast to the declared type when the bound value differs.
    pub fn placeholder(&self, column: &str, index: usize, value: &SqlValue) -> String {
        let Some(declared) = self.get(column) else {
            return format!("${}", index);
        };
        let bound = match value {
            SqlValue::Null => return format!("${}", index),
            SqlValue::Bool(_) => "boolean",
            SqlValue::Int(_) => "bigint",
            SqlValue::Float(_) => "double precision",
            SqlValue::String(_) => "text",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Json(_) => "jsonb",
        };
        if bound == declared {
            return format!("${}", index);
        }
        // Binary values travel as base64 strings
        if declared == "bytea" && bound == "text" {
            return format!("decode(${}, 'base64')", index);
        }
        format!("${}::{}", index, declared)
    }
}

/// Render a JSON array as a PostgreSQL array literal, e.g. `{"a","b"}`.
pub fn array_literal(items: &[JsonValue]) -> String {
    let elements = items
        .iter()
        .map(|item| match item {
            JsonValue::Null => "NULL".to_string(),
            JsonValue::Array(inner) => array_literal(inner),
            JsonValue::String(s) => quote_array_element(s),
            other => quote_array_element(&other.to_string()),
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{}}}", elements)
}

fn quote_array_element(value: &str) -> String {
    format!(
        "\"{}\"",
        value.replace('\\', "\\\\").replace('"', "\\\"")
    )
}

/// Columns, placeholders and values of one row, ready for INSERT or UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundRow {
    /// `"a","b"`
    pub columns: String,
    /// `$1,$2::uuid`
    pub parameters: String,
    /// `"a"=$1,"b"=$2::uuid`
    pub set_parameters: String,
    pub values: Vec<SqlValue>,
}

/// Bind a row against the declared column types.
///
/// `key`, when given, is bound for the `id` column instead of the row value.
pub fn bind_row(row: &Row, types: &ColumnTypes, key: Option<&SqlValue>) -> BoundRow {
    let columns = generate_columns(row);
    let values = generate_values(&columns, row)
        .into_iter()
        .zip(row.keys())
        .map(|(value, column)| {
            let value = match key {
                Some(key) if column == "id" => key.clone(),
                _ => value,
            };
            types.adapt(column, value)
        })
        .collect::<Vec<_>>();

    let placeholders = row
        .keys()
        .zip(&values)
        .enumerate()
        .map(|(index, (column, value))| types.placeholder(column, index + 1, value))
        .collect::<Vec<_>>();

    let set_parameters = row
        .keys()
        .zip(&placeholders)
        .map(|(column, placeholder)| format!("{}={}", quote_identifier(column), placeholder))
        .collect::<Vec<_>>()
        .join(",");

    BoundRow {
        columns,
        parameters: placeholders.join(","),
        set_parameters,
        values,
    }
}
