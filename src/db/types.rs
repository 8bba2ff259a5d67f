//! PostgreSQL type mappings.
//!
//! This module converts between PostgreSQL rows and the JSON-shaped row
//! projection the persistence layer works with.
//!
//! # Architecture
//!
//! Decoding uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Category-specific decoders handle the actual value extraction
//!
//! Encoding goes the other way: every JSON value is turned into a
//! [`SqlValue`] and bound as a statement parameter, never concatenated.

use crate::error::{DbError, DbResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgHasArrayType, PgRow, PgTypeInfo, PgValueFormat, PgValueRef,
};
use sqlx::{Column, Decode, Encode, Postgres, Row, Type, TypeInfo, ValueRef};
use std::collections::BTreeMap;

/// A row projection: column name to value, iterated in sorted column order.
pub type RowMap = BTreeMap<String, JsonValue>;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for PostgreSQL column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Unknown,
}

/// Classify a PostgreSQL type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    match lower.as_str() {
        "numeric" | "decimal" => TypeCategory::Decimal,
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "serial"
        | "bigserial" | "smallserial" => TypeCategory::Integer,
        "bool" | "boolean" => TypeCategory::Boolean,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "bytea" => TypeCategory::Binary,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("numeric")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl PgHasArrayType for RawDecimal {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_numeric")
    }

    fn array_compatible(ty: &PgTypeInfo) -> bool {
        array_element_type(ty.name()).is_some_and(|e| categorize_type(e) == TypeCategory::Decimal)
    }
}

impl<'r> Decode<'r, Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => {
                let s = <&str as Decode<Postgres>>::decode(value)?;
                Ok(RawDecimal(s.to_string()))
            }
            PgValueFormat::Binary => {
                let bytes = <&[u8] as Decode<Postgres>>::decode(value)?;
                decode_numeric_binary(bytes).map(RawDecimal)
            }
        }
    }
}

/// Render the binary NUMERIC wire format (base-10000 digits) as a decimal string.
fn decode_numeric_binary(bytes: &[u8]) -> Result<String, BoxDynError> {
    const SIGN_NEG: u16 = 0x4000;
    const SIGN_NAN: u16 = 0xC000;

    if bytes.len() < 8 {
        return Err("numeric value is too short".into());
    }
    let read_u16 = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
    let ndigits = read_u16(0) as usize;
    let weight = read_u16(2) as i16 as i32;
    let sign = read_u16(4);
    let dscale = read_u16(6) as usize;

    if sign == SIGN_NAN {
        return Ok("NaN".to_string());
    }
    if bytes.len() < 8 + ndigits * 2 {
        return Err("numeric value is truncated".into());
    }
    let digits: Vec<u16> = (0..ndigits).map(|i| read_u16(8 + i * 2)).collect();

    let mut integer = String::new();
    for pos in 0..=weight.max(-1) {
        let digit = digits.get(pos as usize).copied().unwrap_or(0);
        if integer.is_empty() {
            integer.push_str(&digit.to_string());
        } else {
            integer.push_str(&format!("{digit:04}"));
        }
    }
    if integer.is_empty() || integer.chars().all(|c| c == '0') {
        integer = "0".to_string();
    }

    let mut fraction = String::new();
    let mut pos = weight + 1;
    while fraction.len() < dscale {
        let digit = if pos < 0 {
            0
        } else {
            digits.get(pos as usize).copied().unwrap_or(0)
        };
        fraction.push_str(&format!("{digit:04}"));
        pos += 1;
    }
    fraction.truncate(dscale);

    let mut result = String::new();
    if sign == SIGN_NEG {
        result.push('-');
    }
    result.push_str(&integer);
    if dscale > 0 {
        result.push('.');
        result.push_str(&fraction);
    }
    Ok(result)
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Encode binary column data as a base64 JSON string.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

// =============================================================================
// Row to JSON
// =============================================================================

/// Convert a PostgreSQL row into a row projection.
///
/// A value that cannot be decoded fails the whole row with
/// [`DbError::Conversion`]; it is never replaced by NULL.
pub fn row_to_map(row: &PgRow) -> DbResult<RowMap> {
    let mut map = RowMap::new();
    for (idx, col) in row.columns().iter().enumerate() {
        let type_name = col.type_info().name();
        let value = decode_column(row, idx, type_name).map_err(|e| {
            DbError::conversion(format!(
                "Failed to decode column \"{}\" of type {}: {}",
                col.name(),
                type_name,
                e
            ))
        })?;
        map.insert(col.name().to_string(), value);
    }
    Ok(map)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<JsonValue, BoxDynError> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(JsonValue::Null);
    }
    if let Some(element) = array_element_type(type_name) {
        return decode_array(row, idx, categorize_type(element));
    }
    match categorize_type(type_name) {
        TypeCategory::Decimal => Ok(decimal_to_json(row.try_get::<RawDecimal, _>(idx)?.0)),
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_as::<bool>(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Binary => Ok(encode_binary_value(&row.try_get::<Vec<u8>, _>(idx)?)),
        TypeCategory::Json => Ok(row.try_get::<JsonValue, _>(idx)?),
        TypeCategory::Uuid => decode_as::<uuid::Uuid>(row, idx),
        TypeCategory::Timestamp => decode_as::<chrono::NaiveDateTime>(row, idx),
        TypeCategory::TimestampTz => decode_as::<chrono::DateTime<chrono::Utc>>(row, idx),
        TypeCategory::Date => decode_as::<chrono::NaiveDate>(row, idx),
        TypeCategory::Time => decode_as::<chrono::NaiveTime>(row, idx),
        TypeCategory::Text => match row.try_get::<String, _>(idx) {
            Ok(v) => Ok(JsonValue::String(v)),
            // Extension text types (citext) share the text wire format
            Err(_) => Ok(JsonValue::String(row.try_get_unchecked::<String, _>(idx)?)),
        },
        TypeCategory::Unknown => {
            // Enum labels arrive as plain text; other binary payloads are rejected
            let text = row.try_get_unchecked::<String, _>(idx)?;
            if text.chars().any(char::is_control) {
                return Err(format!("unsupported column type {type_name}").into());
            }
            Ok(JsonValue::String(text))
        }
    }
}

/// Element type name of an array type (`TEXT[]` or `_text`), if it is one.
pub fn array_element_type(type_name: &str) -> Option<&str> {
    type_name
        .strip_suffix("[]")
        .or_else(|| type_name.strip_prefix('_'))
}

fn decode_as<T>(row: &PgRow, idx: usize) -> Result<JsonValue, BoxDynError>
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres> + serde::Serialize,
{
    Ok(serde_json::to_value(row.try_get::<T, _>(idx)?)?)
}

fn decode_integer(row: &PgRow, idx: usize) -> Result<JsonValue, BoxDynError> {
    if let Ok(v) = row.try_get::<i16, _>(idx) {
        return Ok(JsonValue::Number(v.into()));
    }
    if let Ok(v) = row.try_get::<i32, _>(idx) {
        return Ok(JsonValue::Number(v.into()));
    }
    Ok(JsonValue::Number(row.try_get::<i64, _>(idx)?.into()))
}

fn decode_float(row: &PgRow, idx: usize) -> Result<JsonValue, BoxDynError> {
    let v = match row.try_get::<f64, _>(idx) {
        Ok(v) => v,
        Err(_) => row.try_get::<f32, _>(idx)? as f64,
    };
    Ok(float_to_json(v))
}

fn float_to_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn decode_array(
    row: &PgRow,
    idx: usize,
    element: TypeCategory,
) -> Result<JsonValue, BoxDynError> {
    match element {
        TypeCategory::Integer => {
            if let Ok(v) = row.try_get::<Vec<Option<i16>>, _>(idx) {
                return Ok(serde_json::to_value(v)?);
            }
            if let Ok(v) = row.try_get::<Vec<Option<i32>>, _>(idx) {
                return Ok(serde_json::to_value(v)?);
            }
            decode_as::<Vec<Option<i64>>>(row, idx)
        }
        TypeCategory::Float => {
            let values = match row.try_get::<Vec<Option<f64>>, _>(idx) {
                Ok(v) => v,
                Err(_) => row
                    .try_get::<Vec<Option<f32>>, _>(idx)?
                    .into_iter()
                    .map(|v| v.map(f64::from))
                    .collect(),
            };
            Ok(JsonValue::Array(
                values
                    .into_iter()
                    .map(|v| v.map(float_to_json).unwrap_or(JsonValue::Null))
                    .collect(),
            ))
        }
        TypeCategory::Decimal => Ok(JsonValue::Array(
            row.try_get::<Vec<Option<RawDecimal>>, _>(idx)?
                .into_iter()
                .map(|v| v.map(|d| decimal_to_json(d.0)).unwrap_or(JsonValue::Null))
                .collect(),
        )),
        TypeCategory::Boolean => decode_as::<Vec<Option<bool>>>(row, idx),
        TypeCategory::Text => decode_as::<Vec<Option<String>>>(row, idx),
        TypeCategory::Json => decode_as::<Vec<Option<JsonValue>>>(row, idx),
        TypeCategory::Uuid => decode_as::<Vec<Option<uuid::Uuid>>>(row, idx),
        TypeCategory::Timestamp => decode_as::<Vec<Option<chrono::NaiveDateTime>>>(row, idx),
        TypeCategory::TimestampTz => {
            decode_as::<Vec<Option<chrono::DateTime<chrono::Utc>>>>(row, idx)
        }
        TypeCategory::Date => decode_as::<Vec<Option<chrono::NaiveDate>>>(row, idx),
        TypeCategory::Time => decode_as::<Vec<Option<chrono::NaiveTime>>>(row, idx),
        TypeCategory::Binary | TypeCategory::Unknown => {
            Err("arrays of this element type are not supported".into())
        }
    }
}

/// NUMERIC as a JSON number when the number holds it exactly, otherwise its decimal string.
pub fn decimal_to_json(decimal: String) -> JsonValue {
    if let Ok(v) = decimal.parse::<i64>() {
        return JsonValue::Number(v.into());
    }
    if let Ok(v) = decimal.parse::<u64>() {
        return JsonValue::Number(v.into());
    }
    if let Ok(v) = decimal.parse::<f64>() {
        if v.is_finite() && normalize_decimal(&v.to_string()) == normalize_decimal(&decimal) {
            if let Some(n) = serde_json::Number::from_f64(v) {
                return JsonValue::Number(n);
            }
        }
    }
    JsonValue::String(decimal)
}

/// Strip trailing fraction zeros so `1.50` and `1.5` compare equal.
fn normalize_decimal(value: &str) -> &str {
    if value.contains('.') {
        value.trim_end_matches('0').trim_end_matches('.')
    } else {
        value
    }
}

// =============================================================================
// Parameter Binding
// =============================================================================

/// A statement parameter derived from a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with no declared type, so the server infers it from the target column.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Uuid(uuid::Uuid),
    Json(JsonValue),
}

impl SqlValue {
    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
        }
    }
}

impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => SqlValue::Null,
            JsonValue::Bool(v) => SqlValue::Bool(v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(v) => SqlValue::Int(v),
                None => SqlValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(v) => SqlValue::String(v),
            v @ (JsonValue::Array(_) | JsonValue::Object(_)) => SqlValue::Json(v),
        }
    }
}

/// NULL parameter encoded with the unspecified type oid.
#[derive(Debug, Clone, Copy)]
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Bind one parameter to a query.
pub fn bind_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q SqlValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        SqlValue::Null => query.bind(UntypedNull),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::String(v) => query.bind(v.as_str()),
        SqlValue::Uuid(v) => query.bind(*v),
        SqlValue::Json(v) => query.bind(sqlx::types::Json(v)),
    }
}
