//! Entity persistence on top of PostgreSQL.
//!
//! - [`PostgresPersistence`]: filter, paging, count, random pick and delete
//!   operations for any entity type
//! - [`IdentifiablePostgresPersistence`]: key-addressed operations for entities
//!   with an `id`
//! - [`JsonPostgresPersistence`]: identifiable entities stored as JSON documents

pub mod converter;
pub mod identifiable;
pub mod identity;
pub mod paging;
pub mod postgres;
pub mod query_builder;
pub mod schema;

pub use converter::{Converter, DocumentConverter, PartialUpdate, RelationalConverter};
pub use identifiable::{IdentifiablePostgresPersistence, JsonPostgresPersistence};
pub use identity::{IdGenerator, IdType, Identifiable};
pub use paging::{DataPage, PagingParams};
pub use postgres::PostgresPersistence;
pub use query_builder::Row;
pub use schema::{IndexKey, IndexOptions, SchemaDefinition, SchemaManager, TableName};
