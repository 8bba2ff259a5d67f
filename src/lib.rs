//! PostgreSQL persistence library.
//!
//! Maps application entities onto PostgreSQL tables, either one column per
//! field or as a JSON document per row, with pooled connections, paging,
//! counting, random sampling and schema bootstrap on open.

pub mod config;
pub mod db;
pub mod error;
pub mod persistence;

pub use config::{Config, ConnectionParams, PersistenceConfig, PoolOptions};
pub use db::{ConfigConnectionResolver, ConnectionResolver, PostgresConnection};
pub use error::{DbError, DbResult};
pub use persistence::{
    DataPage, IdentifiablePostgresPersistence, JsonPostgresPersistence, PagingParams,
    PostgresPersistence,
};
