//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection string resolution
//! - Connection pool lifecycle
//! - Statement execution
//! - Type mappings between PostgreSQL values and JSON

pub mod connection;
pub mod executor;
pub mod resolver;
pub mod types;

pub use connection::PostgresConnection;
pub use resolver::{ConfigConnectionResolver, ConnectionResolver};
pub use types::{RowMap, SqlValue};
