//! Connection pool management.
//!
//! [`PostgresConnection`] owns one `PgPool`. A single connection can be shared
//! (behind an `Arc`) by many persistence instances to reduce the number of
//! database connections in use; each statement acquires and releases a pooled
//! connection on its own.

use crate::config::{ConnectionParams, PoolOptions};
use crate::db::resolver::{ConfigConnectionResolver, ConnectionResolver};
use crate::error::{DbError, DbResult};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

#[derive(Debug)]
struct OpenPool {
    pool: PgPool,
    database_name: String,
}

/// A PostgreSQL connection pool with an explicit open/close lifecycle.
pub struct PostgresConnection {
    options: PoolOptions,
    resolver: Arc<dyn ConnectionResolver>,
    state: RwLock<Option<OpenPool>>,
}

impl PostgresConnection {
    /// Create a connection that resolves its connection string with `resolver`.
    pub fn with_resolver(options: PoolOptions, resolver: Arc<dyn ConnectionResolver>) -> Self {
        Self {
            options,
            resolver,
            state: RwLock::new(None),
        }
    }

    /// Create a connection from static connection parameters.
    pub fn from_params(params: ConnectionParams, options: PoolOptions) -> Self {
        Self::with_resolver(options, Arc::new(ConfigConnectionResolver::new(params)))
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Open the pool. Does nothing if the pool is already open.
    pub async fn open(&self, correlation_id: &str) -> DbResult<()> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Ok(());
        }

        let uri = self.resolver.resolve(correlation_id).await.map_err(|e| {
            error!(correlation_id, error = %e, "Failed to resolve Postgres connection");
            match e {
                err @ DbError::Connection { .. } => err,
                other => DbError::connection(
                    correlation_id,
                    "RESOLVE_FAILED",
                    format!("Failed to resolve Postgres connection: {other}"),
                ),
            }
        })?;

        let connect_options = PgConnectOptions::from_str(&uri).map_err(|e| {
            error!(correlation_id, error = %e, "Failed to parse Postgres connection string");
            DbError::connection_caused_by(
                correlation_id,
                "CONNECT_FAILED",
                "Failed to parse Postgres connection string",
                e,
            )
        })?;
        let database_name = connect_options
            .get_database()
            .map(String::from)
            .unwrap_or_default();

        let mut pool_options = PgPoolOptions::new()
            .max_connections(self.options.max_pool_size_or_default())
            .idle_timeout(self.options.idle_timeout());
        if let Some(connect_timeout) = self.options.connect_timeout() {
            pool_options = pool_options.acquire_timeout(connect_timeout);
        }

        debug!(correlation_id, "Connecting to postgres");

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                DbError::connection_caused_by(
                    correlation_id,
                    "CONNECT_FAILED",
                    "Connection to postgres failed",
                    e,
                )
            })?;

        info!(
            correlation_id,
            database = %database_name,
            max_pool_size = self.options.max_pool_size_or_default(),
            "Connected to postgres"
        );

        *state = Some(OpenPool {
            pool,
            database_name,
        });
        Ok(())
    }

    /// Close the pool. Safe to call when already closed.
    pub async fn close(&self, correlation_id: &str) -> DbResult<()> {
        let Some(open) = self.state.write().await.take() else {
            return Ok(());
        };
        open.pool.close().await;
        debug!(
            correlation_id,
            database = %open.database_name,
            "Disconnected from postgres database"
        );
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Get a handle to the pool. The handle is cheap to clone.
    pub async fn pool(&self) -> Option<PgPool> {
        self.state.read().await.as_ref().map(|s| s.pool.clone())
    }

    /// Get the database name of the open pool, or an empty string when closed.
    pub async fn database_name(&self) -> String {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.database_name.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("options", &self.options)
            .field("resolver", &"ConnectionResolver")
            .finish()
    }
}
