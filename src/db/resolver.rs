//! Connection string resolution.
//!
//! A [`ConnectionResolver`] turns configuration (a full URI, or host/port/database
//! plus credentials) into a connection string the pool can parse. Applications
//! backed by a discovery service or credential store plug in their own resolver.

use crate::config::ConnectionParams;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use url::Url;

/// Resolves the connection string for a PostgreSQL pool.
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, correlation_id: &str) -> DbResult<String>;
}

/// Resolver backed by static [`ConnectionParams`].
#[derive(Debug, Clone, Default)]
pub struct ConfigConnectionResolver {
    params: ConnectionParams,
}

impl ConfigConnectionResolver {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Compose the connection string without any I/O.
    pub fn compose(&self) -> DbResult<String> {
        if let Some(uri) = self.params.uri.as_deref().filter(|u| !u.is_empty()) {
            return Ok(uri.to_string());
        }

        let host = self
            .params
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DbError::config("Connection uri or host is not defined"))?;

        let base = format!("postgres://{}:{}", host, self.params.port_or_default());
        let mut url = Url::parse(&base).map_err(|e| DbError::config(format!("Invalid URL: {e}")))?;

        if let Some(username) = self.params.username.as_deref().filter(|u| !u.is_empty()) {
            url.set_username(username)
                .map_err(|_| DbError::config("Invalid username"))?;
            if let Some(password) = self.params.password.as_deref() {
                url.set_password(Some(password))
                    .map_err(|_| DbError::config("Invalid password"))?;
            }
        }

        if let Some(database) = self.params.database.as_deref() {
            url.set_path(&format!("/{}", database.trim_start_matches('/')));
        }

        if let Some(ssl_mode) = self.params.ssl_mode.as_deref().filter(|s| !s.is_empty()) {
            url.query_pairs_mut().append_pair("sslmode", ssl_mode);
        }

        Ok(url.to_string())
    }
}

#[async_trait]
impl ConnectionResolver for ConfigConnectionResolver {
    async fn resolve(&self, _correlation_id: &str) -> DbResult<String> {
        self.compose()
    }
}
