//! Connection settings from the environment.

use crate::error::PostgresError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    /// Connection string
    pub database_url: String,
    /// Pool size
    pub max_connections: u32,
    /// Bound on acquiring a connection
    pub connect_timeout: Duration,
}

impl PostgresConfig {
    /// Default pool size.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    /// Default connection timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Settings for `database_url` with default pool tuning.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Load from `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS` and
    /// `DATABASE_CONNECT_TIMEOUT` (seconds).
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Config`] if `DATABASE_URL` is unset or blank.
    pub fn from_env() -> Result<Self, PostgresError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source. Unparsable tuning values fall
    /// back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Config`] if `DATABASE_URL` is missing or blank.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PostgresError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| PostgresError::Config("DATABASE_URL is not set".to_string()))?;

        let max_connections = lookup("DATABASE_MAX_CONNECTIONS")
            .and_then(|v| v.trim().parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(Self::DEFAULT_MAX_CONNECTIONS);
        let connect_timeout = lookup("DATABASE_CONNECT_TIMEOUT")
            .and_then(|v| v.trim().parse().ok())
            .map_or(Self::DEFAULT_CONNECT_TIMEOUT, Duration::from_secs);

        Ok(Self {
            database_url,
            max_connections,
            connect_timeout,
        })
    }

    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Connect`] if the database cannot be reached.
    pub async fn connect(&self) -> Result<PgPool, PostgresError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.database_url)
            .await
            .map_err(PostgresError::Connect)?;
        tracing::info!(max_connections = self.max_connections, "Connected to Postgres");
        Ok(pool)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn url_is_required() {
        assert!(matches!(
            PostgresConfig::from_lookup(lookup(&[])),
            Err(PostgresError::Config(_))
        ));
        assert!(PostgresConfig::from_lookup(lookup(&[("DATABASE_URL", "  ")])).is_err());
    }

    #[test]
    fn tuning_falls_back_to_defaults() {
        let config = PostgresConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/ledger"),
            ("DATABASE_MAX_CONNECTIONS", "zero"),
            ("DATABASE_CONNECT_TIMEOUT", ""),
        ]))
        .unwrap();
        assert_eq!(config, PostgresConfig::new("postgres://localhost/ledger"));
    }

    #[test]
    fn tuning_is_read() {
        let config = PostgresConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/ledger"),
            ("DATABASE_MAX_CONNECTIONS", "3"),
            ("DATABASE_CONNECT_TIMEOUT", "12"),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.connect_timeout, Duration::from_secs(12));
    }
}
