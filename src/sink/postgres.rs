//! PostgreSQL connector.
//!
//! Holds a single-connection pool and at most one open transaction. Each
//! insert runs inside its own savepoint so a constraint violation rolls back
//! that row only; the enclosing transaction stays usable for the rest of the
//! batch.

use async_trait::async_trait;
use snafu::IntoError;
use snafu::prelude::*;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Acquire, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SessionState, SinkConnector};
use crate::config::{SinkConfig, TlsMode};
use crate::error::{
    CommitSnafu, ConnectionLostSnafu, InsertSnafu, NotOpenSnafu, SinkError, SinkUnavailableSnafu,
};
use crate::fix::Fix;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl From<TlsMode> for PgSslMode {
    fn from(mode: TlsMode) -> Self {
        match mode {
            TlsMode::Disable => PgSslMode::Disable,
            TlsMode::Prefer => PgSslMode::Prefer,
            TlsMode::Require => PgSslMode::Require,
            TlsMode::VerifyCa => PgSslMode::VerifyCa,
            TlsMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

/// Connector writing fixes into one PostgreSQL table.
pub struct PostgresConnector {
    options: PgConnectOptions,
    name: String,
    insert_sql: String,
    connect_timeout: Duration,
    pool: Option<PgPool>,
    tx: Option<Transaction<'static, Postgres>>,
    broken: bool,
}

impl PostgresConnector {
    /// Build a connector from configuration. No connection is made until
    /// [`SinkConnector::ensure_open`].
    pub fn new(config: &SinkConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(config.password.expose())
            .ssl_mode(config.tls_mode.into())
            .application_name(env!("CARGO_PKG_NAME"));

        Self {
            options,
            name: format!("postgres://{}:{}/{}", config.host, config.port, config.database),
            insert_sql: insert_statement(&config.table),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool: None,
            tx: None,
            broken: false,
        }
    }

    /// Bound how long an open attempt may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn probe(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
    }

    async fn discard_transaction(&mut self) {
        if let Some(tx) = self.tx.take()
            && let Err(e) = tx.rollback().await
        {
            debug!("Rollback of abandoned transaction failed: {}", e);
        }
    }

    async fn open(&mut self) -> Result<(), SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.connect_timeout)
            .connect_with(self.options.clone())
            .await
            .boxed()
            .context(SinkUnavailableSnafu)?;

        self.pool = Some(pool);
        self.broken = false;
        info!("Connected to {}", self.name);
        Ok(())
    }
}

#[async_trait]
impl SinkConnector for PostgresConnector {
    async fn ensure_open(&mut self) -> Result<SessionState, SinkError> {
        self.discard_transaction().await;

        if let Some(pool) = &self.pool
            && !self.broken
        {
            match Self::probe(pool).await {
                Ok(()) => return Ok(SessionState::Reused),
                Err(e) => warn!("Liveness probe on {} failed: {}", self.name, e),
            }
        }

        self.close().await;
        self.open().await?;
        Ok(SessionState::Opened)
    }

    async fn insert(&mut self, fix: &Fix) -> Result<(), SinkError> {
        if self.tx.is_none() {
            let pool = self.pool.as_ref().context(NotOpenSnafu)?;
            match pool.begin().await {
                Ok(tx) => self.tx = Some(tx),
                Err(e) => {
                    self.broken = true;
                    return Err(connection_lost(e));
                }
            }
        }
        let Some(tx) = self.tx.as_mut() else {
            return NotOpenSnafu.fail();
        };

        let mut savepoint = match tx.begin().await {
            Ok(savepoint) => savepoint,
            Err(e) => {
                self.broken = true;
                return Err(connection_lost(e));
            }
        };

        let result = sqlx::query(&self.insert_sql)
            .bind(fix.timestamp)
            .bind(fix.latitude)
            .bind(fix.longitude)
            .bind(fix.altitude)
            .bind(fix.speed)
            .execute(&mut *savepoint)
            .await;

        let outcome = match result {
            Ok(_) => savepoint.commit().await.map_err(connection_lost),
            Err(e @ sqlx::Error::Database(_)) => match savepoint.rollback().await {
                Ok(()) => Err(InsertSnafu {
                    row: fix.to_string(),
                }
                .into_error(Box::new(e))),
                Err(rollback) => Err(connection_lost(rollback)),
            },
            Err(e) => Err(connection_lost(e)),
        };

        if let Err(e) = &outcome
            && e.is_connection_fault()
        {
            self.broken = true;
        }
        outcome
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        if let Err(e) = tx.commit().await {
            self.broken = true;
            return Err(CommitSnafu.into_error(Box::new(e)));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.discard_transaction().await;
        if let Some(pool) = self.pool.take() {
            pool.close().await;
            debug!("Closed connection to {}", self.name);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn connection_lost(source: sqlx::Error) -> SinkError {
    ConnectionLostSnafu.into_error(Box::new(source))
}

fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (\"timestamp\", latitude, longitude, altitude, speed) \
         VALUES ($1, $2, $3, $4, $5)"
    )
}
