//! The database boundary used by the session core.
//!
//! The core needs three things from a connection: run a statement, read a
//! single scalar, and a way to pin one physical connection for the whole
//! lifetime of a scope. [`SessionConnection`] covers the first two,
//! [`ConnectionSource`] plus [`PinnedConnection`] cover the pinning.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, PgConnection, PgPool, Postgres, Transaction};
use tokio::sync::{Mutex, MutexGuard};

/// A single physical database session.
#[async_trait]
pub trait SessionConnection: Send + 'static {
    /// Run one statement, discarding any rows.
    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error>;

    /// Read the first column of the first row as text. SQL `NULL` and an
    /// empty result both come back as `None`.
    async fn query_one(&mut self, sql: &str) -> Result<Option<String>, sqlx::Error>;

    /// Whether the session is inside a larger, caller-owned transaction.
    fn in_transaction(&self) -> bool {
        false
    }
}

async fn execute_on(conn: &mut PgConnection, sql: &str) -> Result<(), sqlx::Error> {
    // &str goes through the simple query protocol, which accepts utility
    // statements such as SET ROLE and SECURITY LABEL.
    Executor::execute(conn, sql).await.map(|_| ())
}

async fn query_one_on(conn: &mut PgConnection, sql: &str) -> Result<Option<String>, sqlx::Error> {
    let value: Option<Option<String>> = sqlx::query_scalar(sql).fetch_optional(conn).await?;
    Ok(value.flatten())
}

#[async_trait]
impl SessionConnection for PgConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        execute_on(self, sql).await
    }

    async fn query_one(&mut self, sql: &str) -> Result<Option<String>, sqlx::Error> {
        query_one_on(self, sql).await
    }
}

#[async_trait]
impl SessionConnection for PoolConnection<Postgres> {
    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        execute_on(&mut **self, sql).await
    }

    async fn query_one(&mut self, sql: &str) -> Result<Option<String>, sqlx::Error> {
        query_one_on(&mut **self, sql).await
    }
}

#[async_trait]
impl SessionConnection for Transaction<'static, Postgres> {
    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        execute_on(&mut **self, sql).await
    }

    async fn query_one(&mut self, sql: &str) -> Result<Option<String>, sqlx::Error> {
        query_one_on(&mut **self, sql).await
    }

    fn in_transaction(&self) -> bool {
        true
    }
}

const LEAKED_ROLE_SQL: &str = "SELECT CASE WHEN current_user = session_user THEN NULL ELSE current_user::text END";
const LEAKED_SEARCH_PATH_SQL: &str = "SELECT CASE WHEN current_setting('search_path') = \
     (SELECT reset_val FROM pg_settings WHERE name = 'search_path') \
     THEN NULL ELSE current_setting('search_path') END";

/// Put a connection coming back to its pool into its login state: session
/// role and the server's default `search_path`.
///
/// Returns whether anything had to be reset.
pub async fn reset_leaked_session<C: SessionConnection + ?Sized>(conn: &mut C) -> Result<bool, sqlx::Error> {
    let mut reset = false;

    if let Some(role) = conn.query_one(LEAKED_ROLE_SQL).await? {
        tracing::error!(role = %role, "connection released with alternate role active; resetting");
        conn.execute("RESET ROLE").await?;
        reset = true;
    }

    if let Some(path) = conn.query_one(LEAKED_SEARCH_PATH_SQL).await? {
        tracing::warn!(search_path = %path, "connection released with non-default search_path; resetting");
        conn.execute("RESET search_path").await?;
        reset = true;
    }

    Ok(reset)
}

/// Hands out dedicated connections for the duration of a scope.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    type Connection: SessionConnection;

    async fn acquire(&self) -> Result<Self::Connection, sqlx::Error>;
}

#[async_trait]
impl ConnectionSource for PgPool {
    type Connection = PoolConnection<Postgres>;

    async fn acquire(&self) -> Result<Self::Connection, sqlx::Error> {
        PgPool::acquire(self).await
    }
}

/// One physical connection, exclusively owned by a scope.
///
/// Clones share the same connection. The mutex serialises every statement,
/// so nothing can interleave with the scope's role switch or reset, and the
/// connection goes back to its pool only when the last clone is dropped.
pub struct PinnedConnection<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> Clone for PinnedConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: SessionConnection> PinnedConnection<C> {
    pub fn new(conn: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, C> {
        self.inner.lock().await
    }
}

impl<C> std::fmt::Debug for PinnedConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedConnection")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}
