//! Installation state of the PostgreSQL Anonymizer extension.

use crate::db::SessionConnection;

const INSTALLED_VERSION_SQL: &str = "SELECT extversion::text FROM pg_extension WHERE extname = 'anon'";
const RUNTIME_VERSION_SQL: &str = "SELECT anon.version()::text";
const LABEL_COUNT_SQL: &str = "SELECT count(*)::text FROM pg_seclabels WHERE provider = 'anon'";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionStatus {
    /// `pg_extension.extversion`, `None` when the extension is not installed.
    pub installed_version: Option<String>,
    /// What `anon.version()` reports. Older releases lack the function.
    pub runtime_version: Option<String>,
    /// Security labels registered under the `anon` provider.
    pub label_count: u64,
}

impl ExtensionStatus {
    pub fn is_installed(&self) -> bool {
        self.installed_version.is_some()
    }

    /// Read the status over `conn`. Only the catalog lookup is required;
    /// `anon.version()` is skipped when the extension is missing and
    /// tolerated when it fails.
    pub async fn load<C: SessionConnection + ?Sized>(conn: &mut C) -> Result<Self, sqlx::Error> {
        let installed_version = conn.query_one(INSTALLED_VERSION_SQL).await?;

        let runtime_version = if installed_version.is_some() {
            match conn.query_one(RUNTIME_VERSION_SQL).await {
                Ok(version) => version,
                Err(err) => {
                    tracing::debug!(error = %err, "anon.version() unavailable");
                    None
                }
            }
        } else {
            None
        };

        let label_count = conn
            .query_one(LABEL_COUNT_SQL)
            .await?
            .and_then(|count| count.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            installed_version,
            runtime_version,
            label_count,
        })
    }
}
