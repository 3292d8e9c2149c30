use crate::db::SessionConnection;
use crate::sql::role_label_sql;

use super::identifier::{is_valid_identifier, quote_identifier, quote_literal, safe_identifier};

/// Security label provider registered by the PostgreSQL Anonymizer extension.
pub const ANON_LABEL_PROVIDER: &str = "anon";

/// Predefined role (PostgreSQL 14+) granting read access to every relation.
const READ_ALL_DATA_ROLE: &str = "pg_read_all_data";

/// What happened during a role switch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The role existed and is now active.
    Switched,
    /// The role was created on demand and is now active.
    Created,
    /// The name failed identifier validation; no SQL was issued.
    Rejected,
    /// The role does not exist and auto-create was off.
    Missing,
    /// Auto-create was attempted and failed.
    CreateFailed,
    /// `SET ROLE` (or the existence check) failed.
    Failed,
}

impl SwitchOutcome {
    pub fn is_switched(self) -> bool {
        matches!(self, SwitchOutcome::Switched | SwitchOutcome::Created)
    }

    pub fn describe(self) -> &'static str {
        match self {
            SwitchOutcome::Switched => "switched",
            SwitchOutcome::Created => "created and switched",
            SwitchOutcome::Rejected => "role name rejected by identifier guard",
            SwitchOutcome::Missing => "role does not exist",
            SwitchOutcome::CreateFailed => "role could not be created",
            SwitchOutcome::Failed => "SET ROLE failed",
        }
    }
}

/// Issues every role-mutating statement in the crate.
///
/// Every operation is total: failures come back as `false` or a
/// [`SwitchOutcome`] and are logged, because these calls also run on cleanup
/// paths where an error must never replace the one already in flight.
#[derive(Debug, Clone)]
pub struct RoleSwitcher {
    /// Schemas granted `USAGE` + `SELECT` when `pg_read_all_data` is unavailable.
    grant_schemas: Vec<String>,
}

impl Default for RoleSwitcher {
    fn default() -> Self {
        Self {
            grant_schemas: vec!["public".to_string()],
        }
    }
}

impl RoleSwitcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grant_schemas(mut self, schemas: impl IntoIterator<Item = String>) -> Self {
        self.grant_schemas = schemas.into_iter().collect();
        self
    }

    pub async fn switch_to<C: SessionConnection + ?Sized>(&self, conn: &mut C, role: &str, auto_create: bool) -> bool {
        self.switch(conn, role, auto_create).await.is_switched()
    }

    /// Like [`switch_to`](Self::switch_to) but reports why a switch did not happen.
    pub async fn switch<C: SessionConnection + ?Sized>(&self, conn: &mut C, role: &str, auto_create: bool) -> SwitchOutcome {
        if !is_valid_identifier(role) {
            tracing::warn!(role_len = role.len(), "refusing to switch to role with unsafe name");
            return SwitchOutcome::Rejected;
        }

        let mut created = false;
        if auto_create {
            match role_exists(conn, role).await {
                Ok(true) => {}
                Ok(false) => {
                    if !self.create_role(conn, role, None).await {
                        return SwitchOutcome::CreateFailed;
                    }
                    created = true;
                }
                Err(err) => {
                    tracing::error!(role = %role, error = %err, "failed to check whether role exists");
                    return SwitchOutcome::Failed;
                }
            }
        }

        let sql = format!("SET ROLE {}", quote_identifier(role));
        match conn.execute(&sql).await {
            Ok(()) => {
                tracing::debug!(role = %role, created, "switched database role");
                if created {
                    SwitchOutcome::Created
                } else {
                    SwitchOutcome::Switched
                }
            }
            Err(err) => {
                tracing::warn!(role = %role, error = %err, "SET ROLE failed");
                if auto_create {
                    SwitchOutcome::Failed
                } else {
                    // Without an existence check we cannot tell a missing role from a
                    // permission error; report the common case.
                    SwitchOutcome::Missing
                }
            }
        }
    }

    pub async fn reset<C: SessionConnection + ?Sized>(&self, conn: &mut C) -> bool {
        match conn.execute("RESET ROLE").await {
            Ok(()) => {
                tracing::debug!("reset database role");
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "RESET ROLE failed");
                false
            }
        }
    }

    /// Put back the role that was active before a scope switched away from it.
    ///
    /// `None` means the session default, which `RESET ROLE` restores.
    pub async fn restore<C: SessionConnection + ?Sized>(&self, conn: &mut C, original: Option<&str>) -> bool {
        let Some(original) = original else {
            return self.reset(conn).await;
        };

        let Some(quoted) = safe_identifier(original) else {
            tracing::warn!(role = %original, "original role has an unsafe name; falling back to RESET ROLE");
            return self.reset(conn).await;
        };

        match conn.execute(&format!("SET ROLE {quoted}")).await {
            Ok(()) => {
                tracing::debug!(role = %original, "restored original database role");
                true
            }
            Err(err) => {
                tracing::error!(role = %original, error = %err, "failed to restore original role; resetting");
                self.reset(conn).await
            }
        }
    }

    /// Create a masked role. Returns `true` when the role already exists.
    pub async fn create_role<C: SessionConnection + ?Sized>(
        &self,
        conn: &mut C,
        role: &str,
        inherit_from: Option<&str>,
    ) -> bool {
        let Some(quoted) = safe_identifier(role) else {
            tracing::warn!(role_len = role.len(), "refusing to create role with unsafe name");
            return false;
        };

        let parent = match inherit_from {
            Some(parent) => match safe_identifier(parent) {
                Some(quoted_parent) => Some(quoted_parent),
                None => {
                    tracing::warn!(role = %role, "refusing to create role with unsafe parent role name");
                    return false;
                }
            },
            None => None,
        };

        match role_exists(conn, role).await {
            Ok(true) => {
                tracing::debug!(role = %role, "role already exists");
                return true;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(role = %role, error = %err, "failed to check whether role exists");
                return false;
            }
        }

        let create = match &parent {
            Some(parent) => format!("CREATE ROLE {quoted} NOLOGIN IN ROLE {parent}"),
            None => format!("CREATE ROLE {quoted} NOLOGIN"),
        };
        if !run(conn, role, &create).await {
            return false;
        }

        // Creating a role does not imply being allowed to SET ROLE to it on
        // newer servers.
        if !run(conn, role, &format!("GRANT {quoted} TO CURRENT_USER")).await {
            return false;
        }

        if !self.grant_read_access(conn, role, &quoted).await {
            return false;
        }

        if !label_role(conn, role).await {
            return false;
        }

        tracing::info!(role = %role, inherit_from = ?inherit_from, "created masked role");
        true
    }

    /// Re-apply read grants and the `MASKED` label to a role that already
    /// exists. Returns `false` when the role is missing or any step fails.
    pub async fn ensure_permissions<C: SessionConnection + ?Sized>(&self, conn: &mut C, role: &str) -> bool {
        let Some(quoted) = safe_identifier(role) else {
            tracing::warn!(role_len = role.len(), "refusing to fix permissions on role with unsafe name");
            return false;
        };

        match role_exists(conn, role).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(role = %role, "cannot fix permissions; role does not exist");
                return false;
            }
            Err(err) => {
                tracing::error!(role = %role, error = %err, "failed to check whether role exists");
                return false;
            }
        }

        if !self.grant_read_access(conn, role, &quoted).await || !label_role(conn, role).await {
            return false;
        }

        tracing::info!(role = %role, "re-applied masked role permissions");
        true
    }

    async fn grant_read_access<C: SessionConnection + ?Sized>(&self, conn: &mut C, role: &str, quoted: &str) -> bool {
        match role_exists(conn, READ_ALL_DATA_ROLE).await {
            Ok(true) => return run(conn, role, &format!("GRANT {READ_ALL_DATA_ROLE} TO {quoted}")).await,
            Ok(false) => {
                tracing::info!(role = %role, "pg_read_all_data unavailable; granting per schema");
            }
            Err(err) => {
                tracing::warn!(role = %role, error = %err, "could not check for pg_read_all_data; granting per schema");
            }
        }

        for schema in &self.grant_schemas {
            let Some(schema) = safe_identifier(schema) else {
                tracing::warn!(schema = %schema, "skipping grant on schema with unsafe name");
                continue;
            };
            if !run(conn, role, &format!("GRANT USAGE ON SCHEMA {schema} TO {quoted}")).await {
                return false;
            }
            if !run(conn, role, &format!("GRANT SELECT ON ALL TABLES IN SCHEMA {schema} TO {quoted}")).await {
                return false;
            }
        }

        true
    }
}

/// Look the role up in `pg_roles`. `name` must already be a valid identifier.
pub async fn role_exists<C: SessionConnection + ?Sized>(conn: &mut C, name: &str) -> Result<bool, sqlx::Error> {
    let sql = format!("SELECT rolname::text FROM pg_roles WHERE rolname = {}", quote_literal(name));
    Ok(conn.query_one(&sql).await?.is_some())
}

async fn label_role<C: SessionConnection + ?Sized>(conn: &mut C, role: &str) -> bool {
    match role_label_sql(role) {
        Ok(label) => run(conn, role, &label).await,
        Err(err) => {
            tracing::warn!(error = %err, "refusing to label role");
            false
        }
    }
}

async fn run<C: SessionConnection + ?Sized>(conn: &mut C, role: &str, sql: &str) -> bool {
    match conn.execute(sql).await {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(role = %role, error = %err, statement = %sql, "role setup statement failed");
            false
        }
    }
}
