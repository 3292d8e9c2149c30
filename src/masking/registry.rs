use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use sqlx::PgPool;

use crate::models::role::Role;

use super::identifier::{is_valid_identifier, unquote_identifier};
use super::switcher::ANON_LABEL_PROVIDER;

/// Known masked roles, shared by every scope in the process.
///
/// All mutations take the lock for the whole read-modify-write, so concurrent
/// upserts of the same name always converge on one record.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    roles: Mutex<BTreeMap<String, Role>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Role>> {
        // The map holds plain data; a panic elsewhere cannot leave it half-written.
        self.roles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a role without marking it applied. Existing records are kept.
    pub fn register(&self, name: &str, inherit_from: Option<&str>) -> Role {
        let mut roles = self.lock();
        roles
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(role = %name, "registered masked role");
                Role::new(name, inherit_from.map(str::to_string))
            })
            .clone()
    }

    /// Upsert `name` with `is_applied = true`.
    ///
    /// Call only after a verification read confirmed the role is active.
    pub fn ensure_applied(&self, name: &str) -> Role {
        let mut roles = self.lock();
        let role = roles.entry(name.to_string()).or_insert_with(|| Role::new(name, None));
        if !role.is_applied {
            role.mark_applied();
            tracing::info!(role = %name, "masked role marked as applied");
        }
        role.clone()
    }

    pub fn is_applied(&self, name: &str) -> bool {
        self.lock().get(name).map(|role| role.is_applied).unwrap_or(false)
    }

    /// Every known role, ordered by name.
    pub fn list(&self) -> Vec<Role> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Load roles already carrying the anonymizer's `MASKED` label.
    pub async fn hydrate(&self, pool: &PgPool) -> Result<usize, sqlx::Error> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT objname::text FROM pg_seclabels \
             WHERE provider = $1 AND objtype = 'role' AND label = 'MASKED' \
             ORDER BY objname",
        )
        .bind(ANON_LABEL_PROVIDER)
        .fetch_all(pool)
        .await?;

        let loaded = self.apply_labelled(names);
        tracing::info!(loaded, "hydrated role registry from database");
        Ok(loaded)
    }

    /// Mark every labelled role as applied. Names arrive as `quote_ident`
    /// renders them; anything still invalid once unquoted is skipped.
    pub fn apply_labelled<I>(&self, names: I) -> usize
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut loaded = 0;
        for name in names {
            let name = unquote_identifier(name.as_ref());
            if !is_valid_identifier(&name) {
                tracing::warn!(role = %name, "skipping labelled role with unsupported name");
                continue;
            }
            self.ensure_applied(&name);
            loaded += 1;
        }
        loaded
    }
}
