//! Scoped acquisition of an alternate database role.
//!
//! A [`SessionScope`] pins one physical connection, switches it to a role on
//! [`enter`](SessionScope::enter) and puts the previous role and search path
//! back on [`exit`](SessionScope::exit). A scope dropped while still active
//! (a panic in the body, a cancelled request future) schedules the exit on
//! the runtime before the connection can return to its pool.

use std::future::Future;
use std::sync::Arc;

use crate::config::MaskingPolicy;
use crate::db::{ConnectionSource, PinnedConnection, SessionConnection};
use crate::errors::MaskingError;

use super::identifier::{quote_literal, quoted_schema_list};
use super::registry::RoleRegistry;
use super::switcher::{RoleSwitcher, SwitchOutcome};

const CAPTURE_ORIGINAL_ROLE_SQL: &str =
    "SELECT CASE WHEN current_user = session_user THEN NULL ELSE current_user::text END";
const CURRENT_USER_SQL: &str = "SELECT current_user::text";
const CURRENT_SEARCH_PATH_SQL: &str = "SELECT current_setting('search_path')";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePhase {
    Idle,
    Entering,
    Active,
    Exiting,
    Failed,
}

/// What a scope needs to undo on exit. Lives only while the scope is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Role active before entry; `None` when it was the session default.
    pub original_role: Option<String>,
    pub target_role: String,
    /// Captured only when the scope runs inside a caller-owned transaction.
    pub search_path_captured: Option<String>,
    pub search_path_routed: bool,
}

/// A pinned connection currently running under a masked role.
pub struct MaskedSession<C> {
    pub connection: PinnedConnection<C>,
    pub role: String,
}

impl<C> Clone for MaskedSession<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            role: self.role.clone(),
        }
    }
}

impl<C> std::fmt::Debug for MaskedSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskedSession").field("role", &self.role).finish()
    }
}

pub struct SessionScope<C: SessionConnection> {
    conn: PinnedConnection<C>,
    switcher: RoleSwitcher,
    registry: Option<Arc<RoleRegistry>>,
    state: Option<SessionState>,
    phase: ScopePhase,
}

impl<C: SessionConnection> SessionScope<C> {
    pub fn new(conn: PinnedConnection<C>, switcher: RoleSwitcher) -> Self {
        Self {
            conn,
            switcher,
            registry: None,
            state: None,
            phase: ScopePhase::Idle,
        }
    }

    pub fn with_registry(mut self, registry: Arc<RoleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn phase(&self) -> ScopePhase {
        self.phase
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn connection(&self) -> &PinnedConnection<C> {
        &self.conn
    }

    /// Switch the pinned connection to `role`.
    ///
    /// Fails with [`MaskingError::RoleSwitchFailed`] when the role cannot be
    /// assumed; the scope is then `Failed` and needs no exit.
    pub async fn enter(
        &mut self,
        role: &str,
        auto_create: bool,
        search_path: Option<&str>,
    ) -> Result<&SessionState, MaskingError> {
        if self.phase != ScopePhase::Idle {
            return Err(MaskingError::role_switch_failed(role, "scope is already in use"));
        }
        self.phase = ScopePhase::Entering;

        let mut conn = self.conn.lock().await;

        let original_role = match conn.query_one(CAPTURE_ORIGINAL_ROLE_SQL).await {
            Ok(original) => original,
            Err(err) => {
                tracing::warn!(error = %err, "could not capture original role; will reset to session default");
                None
            }
        };

        let search_path_captured = if conn.in_transaction() {
            match conn.query_one(CURRENT_SEARCH_PATH_SQL).await {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!(error = %err, "could not capture search_path inside transaction");
                    None
                }
            }
        } else {
            None
        };

        // Known from here on, so a scope dropped mid-entry can put it back.
        self.state = Some(SessionState {
            original_role: original_role.clone(),
            target_role: role.to_string(),
            search_path_captured: search_path_captured.clone(),
            search_path_routed: false,
        });

        let registry = self.registry.as_deref();
        // A role the registry has already verified skips the existence check.
        // Inside a transaction a failed SET ROLE would abort it, so check there.
        let trust_registry = auto_create && !conn.in_transaction() && registry.map(|r| r.is_applied(role)).unwrap_or(false);

        let mut outcome = self.switcher.switch(&mut *conn, role, auto_create && !trust_registry).await;
        if trust_registry && !outcome.is_switched() {
            // The registry can go stale when the role is dropped behind our back.
            tracing::warn!(role = %role, outcome = outcome.describe(), "registered role unavailable; probing and recreating");
            outcome = self.switcher.switch(&mut *conn, role, true).await;
        }
        if !outcome.is_switched() {
            self.state = None;
            self.phase = ScopePhase::Failed;
            tracing::warn!(role = %role, outcome = outcome.describe(), "scope entry failed");
            return Err(MaskingError::role_switch_failed(role, outcome.describe()));
        }

        if outcome == SwitchOutcome::Created {
            if let Some(registry) = registry {
                registry.register(role, None);
            }
        }

        match conn.query_one(CURRENT_USER_SQL).await {
            Ok(Some(active)) if active == role => {
                if let Some(registry) = registry {
                    registry.ensure_applied(role);
                }
            }
            Ok(active) => {
                tracing::error!(role = %role, active = ?active, "role switch did not take effect");
                self.switcher.restore(&mut *conn, original_role.as_deref()).await;
                self.state = None;
                self.phase = ScopePhase::Failed;
                return Err(MaskingError::role_switch_failed(role, "active role does not match after SET ROLE"));
            }
            Err(err) => {
                tracing::warn!(role = %role, error = %err, "could not verify role switch");
            }
        }

        let search_path_routed = match search_path {
            Some(path) => route_search_path(&mut *conn, path).await,
            None => false,
        };

        drop(conn);

        tracing::debug!(role = %role, original = ?original_role, search_path_routed, "entered role scope");
        self.phase = ScopePhase::Active;
        let state = self.state.get_or_insert_with(|| SessionState {
            original_role,
            target_role: role.to_string(),
            search_path_captured,
            search_path_routed,
        });
        state.search_path_routed = search_path_routed;
        Ok(&*state)
    }

    /// Restore the search path and role. Best effort and idempotent.
    pub async fn exit(&mut self) {
        if !matches!(self.phase, ScopePhase::Active | ScopePhase::Exiting) {
            return;
        }
        self.phase = ScopePhase::Exiting;

        if let Some(state) = self.state.clone() {
            let mut conn = self.conn.lock().await;
            restore_session(&self.switcher, &mut *conn, &state).await;
        }

        self.state = None;
        self.phase = ScopePhase::Idle;
    }

    /// Enter, run `work` with the pinned connection, then exit.
    pub async fn run<F, Fut, T>(
        mut self,
        role: &str,
        auto_create: bool,
        search_path: Option<&str>,
        work: F,
    ) -> Result<T, MaskingError>
    where
        F: FnOnce(MaskedSession<C>) -> Fut,
        Fut: Future<Output = T>,
    {
        self.enter(role, auto_create, search_path).await?;
        let session = MaskedSession {
            connection: self.conn.clone(),
            role: role.to_string(),
        };
        let result = work(session).await;
        self.exit().await;
        Ok(result)
    }
}

impl<C: SessionConnection> Drop for SessionScope<C> {
    fn drop(&mut self) {
        // Interrupted mid-switch the role may or may not have changed; put
        // back the captured original, or reset when capture had not finished.
        let pending = match self.phase {
            ScopePhase::Active | ScopePhase::Exiting | ScopePhase::Entering => Some(self.state.take()),
            ScopePhase::Idle | ScopePhase::Failed => None,
        };
        let Some(pending) = pending else {
            return;
        };

        let conn = self.conn.clone();
        let switcher = self.switcher.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(phase = ?self.phase, "role scope dropped before exit; scheduling restore");
                handle.spawn(async move {
                    let mut guard = conn.lock().await;
                    match pending {
                        Some(state) => restore_session(&switcher, &mut *guard, &state).await,
                        None => {
                            switcher.reset(&mut *guard).await;
                        }
                    }
                });
            }
            Err(_) => {
                tracing::error!(phase = ?self.phase, "role scope dropped outside a runtime; role was not reset");
            }
        }
    }
}

async fn route_search_path<C: SessionConnection + ?Sized>(conn: &mut C, search_path: &str) -> bool {
    let Some(schemas) = quoted_schema_list(search_path) else {
        tracing::warn!(search_path = %search_path, "refusing unsafe masking search_path");
        return false;
    };

    match conn.execute(&format!("SET search_path TO {schemas}")).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "failed to set masking search_path; continuing with raw search_path");
            false
        }
    }
}

async fn restore_session<C: SessionConnection + ?Sized>(switcher: &RoleSwitcher, conn: &mut C, state: &SessionState) {
    let restore_path = match &state.search_path_captured {
        Some(path) => format!("SELECT set_config('search_path', {}, false)", quote_literal(path)),
        None => "RESET search_path".to_string(),
    };
    if let Err(err) = conn.execute(&restore_path).await {
        tracing::error!(error = %err, "failed to restore search_path");
    }

    if switcher.restore(conn, state.original_role.as_deref()).await {
        tracing::debug!(role = %state.target_role, "left role scope");
    } else {
        tracing::error!(role = %state.target_role, "failed to restore database role");
    }
}

/// Configures and runs one scope; the higher-order replacement for wrapping
/// a function in a masked session.
#[derive(Debug, Clone)]
pub struct ScopeBuilder {
    role: String,
    auto_create: bool,
    search_path: Option<String>,
    switcher: RoleSwitcher,
    registry: Option<Arc<RoleRegistry>>,
}

impl ScopeBuilder {
    /// The policy's masked role, created on demand, with the masking search path.
    pub fn masked(policy: &MaskingPolicy) -> Self {
        Self {
            role: policy.default_masked_role.clone(),
            auto_create: true,
            search_path: policy.mask_search_path.clone(),
            switcher: RoleSwitcher::default(),
            registry: None,
        }
    }

    /// An arbitrary existing role; nothing is created and the search path is untouched.
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            auto_create: false,
            search_path: None,
            switcher: RoleSwitcher::default(),
            registry: None,
        }
    }

    pub fn auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    pub fn switcher(mut self, switcher: RoleSwitcher) -> Self {
        self.switcher = switcher;
        self
    }

    pub fn registry(mut self, registry: Arc<RoleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn run<S, F, Fut, T>(self, source: &S, work: F) -> Result<T, MaskingError>
    where
        S: ConnectionSource,
        F: FnOnce(MaskedSession<S::Connection>) -> Fut,
        Fut: Future<Output = T>,
    {
        let conn = source.acquire().await.map_err(|err| {
            tracing::error!(role = %self.role, error = %err, "could not pin a connection for role scope");
            MaskingError::role_switch_failed(&self.role, "no dedicated connection available")
        })?;
        self.run_on(PinnedConnection::new(conn), work).await
    }

    pub async fn run_on<C, F, Fut, T>(self, conn: PinnedConnection<C>, work: F) -> Result<T, MaskingError>
    where
        C: SessionConnection,
        F: FnOnce(MaskedSession<C>) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut scope = SessionScope::new(conn, self.switcher);
        if let Some(registry) = self.registry {
            scope = scope.with_registry(registry);
        }
        scope
            .run(&self.role, self.auto_create, self.search_path.as_deref(), work)
            .await
    }
}

/// Run `work` under the policy's masked role.
pub async fn with_masked_session<S, F, Fut, T>(source: &S, policy: &MaskingPolicy, work: F) -> Result<T, MaskingError>
where
    S: ConnectionSource,
    F: FnOnce(MaskedSession<S::Connection>) -> Fut,
    Fut: Future<Output = T>,
{
    ScopeBuilder::masked(policy).run(source, work).await
}

/// Run `work` under an existing role. Fails when the role cannot be assumed.
pub async fn with_database_role<S, F, Fut, T>(source: &S, role: &str, work: F) -> Result<T, MaskingError>
where
    S: ConnectionSource,
    F: FnOnce(MaskedSession<S::Connection>) -> Fut,
    Fut: Future<Output = T>,
{
    ScopeBuilder::role(role).run(source, work).await
}
