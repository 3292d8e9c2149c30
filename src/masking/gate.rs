use std::future::Future;
use std::sync::Arc;

use crate::authz::CallerIdentity;
use crate::config::MaskingPolicy;
use crate::db::{ConnectionSource, PinnedConnection};
use crate::errors::MaskingError;

use super::registry::RoleRegistry;
use super::scope::{MaskedSession, SessionScope};
use super::switcher::RoleSwitcher;

/// Per-unit-of-work masking policy.
///
/// Decides from the caller's identity whether the work runs under the masked
/// role, and never lets a failure in that decision escape: identity errors
/// mean "do not mask", and a failed role switch either degrades to unmasked
/// or refuses the work, as the policy says.
#[derive(Debug, Clone)]
pub struct RequestGate {
    switcher: RoleSwitcher,
    registry: Arc<RoleRegistry>,
}

impl RequestGate {
    pub fn new(registry: Arc<RoleRegistry>) -> Self {
        Self {
            switcher: RoleSwitcher::default(),
            registry,
        }
    }

    pub fn with_switcher(mut self, switcher: RoleSwitcher) -> Self {
        self.switcher = switcher;
        self
    }

    pub fn registry(&self) -> &Arc<RoleRegistry> {
        &self.registry
    }

    pub async fn should_mask(&self, caller: &dyn CallerIdentity, policy: &MaskingPolicy) -> bool {
        if !policy.enabled {
            return false;
        }

        match caller.is_authenticated().await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "identity lookup failed; not masking");
                return false;
            }
        }

        match caller.groups().await {
            Ok(groups) => groups.iter().any(|group| policy.masked_groups.contains(group)),
            Err(err) => {
                tracing::warn!(error = %err, "group lookup failed; not masking");
                false
            }
        }
    }

    /// Run `work`, masked when the policy applies to `caller`.
    ///
    /// `work` receives the masked session, or `None` when it runs unmasked.
    /// Whatever `work` returns is passed through untouched; the only error
    /// produced here is a refused switch under a fail-closed policy.
    pub async fn wrap<S, F, Fut, T>(
        &self,
        source: &S,
        caller: &dyn CallerIdentity,
        policy: &MaskingPolicy,
        work: F,
    ) -> Result<T, MaskingError>
    where
        S: ConnectionSource,
        F: FnOnce(Option<MaskedSession<S::Connection>>) -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.should_mask(caller, policy).await {
            return Ok(work(None).await);
        }

        let role = policy.default_masked_role.as_str();

        let conn = match source.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(role = %role, error = %err, "could not pin a connection for masked session");
                let failure = MaskingError::role_switch_failed(role, "no dedicated connection available");
                return self.degrade(policy, failure, work).await;
            }
        };

        let mut scope = SessionScope::new(PinnedConnection::new(conn), self.switcher.clone())
            .with_registry(Arc::clone(&self.registry));

        let entered = scope
            .enter(role, true, policy.mask_search_path.as_deref())
            .await
            .map(|_| ());
        if let Err(failure) = entered {
            drop(scope);
            return self.degrade(policy, failure, work).await;
        }

        let session = MaskedSession {
            connection: scope.connection().clone(),
            role: role.to_string(),
        };
        let result = work(Some(session)).await;
        scope.exit().await;

        Ok(result)
    }

    async fn degrade<C, F, Fut, T>(&self, policy: &MaskingPolicy, failure: MaskingError, work: F) -> Result<T, MaskingError>
    where
        F: FnOnce(Option<MaskedSession<C>>) -> Fut,
        Fut: Future<Output = T>,
    {
        if policy.fail_closed_on_switch_error {
            tracing::error!(role = %failure.role(), error = %failure, "masked role unavailable; refusing unit of work");
            return Err(failure);
        }

        tracing::error!(role = %failure.role(), error = %failure, "masked role unavailable; continuing unmasked");
        Ok(work(None).await)
    }
}
