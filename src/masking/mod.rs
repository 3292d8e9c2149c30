//! Database role scoping for masked sessions.
//!
//! A masked unit of work pins one pooled connection, switches it to the
//! masked role for the duration of the work, and puts the connection back
//! under its original role afterwards, even when the work fails or is
//! cancelled.

pub mod extension;
pub mod gate;
pub mod identifier;
pub mod middleware;
pub mod registry;
pub mod scope;
pub mod switcher;

#[cfg(test)]
pub(crate) mod testing;

use sqlx::pool::PoolConnection;
use sqlx::Postgres;

pub use extension::ExtensionStatus;
pub use gate::RequestGate;
pub use middleware::{mask_requests, MaskingLayer};
pub use registry::RoleRegistry;
pub use scope::{with_database_role, with_masked_session, MaskedSession, ScopeBuilder, ScopePhase, SessionScope, SessionState};
pub use switcher::{RoleSwitcher, SwitchOutcome};

/// Masked session handed to axum handlers when the gate runs over a `PgPool`.
pub type PgMaskedSession = MaskedSession<PoolConnection<Postgres>>;
