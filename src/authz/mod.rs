//! Caller identity as seen by the masking gate.
//!
//! The gate only needs two facts about a caller: whether they are
//! authenticated and which groups they belong to. Both lookups are fallible;
//! the gate treats any error as "not authenticated".

mod identity;
mod principal;

pub use identity::{CallerIdentity, IdentityProvider, IdentityResolution, JwtIdentityProvider};
pub use principal::Principal;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Well-known group names
pub mod groups {
    pub const VIEW_MASKED_DATA: &str = "view_masked_data";
}
