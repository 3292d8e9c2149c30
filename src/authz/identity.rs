use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;

use super::principal::Principal;
use super::IdentityError;
use crate::jwt::JwtConfig;

/// Identity facts the masking gate asks about the current caller.
#[async_trait]
pub trait CallerIdentity: Send + Sync {
    async fn is_authenticated(&self) -> Result<bool, IdentityError>;

    async fn groups(&self) -> Result<HashSet<String>, IdentityError>;
}

#[async_trait]
impl CallerIdentity for Principal {
    async fn is_authenticated(&self) -> Result<bool, IdentityError> {
        Ok(true)
    }

    async fn groups(&self) -> Result<HashSet<String>, IdentityError> {
        Ok(self.groups.clone())
    }
}

/// `None` is an anonymous caller.
#[async_trait]
impl CallerIdentity for Option<Principal> {
    async fn is_authenticated(&self) -> Result<bool, IdentityError> {
        Ok(self.is_some())
    }

    async fn groups(&self) -> Result<HashSet<String>, IdentityError> {
        Ok(self.as_ref().map(|p| p.groups.clone()).unwrap_or_default())
    }
}

/// Outcome of resolving a request's credentials.
pub type IdentityResolution = Result<Option<Principal>, IdentityError>;

#[async_trait]
impl CallerIdentity for IdentityResolution {
    async fn is_authenticated(&self) -> Result<bool, IdentityError> {
        match self {
            Ok(principal) => principal.is_authenticated().await,
            Err(err) => Err(err.clone()),
        }
    }

    async fn groups(&self) -> Result<HashSet<String>, IdentityError> {
        match self {
            Ok(principal) => principal.groups().await,
            Err(err) => Err(err.clone()),
        }
    }
}

/// Turns request headers into a caller identity.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> IdentityResolution;
}

/// Bearer-token identity with group membership carried in the `groups` claim.
#[derive(Debug, Clone)]
pub struct JwtIdentityProvider {
    jwt: Arc<JwtConfig>,
}

impl JwtIdentityProvider {
    pub fn new(jwt: Arc<JwtConfig>) -> Self {
        Self { jwt }
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn resolve(&self, headers: &HeaderMap) -> IdentityResolution {
        let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
            return Ok(None);
        };

        let token = value
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| IdentityError::InvalidCredentials("malformed Authorization header".to_string()))?;

        self.jwt
            .decode(token)
            .map(|claims| Some(Principal::from(claims)))
            .map_err(|err| IdentityError::InvalidCredentials(err.to_string()))
    }
}
