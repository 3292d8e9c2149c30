//! axum adapter for [`RequestGate`].

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::authz::IdentityProvider;
use crate::config::MaskingPolicy;
use crate::db::ConnectionSource;
use crate::errors::AppError;

use super::gate::RequestGate;

/// State for [`mask_requests`]: everything the gate needs per request.
pub struct MaskingLayer<S> {
    pub gate: Arc<RequestGate>,
    pub source: S,
    pub policy: Arc<MaskingPolicy>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl<S: Clone> Clone for MaskingLayer<S> {
    fn clone(&self) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
            source: self.source.clone(),
            policy: Arc::clone(&self.policy),
            identity: Arc::clone(&self.identity),
        }
    }
}

impl<S> MaskingLayer<S> {
    pub fn new(gate: Arc<RequestGate>, source: S, policy: Arc<MaskingPolicy>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            gate,
            source,
            policy,
            identity,
        }
    }
}

/// Runs the rest of the stack inside the gate. When the request is masked,
/// the pinned session is available to handlers as
/// `Extension<MaskedSession<S::Connection>>`.
pub async fn mask_requests<S>(State(layer): State<MaskingLayer<S>>, request: Request, next: Next) -> Response
where
    S: ConnectionSource + Clone + 'static,
{
    let caller = layer.identity.resolve(request.headers());
    // Snapshot: a reload elsewhere cannot change the policy mid-request.
    let policy = Arc::clone(&layer.policy);

    let outcome = layer
        .gate
        .wrap(&layer.source, &caller, &policy, move |session| async move {
            let mut request = request;
            if let Some(session) = session {
                request.extensions_mut().insert(session);
            }
            next.run(request).await
        })
        .await;

    match outcome {
        Ok(response) => response,
        Err(err) => AppError::from(err).into_response(),
    }
}
