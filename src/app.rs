use std::sync::Arc;

use axum::http::Method;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authz::{IdentityProvider, JwtIdentityProvider};
use crate::config::MaskingPolicy;
use crate::errors::AppError;
use crate::jwt::JwtConfig;
use crate::masking::{mask_requests, MaskingLayer, RequestGate, RoleRegistry};
use crate::routes::{anon, health};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub jwt: Arc<JwtConfig>,
    pub policy: Arc<MaskingPolicy>,
    pub gate: Arc<RequestGate>,
}

impl AppState {
    pub fn new(pool: PgPool, jwt: JwtConfig, policy: MaskingPolicy, registry: Arc<RoleRegistry>) -> Self {
        Self {
            pool,
            jwt: Arc::new(jwt),
            policy: Arc::new(policy),
            gate: Arc::new(RequestGate::new(registry)),
        }
    }
}

pub async fn create_app(pool: PgPool) -> Result<Router, AppError> {
    let jwt_config = JwtConfig::from_env()?;
    let policy = MaskingPolicy::from_env()?;
    let state = AppState::new(pool, jwt_config, policy, Arc::new(RoleRegistry::new()));

    Ok(create_app_with(state))
}

/// Build the router around an already assembled state.
pub fn create_app_with(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    let identity: Arc<dyn IdentityProvider> = Arc::new(JwtIdentityProvider::new(Arc::clone(&state.jwt)));
    let masking = MaskingLayer::new(
        Arc::clone(&state.gate),
        state.pool.clone(),
        Arc::clone(&state.policy),
        identity,
    );

    let anon_routes = Router::new().route("/status", get(anon::status));

    Router::new()
        .route("/api/health", get(health::health))
        .nest("/api/anon", anon_routes)
        .route_layer(from_fn_with_state(masking, mask_requests::<PgPool>))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
