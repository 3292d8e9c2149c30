use std::net::SocketAddr;
use std::sync::Arc;

use anon_session::app::{create_app_with, AppState};
use anon_session::config::MaskingPolicy;
use anon_session::db;
use anon_session::docs;
use anon_session::jwt::JwtConfig;
use anon_session::masking::RoleRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let pool = db::init().await?;
    let jwt = JwtConfig::from_env()?;
    let policy = MaskingPolicy::from_env()?;

    let registry = Arc::new(RoleRegistry::new());
    match registry.hydrate(&pool).await {
        Ok(count) => tracing::info!(count, "loaded masked roles from pg_seclabels"),
        Err(err) => tracing::warn!(error = %err, "could not load masked roles; registry starts empty"),
    }

    tracing::info!(
        enabled = policy.enabled,
        role = %policy.default_masked_role,
        fail_closed = policy.fail_closed_on_switch_error,
        "masking policy loaded"
    );

    let port = std::env::var("APP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8000);

    let openapi = docs::build_openapi(port)?;
    let app = create_app_with(AppState::new(pool, jwt, policy, registry)).merge(docs::swagger_routes(openapi)?);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    let _ = dotenvy::from_path(crate_env);
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
