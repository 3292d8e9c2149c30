use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::errors::AppError;

pub mod connection;

pub use connection::{reset_leaked_session, ConnectionSource, PinnedConnection, SessionConnection};

#[derive(Debug, Clone)]
pub struct DbConfig {
	pub url: String,
	pub max_connections: u32,
	pub acquire_timeout: Duration,
}

impl DbConfig {
	pub fn from_env() -> Result<Self, AppError> {
		let url = std::env::var("DATABASE_URL").map_err(|_| AppError::configuration("DATABASE_URL not set"))?;
		let max_connections = std::env::var("DB_MAX_CONNECTIONS")
			.map(|val| val.parse::<u32>())
			.unwrap_or(Ok(10))
			.map_err(|_| AppError::configuration("DB_MAX_CONNECTIONS must be a valid integer"))?;
		let acquire_secs = std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
			.map(|val| val.parse::<u64>())
			.unwrap_or(Ok(10))
			.map_err(|_| AppError::configuration("DB_ACQUIRE_TIMEOUT_SECS must be a valid integer"))?;

		Ok(Self {
			url,
			max_connections,
			acquire_timeout: Duration::from_secs(acquire_secs),
		})
	}
}

pub async fn init() -> anyhow::Result<PgPool> {
	let config = DbConfig::from_env()?;
	connect(&config).await
}

pub async fn connect(config: &DbConfig) -> anyhow::Result<PgPool> {
	// Every connection handed out must start at the session default role;
	// a connection that somehow comes back with an alternate role is reset
	// before reuse.
	let pool = PgPoolOptions::new()
		.max_connections(config.max_connections)
		.min_connections(1)
		.acquire_timeout(config.acquire_timeout)
		.after_release(|conn, _meta| {
			Box::pin(async move {
				reset_leaked_session(&mut *conn).await?;
				Ok(true)
			})
		})
		.connect(&config.url)
		.await
		.context("failed to connect to database")?;

	Ok(pool)
}
