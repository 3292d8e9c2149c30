#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use anon_session::db::{ConnectionSource, SessionConnection};

#[derive(Debug, Default)]
struct FakeSession {
    log: Vec<String>,
    roles: HashSet<String>,
    current_role: Option<String>,
    search_path: Option<String>,
    fail_prefixes: Vec<String>,
}

/// Postgres session double: keeps role and search_path state and records
/// every statement it sees. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeConnection {
    inner: Arc<Mutex<FakeSession>>,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(self, role: &str) -> Self {
        self.inner.lock().unwrap().roles.insert(role.to_string());
        self
    }

    pub fn failing_on(self, prefix: &str) -> Self {
        self.inner.lock().unwrap().fail_prefixes.push(prefix.to_string());
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|sql| sql.starts_with(prefix)).count()
    }

    pub fn current_role(&self) -> Option<String> {
        self.inner.lock().unwrap().current_role.clone()
    }

    pub fn search_path(&self) -> Option<String> {
        self.inner.lock().unwrap().search_path.clone()
    }
}

#[async_trait]
impl SessionConnection for FakeConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        let mut session = self.inner.lock().unwrap();
        session.log.push(sql.to_string());

        if session.fail_prefixes.iter().any(|p| sql.starts_with(p.as_str())) {
            return Err(sqlx::Error::Protocol(format!("simulated failure: {sql}")));
        }

        if let Some(role) = sql.strip_prefix("SET ROLE ") {
            let role = role.trim_matches('"').to_string();
            if !session.roles.contains(&role) {
                return Err(sqlx::Error::Protocol(format!("role \"{role}\" does not exist")));
            }
            session.current_role = Some(role);
        } else if sql == "RESET ROLE" {
            session.current_role = None;
        } else if let Some(rest) = sql.strip_prefix("CREATE ROLE \"") {
            if let Some(end) = rest.find('"') {
                let role = rest[..end].to_string();
                session.roles.insert(role);
            }
        } else if let Some(path) = sql.strip_prefix("SET search_path TO ") {
            session.search_path = Some(path.replace('"', ""));
        } else if sql == "RESET search_path" {
            session.search_path = None;
        }

        Ok(())
    }

    async fn query_one(&mut self, sql: &str) -> Result<Option<String>, sqlx::Error> {
        let mut session = self.inner.lock().unwrap();
        session.log.push(sql.to_string());

        if let Some(rest) = sql.split("rolname = '").nth(1) {
            let role = rest.trim_end_matches('\'');
            return Ok(session.roles.contains(role).then(|| role.to_string()));
        }
        if sql.starts_with("SELECT CASE WHEN current_user = session_user") {
            return Ok(session.current_role.clone());
        }
        if sql == "SELECT current_user::text" {
            return Ok(Some(session.current_role.clone().unwrap_or_else(|| "app".to_string())));
        }

        Ok(None)
    }
}

/// Hands out clones of one [`FakeConnection`], counting acquisitions.
#[derive(Debug, Clone, Default)]
pub struct FakeSource {
    pub conn: FakeConnection,
    acquired: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn new(conn: &FakeConnection) -> Self {
        Self {
            conn: conn.clone(),
            acquired: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionSource for FakeSource {
    type Connection = FakeConnection;

    async fn acquire(&self) -> Result<FakeConnection, sqlx::Error> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(self.conn.clone())
    }
}

/// Let tasks spawned by dropped scopes run to completion.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
