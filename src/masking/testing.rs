use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::db::SessionConnection;

pub(crate) const DEFAULT_SEARCH_PATH: &str = "\"$user\", public";

#[derive(Debug)]
pub(crate) struct MockState {
    pub log: Vec<String>,
    pub roles: HashSet<String>,
    pub session_user: String,
    pub current_role: Option<String>,
    pub search_path: String,
    pub fail_prefixes: Vec<String>,
    pub in_transaction: bool,
    pub lie_about_current_user: bool,
    pub stall_prefixes: Vec<String>,
    pub anon_version: Option<String>,
    pub anon_label_count: u64,
}

/// In-memory stand-in for a Postgres session that records every statement
/// and simulates role and search-path state.
#[derive(Debug, Clone)]
pub(crate) struct RecordingConnection {
    state: Arc<Mutex<MockState>>,
}

impl RecordingConnection {
    pub fn new() -> Self {
        let mut roles = HashSet::new();
        roles.insert("pg_read_all_data".to_string());
        Self {
            state: Arc::new(Mutex::new(MockState {
                log: Vec::new(),
                roles,
                session_user: "app".to_string(),
                current_role: None,
                search_path: DEFAULT_SEARCH_PATH.to_string(),
                fail_prefixes: Vec::new(),
                in_transaction: false,
                lie_about_current_user: false,
                stall_prefixes: Vec::new(),
                anon_version: None,
                anon_label_count: 0,
            })),
        }
    }

    pub fn with_role(self, role: &str) -> Self {
        self.state.lock().unwrap().roles.insert(role.to_string());
        self
    }

    pub fn without_read_all_data(self) -> Self {
        self.state.lock().unwrap().roles.remove("pg_read_all_data");
        self
    }

    pub fn failing_on(self, prefix: &str) -> Self {
        self.state.lock().unwrap().fail_prefixes.push(prefix.to_string());
        self
    }

    /// Queries starting with `prefix` never complete.
    pub fn stalling_on(self, prefix: &str) -> Self {
        self.state.lock().unwrap().stall_prefixes.push(prefix.to_string());
        self
    }

    pub fn with_anon_extension(self, version: &str, label_count: u64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.anon_version = Some(version.to_string());
            state.anon_label_count = label_count;
        }
        self
    }

    pub fn set_search_path(&self, path: &str) {
        self.state.lock().unwrap().search_path = path.to_string();
    }

    pub fn in_transaction(self) -> Self {
        self.state.lock().unwrap().in_transaction = true;
        self
    }

    pub fn reporting_wrong_current_user(self) -> Self {
        self.state.lock().unwrap().lie_about_current_user = true;
        self
    }

    pub fn assume(&self, role: &str) {
        let mut state = self.state.lock().unwrap();
        state.roles.insert(role.to_string());
        state.current_role = Some(role.to_string());
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|sql| sql.starts_with(prefix)).count()
    }

    pub fn current_role(&self) -> Option<String> {
        self.state.lock().unwrap().current_role.clone()
    }

    pub fn search_path(&self) -> String {
        self.state.lock().unwrap().search_path.clone()
    }
}

fn between<'a>(sql: &'a str, open: &str, close: char) -> Option<&'a str> {
    let start = sql.find(open)? + open.len();
    let rest = &sql[start..];
    let end = rest.find(close)?;
    Some(&rest[..end])
}

#[async_trait]
impl SessionConnection for RecordingConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        state.log.push(sql.to_string());

        if state.fail_prefixes.iter().any(|p| sql.starts_with(p.as_str())) {
            return Err(sqlx::Error::Protocol(format!("simulated failure: {sql}")));
        }

        if let Some(role) = sql.strip_prefix("SET ROLE ") {
            let role = role.trim_matches('"').to_string();
            if !state.roles.contains(&role) {
                return Err(sqlx::Error::Protocol(format!("role \"{role}\" does not exist")));
            }
            state.current_role = Some(role);
        } else if sql == "RESET ROLE" {
            state.current_role = None;
        } else if sql.starts_with("CREATE ROLE ") {
            if let Some(role) = between(sql, "CREATE ROLE \"", '"') {
                let role = role.to_string();
                state.roles.insert(role);
            }
        } else if let Some(path) = sql.strip_prefix("SET search_path TO ") {
            state.search_path = path.replace('"', "");
        } else if sql == "RESET search_path" {
            state.search_path = DEFAULT_SEARCH_PATH.to_string();
        } else if sql.starts_with("SELECT set_config('search_path', ") {
            if let Some(value) = between(sql, "'search_path', '", '\'') {
                state.search_path = value.to_string();
            }
        }

        Ok(())
    }

    async fn query_one(&mut self, sql: &str) -> Result<Option<String>, sqlx::Error> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            state.log.push(sql.to_string());
            state.stall_prefixes.iter().any(|p| sql.starts_with(p.as_str()))
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock().unwrap();

        if state.fail_prefixes.iter().any(|p| sql.starts_with(p.as_str())) {
            return Err(sqlx::Error::Protocol(format!("simulated failure: {sql}")));
        }

        if sql.contains("FROM pg_roles WHERE rolname = '") {
            let role = between(sql, "rolname = '", '\'').unwrap_or_default();
            return Ok(state.roles.contains(role).then(|| role.to_string()));
        }

        if sql.starts_with("SELECT CASE WHEN current_user = session_user") {
            return Ok(state.current_role.clone());
        }

        if sql == "SELECT current_user::text" {
            if state.lie_about_current_user {
                return Ok(Some("somebody_else".to_string()));
            }
            return Ok(Some(
                state.current_role.clone().unwrap_or_else(|| state.session_user.clone()),
            ));
        }

        if sql == "SELECT current_setting('search_path')" {
            return Ok(Some(state.search_path.clone()));
        }

        if sql.starts_with("SELECT CASE WHEN current_setting('search_path')") {
            return Ok((state.search_path != DEFAULT_SEARCH_PATH).then(|| state.search_path.clone()));
        }

        if sql.contains("FROM pg_extension WHERE extname = 'anon'") {
            return Ok(state.anon_version.clone());
        }

        if sql.starts_with("SELECT anon.version()") {
            return match &state.anon_version {
                Some(version) => Ok(Some(version.clone())),
                None => Err(sqlx::Error::Protocol("schema \"anon\" does not exist".to_string())),
            };
        }

        if sql.contains("FROM pg_seclabels WHERE provider = 'anon'") {
            return Ok(Some(state.anon_label_count.to_string()));
        }

        Ok(None)
    }

    fn in_transaction(&self) -> bool {
        self.state.lock().unwrap().in_transaction
    }
}
