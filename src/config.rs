use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::AppError;
use crate::masking::identifier::{is_valid_identifier, quoted_schema_list};

pub const DEFAULT_MASKED_ROLE: &str = "masked_reader";
pub const DEFAULT_MASK_SEARCH_PATH: &str = "mask, public";

/// Immutable masking configuration, evaluated once per unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct MaskingPolicy {
    pub enabled: bool,
    pub masked_groups: BTreeSet<String>,
    #[schema(example = "masked_reader")]
    pub default_masked_role: String,
    /// Refuse the unit of work instead of running it unmasked when the
    /// masked role cannot be assumed.
    pub fail_closed_on_switch_error: bool,
    /// Schemas installed as `search_path` while masked; `None` leaves the
    /// search path untouched.
    #[schema(example = "mask, public")]
    pub mask_search_path: Option<String>,
}

impl Default for MaskingPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            masked_groups: BTreeSet::new(),
            default_masked_role: DEFAULT_MASKED_ROLE.to_string(),
            fail_closed_on_switch_error: false,
            mask_search_path: Some(DEFAULT_MASK_SEARCH_PATH.to_string()),
        }
    }
}

impl MaskingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_masked_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.masked_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_masked_role(mut self, role: impl Into<String>) -> Self {
        self.default_masked_role = role.into();
        self
    }

    pub fn fail_closed_on_switch_error(mut self, fail_closed: bool) -> Self {
        self.fail_closed_on_switch_error = fail_closed;
        self
    }

    pub fn with_mask_search_path(mut self, search_path: Option<String>) -> Self {
        self.mask_search_path = search_path;
        self
    }

    /// Read `ANON_*` variables; anything unset keeps its default.
    pub fn from_env() -> Result<Self, AppError> {
        let mut policy = Self::default();

        if let Ok(value) = std::env::var("ANON_ENABLED") {
            policy.enabled = parse_bool("ANON_ENABLED", &value)?;
        }

        if let Ok(value) = std::env::var("ANON_MASKED_GROUPS") {
            policy.masked_groups = value
                .split(',')
                .map(str::trim)
                .filter(|group| !group.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(value) = std::env::var("ANON_DEFAULT_MASKED_ROLE") {
            policy.default_masked_role = value.trim().to_string();
        }

        if let Ok(value) = std::env::var("ANON_FAIL_CLOSED_ON_SWITCH_ERROR") {
            policy.fail_closed_on_switch_error = parse_bool("ANON_FAIL_CLOSED_ON_SWITCH_ERROR", &value)?;
        }

        if let Ok(value) = std::env::var("ANON_MASK_SEARCH_PATH") {
            let value = value.trim();
            policy.mask_search_path = (!value.is_empty()).then(|| value.to_string());
        }

        policy.validate()?;
        Ok(policy)
    }

    /// Reject names the session core would refuse at request time anyway.
    pub fn validate(&self) -> Result<(), AppError> {
        if !is_valid_identifier(&self.default_masked_role) {
            return Err(AppError::configuration(format!(
                "ANON_DEFAULT_MASKED_ROLE {:?} is not a valid role name",
                self.default_masked_role
            )));
        }

        if let Some(search_path) = &self.mask_search_path {
            if quoted_schema_list(search_path).is_none() {
                return Err(AppError::configuration(format!(
                    "ANON_MASK_SEARCH_PATH {search_path:?} must be a comma-separated list of schema names"
                )));
            }
        }

        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AppError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(AppError::configuration(format!("{key} must be a boolean"))),
    }
}
