use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A database principal used for masked access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Role {
    #[schema(example = "masked_reader")]
    pub name: String,
    /// The masking label has been verified on this role.
    pub is_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherit_from: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

impl Role {
    pub fn new(name: impl Into<String>, inherit_from: Option<String>) -> Self {
        Self {
            name: name.into(),
            is_applied: false,
            inherit_from,
            created_at: Utc::now(),
            applied_at: None,
        }
    }

    pub fn mark_applied(&mut self) {
        if !self.is_applied {
            self.is_applied = true;
            self.applied_at = Some(Utc::now());
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
