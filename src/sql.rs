//! `SECURITY LABEL` statements for the `anon` provider.

use crate::masking::identifier::{is_valid_identifier, quote_identifier, quote_literal};
use crate::masking::switcher::ANON_LABEL_PROVIDER;

pub const ANON_FUNCTION_PREFIX: &str = "anon.";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("invalid table name: {0}")]
    InvalidTable(String),
    #[error("invalid column name: {0}")]
    InvalidColumn(String),
    #[error("invalid role name: {0}")]
    InvalidRole(String),
    #[error("masking function must start with `{ANON_FUNCTION_PREFIX}`: {0}")]
    NotAnAnonFunction(String),
    #[error("unbalanced parentheses in masking function: {0}")]
    UnbalancedParentheses(String),
    #[error("masking function contains a statement terminator or comment: {0}")]
    ForbiddenToken(String),
}

/// `SECURITY LABEL ... IS 'MASKED WITH FUNCTION <function>';`
pub fn security_label_sql(table: &str, column: &str, function: &str) -> Result<String, LabelError> {
    validate_table(table)?;
    validate_column(column)?;
    let function = validate_function(function)?;

    let label = format!("MASKED WITH FUNCTION {function}");
    Ok(format!(
        "SECURITY LABEL FOR {ANON_LABEL_PROVIDER} ON COLUMN {table}.{column} IS {};",
        quote_literal(&label)
    ))
}

/// Statement that clears a column's masking rule.
pub fn remove_label_sql(table: &str, column: &str) -> Result<String, LabelError> {
    validate_table(table)?;
    validate_column(column)?;

    Ok(format!("SECURITY LABEL FOR {ANON_LABEL_PROVIDER} ON COLUMN {table}.{column} IS NULL;"))
}

/// Statement that marks a role as masked.
pub fn role_label_sql(role: &str) -> Result<String, LabelError> {
    if !is_valid_identifier(role) {
        return Err(LabelError::InvalidRole(role.to_string()));
    }

    Ok(format!(
        "SECURITY LABEL FOR {ANON_LABEL_PROVIDER} ON ROLE {} IS 'MASKED';",
        quote_identifier(role)
    ))
}

fn validate_table(table: &str) -> Result<(), LabelError> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid = matches!(parts.len(), 1 | 2) && parts.iter().all(|part| is_valid_identifier(part));
    if valid {
        Ok(())
    } else {
        Err(LabelError::InvalidTable(table.to_string()))
    }
}

fn validate_column(column: &str) -> Result<(), LabelError> {
    if is_valid_identifier(column) {
        Ok(())
    } else {
        Err(LabelError::InvalidColumn(column.to_string()))
    }
}

fn validate_function(function: &str) -> Result<&str, LabelError> {
    let function = function.trim();

    if !function.starts_with(ANON_FUNCTION_PREFIX) {
        return Err(LabelError::NotAnAnonFunction(function.to_string()));
    }
    if function.contains(';') || function.contains("--") {
        return Err(LabelError::ForbiddenToken(function.to_string()));
    }

    let mut depth = 0i32;
    for c in function.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(LabelError::UnbalancedParentheses(function.to_string()));
    }

    Ok(function)
}
