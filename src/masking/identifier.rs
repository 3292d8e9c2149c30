//! Allow-list validation for names interpolated into raw SQL.

/// PostgreSQL truncates identifiers at NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// `^[A-Za-z_][A-Za-z0-9_]{0,62}$`
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = match chars.next() {
        Some(c) => c.is_ascii_alphabetic() || c == '_',
        None => return false,
    };

    first_ok
        && name.len() <= MAX_IDENTIFIER_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote an identifier that already passed [`is_valid_identifier`].
///
/// Quoting keeps the name's case exactly as validated, so `SET ROLE` and the
/// later `current_user` comparison see the same string.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Undo [`quote_identifier`] on a name PostgreSQL rendered with
/// `quote_ident`, as `pg_seclabels.objname` does for mixed-case names.
/// Unquoted names come back unchanged.
pub fn unquote_identifier(name: &str) -> String {
    match name.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => name.to_string(),
    }
}

/// Validate then quote, or `None` when the name is rejected.
pub fn safe_identifier(name: &str) -> Option<String> {
    is_valid_identifier(name).then(|| quote_identifier(name))
}

/// Render a string as a single-quoted SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Parse a comma-separated schema list (`"mask, public"`) into quoted
/// identifiers. Any invalid element rejects the whole list.
pub fn quoted_schema_list(search_path: &str) -> Option<String> {
    let schemas: Vec<&str> = search_path
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if schemas.is_empty() {
        return None;
    }

    schemas
        .into_iter()
        .map(safe_identifier)
        .collect::<Option<Vec<_>>>()
        .map(|quoted| quoted.join(", "))
}
