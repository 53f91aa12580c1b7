//! Clone names and identifier quoting.

use uuid::Uuid;

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Hex characters appended to the template name (a simple-format v4 UUID).
const SUFFIX_LEN: usize = 32;

/// Longest template name that still leaves room for `_` plus the suffix.
pub const MAX_TEMPLATE_NAME_LEN: usize = MAX_IDENTIFIER_LEN - SUFFIX_LEN - 1;

/// Fresh clone name: `<template>_<32 hex chars>`.
pub fn clone_name(template: &str) -> String {
    format!("{}_{}", template, Uuid::new_v4().simple())
}

/// Whether `name` has the shape [`clone_name`] produces for `template`.
pub fn is_clone_of(name: &str, template: &str) -> bool {
    let Some(rest) = name.strip_prefix(template) else {
        return false;
    };
    let Some(suffix) = rest.strip_prefix('_') else {
        return false;
    };
    suffix.len() == SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Check that `name` can serve as a template name.
pub fn validate_template_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("database name must not be empty".to_string());
    }
    if name.len() > MAX_TEMPLATE_NAME_LEN {
        return Err(format!(
            "database name '{name}' is {} bytes; at most {MAX_TEMPLATE_NAME_LEN} fit before the clone suffix",
            name.len()
        ));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("database name '{name}' must not start with a digit"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(format!(
            "database name '{name}' contains '{bad}'; only ASCII letters, digits and '_' are allowed"
        ));
    }
    Ok(())
}

/// Quote an identifier for splicing into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
