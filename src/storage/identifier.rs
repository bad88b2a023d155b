//! SQL identifier guard.
//!
//! Every table, column, schema and JSON field name that ends up interpolated
//! into SQL text passes through here first.

use crate::error::{StorageError, StorageResult};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate an identifier, returning it unchanged when it is safe to quote.
pub fn validate_identifier<'a>(name: &'a str, kind: &str) -> StorageResult<&'a str> {
    let invalid = |reason: &str| StorageError::InvalidIdentifier {
        kind: kind.to_string(),
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return Err(invalid("must not be empty")),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return Err(invalid("must start with a letter or underscore"))
        }
        Some(_) => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid(
            "must contain only letters, numbers, or underscores",
        ));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("must be at most 63 characters"));
    }

    Ok(name)
}

/// Validate a dot-separated JSON field path such as `http.status_code`.
pub fn validate_field_key(key: &str) -> StorageResult<&str> {
    if key.is_empty() {
        return Err(StorageError::InvalidIdentifier {
            kind: "field key".to_string(),
            name: key.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    for segment in key.split('.') {
        validate_identifier(segment, "field key segment")?;
    }
    Ok(key)
}

/// Validate and double-quote an identifier.
pub fn quote_identifier(name: &str, kind: &str) -> StorageResult<String> {
    Ok(format!("\"{}\"", validate_identifier(name, kind)?))
}
