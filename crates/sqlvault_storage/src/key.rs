//! Mapping between logical database names and blob keys.

use crate::error::{StorageError, StorageResult};

/// Suffix appended to every logical database name to form its blob name.
pub const DB_SUFFIX: &str = ".sqlite";

/// Checks that a logical database name is usable as a blob name.
///
/// Names must be non-empty and must not contain path separators,
/// parent-directory components or control characters.
///
/// # Errors
///
/// Returns [`StorageError::InvalidName`] if the name is rejected.
pub fn validate_name(name: &str) -> StorageResult<()> {
    let rejected = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if rejected {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Normalizes an optional key prefix.
///
/// Leading and trailing slashes are stripped and a single trailing slash is
/// added back, so `"/tenants/a/"` and `"tenants/a"` both become `"tenants/a/"`.
/// An empty or missing prefix becomes the empty string.
///
/// # Errors
///
/// Returns [`StorageError::Config`] if a prefix segment is empty or `..`.
pub fn normalize_prefix(prefix: Option<&str>) -> StorageResult<String> {
    let Some(raw) = prefix else {
        return Ok(String::new());
    };
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(StorageError::Config(format!("invalid key prefix: {raw:?}")));
        }
    }
    Ok(format!("{trimmed}/"))
}

/// Builds the full object key for a logical database name.
#[must_use]
pub fn object_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}{DB_SUFFIX}")
}

/// Recovers the logical database name from an object key.
///
/// Returns `None` for keys outside the prefix, keys without the database
/// suffix and keys nested below the prefix.
#[must_use]
pub fn logical_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let name = key.strip_prefix(prefix)?.strip_suffix(DB_SUFFIX)?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(name)
}
