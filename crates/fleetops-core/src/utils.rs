//! Utility functions

use crate::error::{FleetError, Result};

/// Expand tilde (~) to home directory in path strings
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Quote a string for safe use as a single POSIX shell word
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Check an entity name is usable as a unique key and a file name
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FleetError::Validation(format!("{} name must not be empty", kind)));
    }
    if name.starts_with('.') || name.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace()) {
        return Err(FleetError::Validation(format!(
            "{} name '{}' may not contain whitespace or path separators, or start with '.'",
            kind, name
        )));
    }
    Ok(())
}
