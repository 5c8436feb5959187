//! Path and filename helpers.
//!
//! Anything derived from user input that ends up on disk goes through
//! [`validate_component`] (strict, rejects) or [`sanitize_filename`]
//! (lenient, rewrites).

use crate::error::{Error, Result};

/// Maximum length of a single path component accepted by [`validate_component`].
const MAX_COMPONENT_LEN: usize = 128;

/// Maximum length of a sanitized download filename.
const MAX_FILENAME_LEN: usize = 200;

/// Characters replaced by [`sanitize_filename`].
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Check that `name` is safe to use as a single path component.
///
/// Only ASCII alphanumerics, `-`, `_` and `.` are allowed, `.` and `..` are
/// rejected, and the length is bounded.
///
/// # Examples
///
/// ```
/// use mf_core::paths::validate_component;
///
/// assert!(validate_component("job-1234").is_ok());
/// assert!(validate_component("../etc").is_err());
/// ```
pub fn validate_component(name: &str) -> Result<&str> {
    if name.is_empty() || name.len() > MAX_COMPONENT_LEN {
        return Err(Error::Validation(format!(
            "path component must be 1..={MAX_COMPONENT_LEN} characters"
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::Validation(format!("invalid path component: {name}")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::Validation(format!(
            "path component contains forbidden characters: {name:?}"
        )));
    }
    Ok(name)
}

/// Rewrite a user-supplied filename into something safe to offer as a
/// download name.
///
/// Reserved characters become `_`, control characters are dropped, leading
/// and trailing spaces and dots are trimmed and the result is capped at 200
/// characters. Returns `None` if nothing usable remains.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let replaced: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| {
            if INVALID_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    let capped: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    let capped = capped.trim_end_matches(|c| c == ' ' || c == '.');

    if capped.is_empty() {
        None
    } else {
        Some(capped.to_string())
    }
}

/// Force `name` to carry the given extension, replacing any existing one.
pub fn with_extension(name: &str, ext: &str) -> String {
    let lower = name.to_lowercase();
    if lower.ends_with(&format!(".{ext}")) {
        return name.to_string();
    }
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    };
    format!("{stem}.{ext}")
}

/// Format a duration in whole seconds as `HH:MM:SS` (or `MM:SS` under an
/// hour). Zero renders as `Unknown`.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "Unknown".to_string();
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_plain_names() {
        assert!(validate_component("job-3f2a").is_ok());
        assert!(validate_component("input.mp4").is_ok());
        assert!(validate_component("a_b.c-d").is_ok());
    }

    #[test]
    fn validate_rejects_traversal() {
        for bad in ["", ".", "..", "../x", "a/b", "a\\b", "x\0y", "héllo", "a b"] {
            assert!(validate_component(bad).is_err(), "accepted {bad:?}");
        }
        assert!(validate_component(&"a".repeat(MAX_COMPONENT_LEN + 1)).is_err());
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(
            sanitize_filename("My: Video / Part?1").as_deref(),
            Some("My_ Video _ Part_1")
        );
    }

    #[test]
    fn sanitize_trims_dots_and_spaces() {
        assert_eq!(sanitize_filename("  ..clip.. ").as_deref(), Some("clip"));
        assert_eq!(sanitize_filename(" . . "), None);
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_filename(&long).unwrap().len(), MAX_FILENAME_LEN);
    }

    #[test]
    fn extension_is_forced() {
        assert_eq!(with_extension("clip", "mkv"), "clip.mkv");
        assert_eq!(with_extension("clip.mp4", "mkv"), "clip.mkv");
        assert_eq!(with_extension("clip.MKV", "mkv"), "clip.MKV");
        assert_eq!(with_extension(".hidden", "mkv"), ".hidden.mkv");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(0), "Unknown");
        assert_eq!(format_duration(59), "00:59");
        assert_eq!(format_duration(61), "01:01");
        assert_eq!(format_duration(3725), "01:02:05");
    }
}
