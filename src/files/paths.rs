//! Filename sanitisation and archive entry path validation

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::{Result, SandboxError};

/// Extensions counted as nested archives inside an upload
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2", "xz"];

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("filename pattern is valid"));

/// Reduce an uploaded filename to a flat, portable name.
///
/// Non-ASCII characters are dropped, separators and whitespace become `_`,
/// anything outside `[A-Za-z0-9_.-]` is removed and leading/trailing `.`/`_`
/// are trimmed. The result may be empty.
pub fn secure_filename(name: &str) -> String {
    let ascii: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    UNSAFE_CHARS
        .replace_all(&joined, "")
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

/// Lowercased text after the last `.`, if any
pub fn extension(name: &str) -> Option<String> {
    name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
}

pub fn has_allowed_extension(name: &str, allowed: &[String]) -> bool {
    extension(name).map_or(false, |ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
}

pub fn is_archive_name(name: &str) -> bool {
    extension(name).map_or(false, |ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
}

/// Normalise an archive entry name into a relative path.
///
/// Backslashes count as separators. Absolute names (including drive
/// prefixes) and any `..` segment are rejected; `.` and empty segments are
/// dropped. Hidden segments are allowed but logged.
pub fn validate_entry_path(name: &str) -> Result<PathBuf> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(SandboxError::ZipPathTraversal(name.to_string()));
    }

    let mut relative = PathBuf::new();
    for (index, segment) in normalized.split('/').enumerate() {
        match segment {
            "" | "." => continue,
            ".." => return Err(SandboxError::ZipPathTraversal(name.to_string())),
            s if index == 0 && s.ends_with(':') => {
                return Err(SandboxError::ZipPathTraversal(name.to_string()))
            }
            s => {
                if s.starts_with('.') {
                    warn!(entry = %name, "Archive contains hidden file or directory");
                }
                relative.push(s);
            }
        }
    }

    Ok(relative)
}

/// Join a validated relative path onto `dest`, requiring the result to stay
/// strictly inside it
pub fn resolve_within(dest: &Path, relative: &Path) -> Result<PathBuf> {
    let target = dest.join(relative);
    if target == dest || !target.starts_with(dest) {
        return Err(SandboxError::ZipPathTraversal(relative.display().to_string()));
    }
    Ok(target)
}
