use std::collections::HashSet;
use std::path::{Component, Path};

use thiserror::Error;
use unicode_normalization::{is_nfc, UnicodeNormalization};

// Archive entry names are validated twice: once for safety (can this name
// escape the extraction root?) and once for portability (can every target
// filesystem represent it?). Safety failures are always blocking.
pub const MAX_COMPONENT_BYTES: usize = 255;
const MAX_EXTENSION_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryPathError {
    #[error("entry name is empty")]
    Empty,
    #[error("entry name is absolute")]
    Absolute,
    #[error("entry name has a drive prefix")]
    DrivePrefix,
    #[error("entry name uses backslash separators")]
    Backslash,
    #[error("entry name contains a traversal segment")]
    Traversal,
    #[error("entry name contains an empty segment")]
    EmptySegment,
    #[error("entry name contains a NUL byte")]
    Nul,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComponentError {
    #[error("name is empty")]
    Empty,
    #[error("name exceeds {MAX_COMPONENT_BYTES} bytes")]
    TooLong,
    #[error("name ends with a space or dot")]
    TrailingDotOrSpace,
    #[error("name contains characters that are not portable")]
    InvalidCharacter,
    #[error("name uses a reserved device name")]
    Reserved,
    #[error("name is not NFC normalized")]
    NotNormalized,
}

/// Checks that an archive entry name stays inside the extraction root.
/// A single trailing `/` (directory entry) is accepted.
pub fn check_entry_path(name: &str) -> Result<(), EntryPathError> {
    if name.is_empty() {
        return Err(EntryPathError::Empty);
    }
    if name.contains('\0') {
        return Err(EntryPathError::Nul);
    }
    if name.contains('\\') {
        return Err(EntryPathError::Backslash);
    }
    if name.starts_with('/') {
        return Err(EntryPathError::Absolute);
    }
    if is_drive_prefixed(name) {
        return Err(EntryPathError::DrivePrefix);
    }

    let trimmed = name.strip_suffix('/').unwrap_or(name);
    for segment in trimmed.split('/') {
        match segment {
            "" => return Err(EntryPathError::EmptySegment),
            "." | ".." => return Err(EntryPathError::Traversal),
            _ => {}
        }
    }
    Ok(())
}

/// Portability rules for a single path segment.
pub fn validate_component(segment: &str) -> Result<(), ComponentError> {
    if segment.is_empty() {
        return Err(ComponentError::Empty);
    }
    if segment.len() > MAX_COMPONENT_BYTES {
        return Err(ComponentError::TooLong);
    }
    if segment.trim_end_matches([' ', '.']).len() != segment.len() {
        return Err(ComponentError::TrailingDotOrSpace);
    }
    if segment.chars().any(is_unportable_char) {
        return Err(ComponentError::InvalidCharacter);
    }
    if is_reserved_windows_name(segment) {
        return Err(ComponentError::Reserved);
    }
    if !is_nfc(segment) {
        return Err(ComponentError::NotNormalized);
    }
    Ok(())
}

/// Converts a dataset-relative path into the archive's convention:
/// `/` separators and NFC-normalized segments. Returns `None` for paths
/// that are not plain relative UTF-8 paths.
pub fn portable_archive_path(relative: &Path) -> Option<String> {
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(os) => segments.push(os.to_str()?.nfc().collect::<String>()),
            _ => return None,
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Rewrites a media filename so it is valid on every supported platform.
/// Returns `None` when nothing usable is left.
pub fn sanitize_component(name: &str) -> Option<String> {
    let mut out: String = name
        .nfc()
        .map(|c| if is_unportable_char(c) { '_' } else { c })
        .collect();

    let kept = out.trim_end_matches([' ', '.']).len();
    out.truncate(kept);
    if out.is_empty() {
        return None;
    }
    if is_reserved_windows_name(&out) {
        out.insert(0, '_');
    }
    if out.len() > MAX_COMPONENT_BYTES {
        out = truncate_preserving_extension(&out, MAX_COMPONENT_BYTES);
        let kept = out.trim_end_matches([' ', '.']).len();
        out.truncate(kept);
    }

    validate_component(&out).ok()?;
    Some(out)
}

/// Picks `name`, or `stem-N.ext` with the smallest N not yet taken.
/// Collisions are case-insensitive so the result is safe on macOS and Windows.
pub fn unique_name(name: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_lowercase()) {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    let mut counter = 1usize;
    loop {
        let suffix = match ext {
            Some(ext) => format!("-{counter}.{ext}"),
            None => format!("-{counter}"),
        };
        let budget = MAX_COMPONENT_BYTES.saturating_sub(suffix.len());
        let candidate = format!("{}{suffix}", truncate_at_boundary(stem, budget));
        if taken.insert(candidate.to_lowercase()) {
            return candidate;
        }
        counter += 1;
    }
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && name.len() - idx - 1 <= MAX_EXTENSION_BYTES => {
            (&name[..idx], Some(&name[idx + 1..]))
        }
        _ => (name, None),
    }
}

fn truncate_preserving_extension(name: &str, limit: usize) -> String {
    let (stem, ext) = split_extension(name);
    match ext {
        Some(ext) => {
            let budget = limit.saturating_sub(ext.len() + 1);
            format!("{}.{ext}", truncate_at_boundary(stem, budget))
        }
        None => truncate_at_boundary(name, limit).to_string(),
    }
}

fn truncate_at_boundary(value: &str, limit: usize) -> &str {
    if value.len() <= limit {
        return value;
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn is_unportable_char(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
}

fn is_drive_prefixed(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

fn is_reserved_windows_name(segment: &str) -> bool {
    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    // `CON.wav` is as unusable as `CON`.
    let stem = segment.split('.').next().unwrap_or(segment);
    RESERVED.iter().any(|name| stem.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn entry_paths_reject_escapes() {
        assert_eq!(check_entry_path("/etc/passwd"), Err(EntryPathError::Absolute));
        assert_eq!(check_entry_path("../x"), Err(EntryPathError::Traversal));
        assert_eq!(check_entry_path("recordings/./a.wav"), Err(EntryPathError::Traversal));
        assert_eq!(check_entry_path("C:evil"), Err(EntryPathError::DrivePrefix));
        assert_eq!(check_entry_path("recordings\\a.wav"), Err(EntryPathError::Backslash));
        assert_eq!(check_entry_path("recordings//a.wav"), Err(EntryPathError::EmptySegment));
        assert!(check_entry_path("recordings/").is_ok());
        assert!(check_entry_path("history/history.jsonl").is_ok());
    }

    #[test]
    fn reserved_names_match_stem() {
        assert_eq!(validate_component("con.wav"), Err(ComponentError::Reserved));
        assert_eq!(validate_component("LPT1"), Err(ComponentError::Reserved));
        assert!(validate_component("console.wav").is_ok());
    }

    #[test]
    fn portable_path_uses_forward_slashes_and_nfc() {
        let mut path = PathBuf::from("recordings");
        path.push("cafe\u{0301}.wav");
        assert_eq!(
            portable_archive_path(&path).as_deref(),
            Some("recordings/caf\u{e9}.wav")
        );
        assert!(portable_archive_path(Path::new("../x")).is_none());
    }

    #[test]
    fn sanitize_repairs_common_problems() {
        assert_eq!(sanitize_component("a:b?.wav").as_deref(), Some("a_b_.wav"));
        assert_eq!(sanitize_component("take one. ").as_deref(), Some("take one"));
        assert_eq!(sanitize_component("CON.wav").as_deref(), Some("_CON.wav"));
        assert!(sanitize_component(" . .").is_none());
        assert!(sanitize_component("...").is_none());
    }

    #[test]
    fn sanitize_truncates_long_names_but_keeps_extension() {
        let long = format!("{}.wav", "\u{e9}".repeat(200));
        let out = sanitize_component(&long).expect("sanitized");
        assert!(out.len() <= MAX_COMPONENT_BYTES);
        assert!(out.ends_with(".wav"));
    }

    #[test]
    fn unique_name_is_deterministic_and_case_insensitive() {
        let mut taken = HashSet::new();
        assert_eq!(unique_name("a.wav", &mut taken), "a.wav");
        assert_eq!(unique_name("A.wav", &mut taken), "A-1.wav");
        assert_eq!(unique_name("a.wav", &mut taken), "a-2.wav");
        assert_eq!(unique_name("noext", &mut taken), "noext");
        assert_eq!(unique_name("noext", &mut taken), "noext-1");
    }
}
