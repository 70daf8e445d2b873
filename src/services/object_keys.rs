//! Object key naming and path safety.
//!
//! Keys look like `uploads/{user}/{yyyy}/{mm}/{dd}/{path}/{rand8}_{name}`.
//! Every user-supplied segment is case-folded and stripped of characters that
//! misbehave in backend keys or URLs.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Extensions longer than this are not worth preserving on truncation.
const MAX_PRESERVED_EXTENSION: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object key is empty")]
    Empty,
    #[error("object key exceeds {MAX_OBJECT_KEY_LEN} bytes")]
    TooLong,
    #[error("path `{0}` escapes its parent directory")]
    PathTraversal(String),
    #[error("object key contains forbidden characters")]
    InvalidCharacters,
}

/// Normalize one path segment or file name for use in a key.
pub fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        let mapped = match ch {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => ch,
            '(' | ')' => '-',
            c if c.is_whitespace() => '-',
            _ => continue,
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches('-').trim_start_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Clean a client-supplied folder path for storage on the file record.
///
/// Empty and `.` segments are dropped, separators are unified to `/`, and any
/// `..` segment is rejected outright. Casing is preserved.
pub fn clean_relative_path(raw: &str) -> Result<String, KeyError> {
    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        let segment = segment.trim();
        match segment {
            "" | "." => continue,
            ".." => return Err(KeyError::PathTraversal(raw.to_string())),
            s if s.chars().any(char::is_control) => return Err(KeyError::InvalidCharacters),
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Build the backend key for a new upload. `relative_path` must already be
/// cleaned with [`clean_relative_path`].
pub fn build_object_key(
    owner_id: Uuid,
    relative_path: &str,
    filename: &str,
    now: DateTime<Utc>,
) -> String {
    let mut key = format!("uploads/{owner_id}/{}/", now.format("%Y/%m/%d"));
    for segment in relative_path.split('/').filter(|s| !s.is_empty()) {
        key.push_str(&sanitize_segment(segment));
        key.push('/');
    }
    let disambiguator = Uuid::new_v4().simple().to_string();
    key.push_str(&disambiguator[..8]);
    key.push('_');
    key.push_str(&sanitize_segment(filename));
    truncate_key(key, MAX_OBJECT_KEY_LEN)
}

/// Cap a key at `max` bytes, keeping a short extension when there is one.
pub fn truncate_key(key: String, max: usize) -> String {
    if key.len() <= max {
        return key;
    }

    let name_start = key.rfind('/').map(|i| i + 1).unwrap_or(0);
    let extension = key[name_start..]
        .rfind('.')
        .map(|i| &key[name_start + i..])
        .filter(|ext| ext.len() <= MAX_PRESERVED_EXTENSION && ext.len() < max)
        .unwrap_or("");

    let mut cut = max - extension.len();
    while cut > 0 && !key.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = key[..cut].trim_end_matches('/').to_string();
    truncated.push_str(extension);
    truncated
}

/// Reject keys that could escape the storage root.
pub fn ensure_key_safe(key: &str) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.len() > MAX_OBJECT_KEY_LEN {
        return Err(KeyError::TooLong);
    }
    if key.starts_with('/') || key.split('/').any(|s| s == "..") {
        return Err(KeyError::PathTraversal(key.to_string()));
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(KeyError::InvalidCharacters);
    }
    Ok(())
}
