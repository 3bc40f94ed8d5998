//! Deterministic local file names for assets and their links.
//!
//! Every name produced here depends only on its input, so a retried fetch
//! always lands on the same path and overwrites what an earlier attempt left.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

/// Suffix of the temporary file a body is streamed into.
pub const PART_SUFFIX: &str = ".part";

/// File name for a link: the decoded last URL path segment, sanitized.
///
/// Falls back to the hex digest of the URL plus `.bin` when the URL has no
/// usable final segment.
#[must_use]
pub fn filename_for_url(url: &str) -> String {
    let segment = Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
    });

    if let Some(last) = segment.filter(|s| !s.is_empty()) {
        let decoded = urlencoding::decode(&last).map_or_else(
            |e| {
                debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
                last.clone()
            },
            std::borrow::Cow::into_owned,
        );
        let sanitized = sanitize_filename(&decoded);
        if !sanitized.trim_matches('_').is_empty() {
            return sanitized;
        }
    }

    format!("{}.bin", digest_hex(url))
}

/// Directory name holding one asset's files.
#[must_use]
pub fn asset_dir_name(asset_id: &str) -> String {
    let sanitized = sanitize_filename(asset_id);
    if sanitized.trim_matches('_').is_empty() {
        digest_hex(asset_id)
    } else {
        sanitized
    }
}

/// Path of the temporary file used while streaming into `path`.
#[must_use]
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Sanitizes a name for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters). Names that would still
/// resolve to `.` or `..` get their dots replaced.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

fn digest_hex(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}
