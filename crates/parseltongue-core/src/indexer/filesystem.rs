//! Filesystem scanning helpers for indexing passes.

use std::path::Path;

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::config::IndexerConfig;
use crate::errors::{PtResult, StoreError};
use crate::indexer::languages::detect_language;
use crate::models::{sha256_hex, FileEvent};

const DEFAULT_SENSITIVE_EXCLUDE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "*.p12",
    "*secret*",
    "*secrets*",
    "*credential*",
    "id_rsa",
    "id_dsa",
];

const IMPLICIT_IGNORED_DIRS: &[&str] = &[".git", ".parseltongue"];

/// Project-specific ignore file, read alongside `.gitignore`.
pub const IGNORE_FILE_NAME: &str = ".parseltongueignore";

/// Repository-relative path with forward slashes and no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let mut trimmed = normalized.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.trim_start_matches('/').to_string()
}

pub fn relative_path(repo_root: &Path, path: &Path) -> String {
    normalize_path(
        &path
            .strip_prefix(repo_root)
            .unwrap_or(path)
            .to_string_lossy(),
    )
}

pub fn compute_content_hash(bytes: &[u8]) -> String {
    sha256_hex(bytes)
}

/// Indexable files under `repo_root`, as sorted repository-relative paths.
///
/// Honours `.gitignore` and [`IGNORE_FILE_NAME`], the configured
/// include/exclude globs, the sensitive-file excludes and the size limit.
/// Files in languages without a registered grammar are left out.
pub fn iter_repo_files(repo_root: &Path, config: &IndexerConfig) -> PtResult<Vec<String>> {
    let mut overrides = OverrideBuilder::new(repo_root);
    let mut add = |glob: String| -> PtResult<()> {
        overrides
            .add(&glob)
            .map_err(|e| StoreError::Config(format!("bad path pattern `{glob}`: {e}")))?;
        Ok(())
    };
    for pattern in &config.include_patterns {
        let p = pattern.trim();
        if !p.is_empty() {
            add(p.to_string())?;
        }
    }
    for pattern in &config.exclude_patterns {
        let p = pattern.trim().trim_end_matches('/');
        if !p.is_empty() {
            add(format!("!{p}"))?;
        }
    }
    if config.exclude_sensitive {
        for pattern in DEFAULT_SENSITIVE_EXCLUDE_PATTERNS {
            add(format!("!{pattern}"))?;
        }
    }
    let overrides = overrides
        .build()
        .map_err(|e| StoreError::Config(e.to_string()))?;

    let mut builder = WalkBuilder::new(repo_root);
    builder
        .hidden(false)
        .follow_links(false)
        .require_git(false)
        .git_global(false)
        .add_custom_ignore_filename(IGNORE_FILE_NAME)
        .overrides(overrides)
        .filter_entry(|entry| {
            !entry.file_type().is_some_and(|t| t.is_dir())
                || !IMPLICIT_IGNORED_DIRS
                    .iter()
                    .any(|d| entry.file_name() == std::ffi::OsStr::new(d))
        });

    let mut result = Vec::new();
    for item in builder.build() {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable path during scan: {e}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let rel = relative_path(repo_root, entry.path());
        if detect_language(&rel).is_none() {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > config.max_file_bytes {
            debug!("skipping {rel}: {size} bytes exceeds limit");
            continue;
        }
        result.push(rel);
    }
    result.sort();
    Ok(result)
}

/// A `Created` event for every indexable file in the repository.
pub fn scan_repository(repo_root: &Path, config: &IndexerConfig) -> PtResult<Vec<FileEvent>> {
    Ok(iter_repo_files(repo_root, config)?
        .into_iter()
        .map(FileEvent::created)
        .collect())
}
