//! Incremental indexing pipeline with Rayon-based parallelism.
//!
//! A batch of [`FileEvent`]s is coalesced per path, the changed files are
//! read, hashed, parsed and extracted in parallel, references are resolved
//! against the store's index patched with the batch, and the result is handed
//! to the store as one [`FileUpdate`] list. Files whose content hash matches
//! the stored one cause no writes at all.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::IndexerConfig;
use crate::errors::{IndexingFileError, QueryError};
use crate::indexer::dependencies::{extract_file, RawEdge};
use crate::indexer::filesystem::{compute_content_hash, normalize_path, scan_repository};
use crate::indexer::keys::materialize;
use crate::indexer::languages::detect_language;
use crate::indexer::parser::TolerantParser;
use crate::indexer::resolution::{
    resolve_with_stats, ResolutionStats, SymbolResolver, TimedResolver,
};
use crate::models::{Entity, EntityKey, FileEvent, FileEventKind};
use crate::store::{CancelToken, FileUpdate, IndexStore};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_run_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{millis:x}-{seq:04x}")
}

/// What one batch did. Every path list is sorted.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub run_id: String,
    /// Files whose new contents were written.
    pub succeeded: Vec<String>,
    /// Files removed from the store.
    pub removed: Vec<String>,
    /// Files whose content hash matched the stored one.
    pub unchanged: Vec<String>,
    /// Events for paths with no registered language, or deletions of paths
    /// the store never held.
    pub ignored: Vec<String>,
    pub failed: Vec<(String, IndexingFileError)>,
    /// Files left untouched because the batch was cancelled.
    pub skipped: Vec<String>,
    pub cancelled: bool,
    pub resolution: ResolutionStats,
    pub relinked: usize,
    pub elapsed_ms: u64,
}

impl BatchReport {
    /// True when the batch produced no store writes.
    pub fn is_noop(&self) -> bool {
        self.succeeded.is_empty() && self.removed.is_empty()
    }

    fn sort(&mut self) {
        self.succeeded.sort();
        self.removed.sort();
        self.unchanged.sort();
        self.ignored.sort();
        self.skipped.sort();
        self.failed.sort_by(|a, b| a.0.cmp(&b.0));
    }
}

// ---------------------------------------------------------------------------
// Per-file extraction
// ---------------------------------------------------------------------------

struct ExtractedFile {
    path: String,
    language: String,
    content_hash: String,
    entities: Vec<Entity>,
    raw_edges: Vec<RawEdge>,
}

enum FileOutcome {
    Extracted(ExtractedFile),
    Unchanged(String),
    Missing(String),
    Ignored(String),
    Skipped(String),
    Failed(IndexingFileError),
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn extract_file_worker(
    repo_root: &Path,
    path: &str,
    stored_hash: Option<&str>,
    config: &IndexerConfig,
    cancel: &CancelToken,
) -> FileOutcome {
    if cancel.is_cancelled() {
        return FileOutcome::Skipped(path.to_string());
    }
    let Some(spec) = detect_language(path) else {
        return FileOutcome::Ignored(path.to_string());
    };

    let bytes = match std::fs::read(repo_root.join(path)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return FileOutcome::Missing(path.to_string())
        }
        Err(e) => {
            return FileOutcome::Failed(IndexingFileError::Read {
                path: path.to_string(),
                message: e.to_string(),
            })
        }
    };
    if bytes.len() as u64 > config.max_file_bytes {
        return FileOutcome::Failed(IndexingFileError::Read {
            path: path.to_string(),
            message: format!(
                "file is {} bytes, limit is {}",
                bytes.len(),
                config.max_file_bytes
            ),
        });
    }

    let content_hash = compute_content_hash(&bytes);
    if stored_hash == Some(content_hash.as_str()) {
        return FileOutcome::Unchanged(path.to_string());
    }

    let max_depth = config.max_parse_depth;
    let extracted = catch_unwind(AssertUnwindSafe(|| {
        let parsed = TolerantParser::new(spec)
            .with_max_depth(max_depth)
            .parse_with_path(&bytes, Some(path));
        for diagnostic in &parsed.diagnostics {
            debug!(
                "{path}:{}: {}",
                diagnostic.line.unwrap_or(0),
                diagnostic.message
            );
        }
        let entities = materialize(&parsed, path);
        let keys: Vec<EntityKey> = entities.iter().map(|e| e.key.clone()).collect();
        let raw_edges = extract_file(&parsed, &keys);
        (entities, raw_edges)
    }));

    match extracted {
        Ok((entities, raw_edges)) => FileOutcome::Extracted(ExtractedFile {
            path: path.to_string(),
            language: spec.name.to_string(),
            content_hash,
            entities,
            raw_edges,
        }),
        Err(payload) => FileOutcome::Failed(IndexingFileError::Panicked {
            path: path.to_string(),
            message: panic_message(payload),
        }),
    }
}

fn build_pool(workers: usize) -> Option<rayon::ThreadPool> {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
    {
        Ok(pool) => Some(pool),
        Err(e) => {
            warn!("failed to build indexing thread pool, running sequentially: {e}");
            None
        }
    }
}

/// Map `jobs` on the pool, or sequentially without one. Output order
/// follows `jobs`.
fn run_parallel<T, R, F>(pool: Option<&rayon::ThreadPool>, jobs: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    match pool {
        Some(pool) => pool.install(|| jobs.par_iter().map(&f).collect()),
        None => jobs.iter().map(&f).collect(),
    }
}

/// Last event per normalized path wins.
fn coalesce(events: &[FileEvent]) -> BTreeMap<String, FileEventKind> {
    let mut latest = BTreeMap::new();
    for event in events {
        let path = normalize_path(&event.path);
        if path.is_empty() {
            continue;
        }
        latest.insert(path, event.kind);
    }
    latest
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

pub struct IncrementalIndexer<'a, S: IndexStore + ?Sized> {
    repo_root: PathBuf,
    store: &'a S,
    config: IndexerConfig,
    resolver: Option<TimedResolver>,
}

impl<'a, S: IndexStore + ?Sized> IncrementalIndexer<'a, S> {
    pub fn new(repo_root: impl AsRef<Path>, store: &'a S, config: IndexerConfig) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            store,
            config,
            resolver: None,
        }
    }

    /// Consult `resolver` for references the index cannot settle, bounded by
    /// `resolver_timeout_ms` per call.
    pub fn with_resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        let timeout = Duration::from_millis(self.config.resolver_timeout_ms);
        self.resolver = Some(TimedResolver::new(resolver, timeout));
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Bring the store in line with the current repository contents:
    /// every indexable file is checked and stored files that are gone or
    /// now excluded are removed.
    pub fn index_repository(&self, cancel: &CancelToken) -> Result<BatchReport, QueryError> {
        let mut events = scan_repository(&self.repo_root, &self.config)?;
        let present: BTreeSet<String> = events.iter().map(|e| e.path.clone()).collect();
        let stale: Vec<FileEvent> = self
            .store
            .file_hashes()?
            .into_keys()
            .filter(|path| !present.contains(path))
            .map(FileEvent::deleted)
            .collect();
        debug!(
            "repository scan found {} files, {} stale",
            present.len(),
            stale.len()
        );
        events.extend(stale);
        self.process_events(&events, cancel)
    }

    /// Apply one batch of change notifications.
    ///
    /// Per-file failures land in [`BatchReport::failed`] and never abort the
    /// batch. Store-level failures (corruption, a failed commit) are
    /// returned as errors.
    pub fn process_events(
        &self,
        events: &[FileEvent],
        cancel: &CancelToken,
    ) -> Result<BatchReport, QueryError> {
        let started = Instant::now();
        let mut report = BatchReport {
            run_id: new_run_id(),
            ..BatchReport::default()
        };
        let latest = coalesce(events);
        if latest.is_empty() {
            return Ok(report);
        }
        info!(
            "index batch {} started: {} paths",
            report.run_id,
            latest.len()
        );

        let stored = self.store.file_hashes()?;
        let mut removals: Vec<String> = Vec::new();
        let mut jobs: Vec<String> = Vec::new();
        for (path, kind) in latest {
            match kind {
                FileEventKind::Deleted if stored.contains_key(&path) => removals.push(path),
                FileEventKind::Deleted => report.ignored.push(path),
                FileEventKind::Created | FileEventKind::Modified => jobs.push(path),
            }
        }

        let pool = build_pool(self.config.workers);
        let repo_root = self.repo_root.as_path();
        let config = &self.config;
        let outcomes = run_parallel(pool.as_ref(), &jobs, |path| {
            extract_file_worker(
                repo_root,
                path,
                stored.get(path).map(String::as_str),
                config,
                cancel,
            )
        });

        let mut extracted: Vec<ExtractedFile> = Vec::new();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Extracted(file) => extracted.push(file),
                FileOutcome::Unchanged(path) => report.unchanged.push(path),
                FileOutcome::Missing(path) if stored.contains_key(&path) => removals.push(path),
                FileOutcome::Missing(path) | FileOutcome::Ignored(path) => {
                    report.ignored.push(path)
                }
                FileOutcome::Skipped(path) => report.skipped.push(path),
                FileOutcome::Failed(err) => {
                    warn!("indexing failed for {}: {err}", err.path());
                    report.failed.push((err.path().to_string(), err));
                }
            }
        }

        if !extracted.is_empty() || !removals.is_empty() {
            self.resolve_and_apply(&mut report, pool.as_ref(), extracted, removals, cancel)?;
        }

        for (path, err) in &report.failed {
            if let Err(e) =
                self.store
                    .record_diagnostic(&report.run_id, err.stage(), Some(path), &err.to_string())
            {
                warn!("failed to record indexing diagnostic for {path}: {e}");
            }
        }

        report.cancelled = cancel.is_cancelled();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report.sort();
        info!(
            "index batch {} finished: {} indexed, {} removed, {} unchanged, {} failed, {} skipped in {} ms",
            report.run_id,
            report.succeeded.len(),
            report.removed.len(),
            report.unchanged.len(),
            report.failed.len(),
            report.skipped.len(),
            report.elapsed_ms
        );
        Ok(report)
    }

    fn resolve_and_apply(
        &self,
        report: &mut BatchReport,
        pool: Option<&rayon::ThreadPool>,
        extracted: Vec<ExtractedFile>,
        removals: Vec<String>,
        cancel: &CancelToken,
    ) -> Result<(), QueryError> {
        // The store's index, as it will look once this batch is applied.
        let mut index = self.store.graph_index()?;
        for path in removals
            .iter()
            .chain(extracted.iter().map(|f| &f.path))
        {
            index.remove_file(path);
        }
        for file in &extracted {
            for entity in &file.entities {
                index.insert(entity.key.clone(), entity.span);
            }
        }

        let resolver = self.resolver.as_ref();
        let index = &index;
        let resolved = run_parallel(pool, &extracted, |file| {
            resolve_with_stats(&file.raw_edges, index, resolver)
        });

        let removal_set: BTreeSet<String> = removals.iter().cloned().collect();
        let mut updates: Vec<FileUpdate> = removals
            .into_iter()
            .map(|path| FileUpdate::Remove { path })
            .collect();
        for (file, (edges, stats)) in extracted.into_iter().zip(resolved) {
            report.resolution.merge(stats);
            updates.push(FileUpdate::Replace {
                path: file.path,
                language: file.language,
                content_hash: file.content_hash,
                entities: file.entities,
                edges,
            });
        }
        updates.sort_by(|a, b| a.path().cmp(b.path()));

        let outcome = self.store.apply_updates(updates, cancel)?;
        for path in outcome.applied {
            if removal_set.contains(&path) {
                report.removed.push(path);
            } else {
                report.succeeded.push(path);
            }
        }
        report.failed.extend(outcome.failed);
        report.skipped.extend(outcome.skipped);
        report.relinked = outcome.relinked;
        Ok(())
    }
}
