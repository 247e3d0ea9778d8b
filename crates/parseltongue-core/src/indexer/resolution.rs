//! Resolution pass: binds raw edges to global entity keys.
//!
//! Locally bound edges pass straight through. Everything else is matched by
//! qualified name against the [`GraphIndex`]; a single match resolves, while
//! zero or several matches are handed to the optional external
//! [`SymbolResolver`] under a per-call deadline. Whatever is still open
//! becomes an `Unresolved` edge pointing at a placeholder key.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::ResolutionTimeout;
use crate::indexer::dependencies::RawEdge;
use crate::indexer::languages::language_by_name;
use crate::models::{Edge, EdgeKind, Entity, EntityKey, Provenance, Span};

// ---------------------------------------------------------------------------
// GraphIndex
// ---------------------------------------------------------------------------

/// Name and location index over every entity known to the resolver.
#[derive(Clone, Debug, Default)]
pub struct GraphIndex {
    by_name: BTreeMap<(String, String), BTreeSet<EntityKey>>,
    by_file: BTreeMap<String, Vec<(EntityKey, Span)>>,
}

impl GraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Self {
        let mut index = Self::new();
        for entity in entities {
            index.insert(entity.key.clone(), entity.span);
        }
        index
    }

    pub fn insert(&mut self, key: EntityKey, span: Span) {
        self.by_name
            .entry((key.language.clone(), key.qualified_name.clone()))
            .or_default()
            .insert(key.clone());
        let file = self.by_file.entry(key.file_path.clone()).or_default();
        file.retain(|(k, _)| *k != key);
        file.push((key, span));
    }

    pub fn remove_file(&mut self, file_path: &str) {
        let Some(entries) = self.by_file.remove(file_path) else {
            return;
        };
        for (key, _) in entries {
            let slot = (key.language.clone(), key.qualified_name.clone());
            if let Some(keys) = self.by_name.get_mut(&slot) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.by_name.remove(&slot);
                }
            }
        }
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.by_name
            .get(&(key.language.clone(), key.qualified_name.clone()))
            .is_some_and(|keys| keys.contains(key))
    }

    pub fn len(&self) -> usize {
        self.by_file.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }

    /// Entities a reference to `target_name` may denote.
    ///
    /// Tries the full path first, then successively shorter suffixes. When a
    /// suffix matches several entities, the dropped leading segments are
    /// used as a file path hint to narrow them down.
    pub fn candidates(&self, language: &str, target_name: &str, kind: EdgeKind) -> Vec<EntityKey> {
        let segments = split_segments(target_name);
        for (start, qualified) in probe_names(language, target_name).into_iter().enumerate() {
            let Some(keys) = self.by_name.get(&(language.to_string(), qualified)) else {
                continue;
            };
            let found: Vec<EntityKey> = keys
                .iter()
                .filter(|k| kind.accepts_target(&k.kind))
                .cloned()
                .collect();
            if found.is_empty() {
                continue;
            }
            if found.len() > 1 && start > 0 {
                let hint = segments[..start].join("/");
                let narrowed: Vec<EntityKey> = found
                    .iter()
                    .filter(|k| path_matches_hint(&k.file_path, &hint))
                    .cloned()
                    .collect();
                if narrowed.len() == 1 {
                    return narrowed;
                }
            }
            return found;
        }
        Vec::new()
    }

    /// Innermost entity whose span covers `line` in `file_path`.
    pub fn entity_at(&self, file_path: &str, line: u32) -> Option<EntityKey> {
        self.by_file
            .get(file_path)?
            .iter()
            .filter(|(_, span)| span.contains_line(line))
            .min_by(|(ka, sa), (kb, sb)| {
                sa.line_count()
                    .cmp(&sb.line_count())
                    .then_with(|| ka.cmp(kb))
            })
            .map(|(key, _)| key.clone())
    }
}

/// Qualified names [`GraphIndex::candidates`] looks up for `target_name`,
/// longest first. Entry `i` drops the first `i` path segments.
pub fn probe_names(language: &str, target_name: &str) -> Vec<String> {
    let separator = language_by_name(language)
        .map(|spec| spec.separator)
        .unwrap_or(".");
    let segments = split_segments(target_name);
    (0..segments.len())
        .map(|start| segments[start..].join(separator))
        .collect()
}

fn split_segments(name: &str) -> Vec<&str> {
    name.split("::")
        .flat_map(|part| part.split('.'))
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect()
}

fn path_matches_hint(file_path: &str, hint: &str) -> bool {
    let stem = file_path
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_path);
    let stem = stem
        .strip_suffix("/mod")
        .or_else(|| stem.strip_suffix("/__init__"))
        .unwrap_or(stem);
    stem == hint || stem.ends_with(&format!("/{hint}"))
}

// ---------------------------------------------------------------------------
// External resolver
// ---------------------------------------------------------------------------

/// What the external resolver is told about a reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionContext {
    pub language: String,
    pub from: EntityKey,
    pub edge_kind: EdgeKind,
    /// Candidates the index already found, possibly empty.
    pub candidates: Vec<EntityKey>,
}

/// A definitive definition site reported by an external resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub file_path: String,
    pub span: Span,
}

/// External semantic resolver, e.g. a language server.
pub trait SymbolResolver: Send + Sync {
    /// Return the single definition site of `hint`, or `None` when there is
    /// no definitive answer.
    fn resolve(&self, hint: &str, context: &ResolutionContext) -> Option<ResolvedLocation>;
}

struct ResolveJob {
    hint: String,
    context: ResolutionContext,
    deadline: Instant,
    reply: mpsc::Sender<Option<ResolvedLocation>>,
}

/// Runs a [`SymbolResolver`] on one long-lived worker thread with a per-call
/// deadline.
///
/// While the worker is inside a call whose deadline has passed the resolver
/// counts as stalled: further calls fail fast with [`ResolutionTimeout`]
/// instead of queueing behind the hung call, until the worker returns. At
/// most one resolver invocation is ever in flight, and jobs whose deadline
/// passed while queued are dropped unrun.
#[derive(Clone)]
pub struct TimedResolver {
    jobs: Option<mpsc::Sender<ResolveJob>>,
    /// Deadline of the call the worker is currently inside, if any.
    in_flight: Arc<Mutex<Option<Instant>>>,
    timeout: Duration,
}

impl TimedResolver {
    pub fn new(inner: Arc<dyn SymbolResolver>, timeout: Duration) -> Self {
        let in_flight = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel::<ResolveJob>();
        let worker_in_flight = Arc::clone(&in_flight);
        let spawned = std::thread::Builder::new()
            .name("symbol-resolver".to_string())
            .spawn(move || {
                // Exits once every sender is gone.
                for job in rx {
                    if Instant::now() >= job.deadline {
                        continue;
                    }
                    *worker_in_flight.lock() = Some(job.deadline);
                    let answer = catch_unwind(AssertUnwindSafe(|| {
                        inner.resolve(&job.hint, &job.context)
                    }))
                    .unwrap_or_else(|_| {
                        warn!("symbol resolver panicked on `{}`", job.hint);
                        None
                    });
                    *worker_in_flight.lock() = None;
                    let _ = job.reply.send(answer);
                }
            });
        let jobs = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                warn!("failed to start symbol resolver thread: {e}");
                None
            }
        };
        Self {
            jobs,
            in_flight,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True while the worker is still inside a call that already timed out.
    pub fn is_stalled(&self) -> bool {
        matches!(*self.in_flight.lock(), Some(deadline) if Instant::now() >= deadline)
    }

    /// A resolver that panics or cannot be started counts as "no answer".
    pub fn resolve(
        &self,
        hint: &str,
        context: ResolutionContext,
    ) -> Result<Option<ResolvedLocation>, ResolutionTimeout> {
        let Some(jobs) = &self.jobs else {
            return Ok(None);
        };
        if self.is_stalled() {
            return Err(self.timed_out(hint));
        }
        let (reply, rx) = mpsc::channel();
        let job = ResolveJob {
            hint: hint.to_string(),
            context,
            deadline: Instant::now() + self.timeout,
            reply,
        };
        if jobs.send(job).is_err() {
            warn!("symbol resolver worker is gone");
            return Ok(None);
        }
        match rx.recv_timeout(self.timeout) {
            Ok(answer) => Ok(answer),
            Err(RecvTimeoutError::Timeout) => Err(self.timed_out(hint)),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("symbol resolver exited without an answer for `{hint}`");
                Ok(None)
            }
        }
    }

    fn timed_out(&self, hint: &str) -> ResolutionTimeout {
        ResolutionTimeout {
            target_name: hint.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    pub local: usize,
    pub global: usize,
    pub hydrated: usize,
    pub unresolved: usize,
    pub timeouts: Vec<ResolutionTimeout>,
}

impl ResolutionStats {
    pub fn merge(&mut self, other: ResolutionStats) {
        self.local += other.local;
        self.global += other.global;
        self.hydrated += other.hydrated;
        self.unresolved += other.unresolved;
        self.timeouts.extend(other.timeouts);
    }
}

pub fn resolve(
    raw_edges: &[RawEdge],
    index: &GraphIndex,
    external: Option<&TimedResolver>,
) -> Vec<Edge> {
    resolve_with_stats(raw_edges, index, external).0
}

/// Resolve and report how each reference was settled. Output is sorted and
/// free of duplicate `(from, to, kind)` triples.
pub fn resolve_with_stats(
    raw_edges: &[RawEdge],
    index: &GraphIndex,
    external: Option<&TimedResolver>,
) -> (Vec<Edge>, ResolutionStats) {
    let mut stats = ResolutionStats::default();

    // One group per reference; ambiguous local matches share a group.
    let mut groups: BTreeMap<(&EntityKey, EdgeKind, &str), Vec<&RawEdge>> = BTreeMap::new();
    for raw in raw_edges {
        groups
            .entry((&raw.from, raw.kind, raw.target_name.as_str()))
            .or_default()
            .push(raw);
    }

    let mut resolved: BTreeMap<(EntityKey, EntityKey, EdgeKind), Edge> = BTreeMap::new();
    let mut add = |edge: Edge| {
        let slot = (edge.from.clone(), edge.to.clone(), edge.kind);
        match resolved.get(&slot) {
            Some(existing) if existing.provenance >= edge.provenance => {}
            _ => {
                resolved.insert(slot, edge);
            }
        }
    };

    for ((from, kind, target_name), members) in groups {
        let local: Vec<EntityKey> = members
            .iter()
            .filter_map(|m| m.local_target.clone())
            .collect();
        if local.len() == 1 && members.iter().all(|m| m.candidates <= 1) {
            stats.local += 1;
            add(Edge::resolved(
                from.clone(),
                local[0].clone(),
                kind,
                Provenance::Syntactic,
            ));
            continue;
        }

        let candidates = if local.is_empty() {
            index.candidates(&from.language, target_name, kind)
        } else {
            local
        };
        if candidates.len() == 1 {
            stats.global += 1;
            add(Edge::resolved(
                from.clone(),
                candidates[0].clone(),
                kind,
                Provenance::Syntactic,
            ));
            continue;
        }

        if let Some(resolver) = external {
            let context = ResolutionContext {
                language: from.language.clone(),
                from: from.clone(),
                edge_kind: kind,
                candidates: candidates.clone(),
            };
            match resolver.resolve(target_name, context) {
                Ok(Some(location)) => {
                    let target = index
                        .entity_at(&location.file_path, location.span.start_line)
                        .filter(|k| kind.accepts_target(&k.kind));
                    if let Some(target) = target {
                        stats.hydrated += 1;
                        add(Edge::resolved(
                            from.clone(),
                            target,
                            kind,
                            Provenance::Hydrated,
                        ));
                        continue;
                    }
                    debug!(
                        "resolver location {}:{} for `{target_name}` maps to no entity",
                        location.file_path, location.span.start_line
                    );
                }
                Ok(None) => {}
                Err(timeout) => {
                    warn!("{timeout}");
                    stats.timeouts.push(timeout);
                }
            }
        }

        stats.unresolved += 1;
        add(Edge::unresolved(from.clone(), kind, target_name));
    }

    (resolved.into_values().collect(), stats)
}
