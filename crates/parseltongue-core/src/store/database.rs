//! SQLite-backed graph store.
//!
//! One writer connection sits behind a mutex; every read opens its own
//! connection so queries run in parallel with each other and with the writer.
//! The database runs in WAL mode, so readers always observe the last
//! committed batch and never a partially applied one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, Transaction};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::errors::{IndexingFileError, PtResult, QueryError, StoreCorruptionError, StoreError};
use crate::indexer::resolution::{probe_names, GraphIndex};
use crate::models::{
    Edge, EdgeKind, Entity, EntityKey, IndexSnapshot, Provenance, Resolution, Span, Subgraph,
};
use crate::query::guards::{check_traversal, MAX_GRAPH_VISITED};
use crate::query::predicate::{matches_all, QueryPredicate};
use crate::query::traverse::{capped_bfs, Direction, TraversalLimits};
use crate::store::codec::{EdgeRow, EntityRow, EDGE_COLUMNS, ENTITY_COLUMNS};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Batch types
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between a caller and a running batch.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The complete new state of one file, or its removal.
#[derive(Clone, Debug, PartialEq)]
pub enum FileUpdate {
    Replace {
        path: String,
        language: String,
        content_hash: String,
        entities: Vec<Entity>,
        edges: Vec<Edge>,
    },
    Remove {
        path: String,
    },
}

impl FileUpdate {
    pub fn path(&self) -> &str {
        match self {
            FileUpdate::Replace { path, .. } | FileUpdate::Remove { path } => path,
        }
    }
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub applied: Vec<String>,
    pub failed: Vec<(String, IndexingFileError)>,
    /// Files not attempted because the batch was cancelled.
    pub skipped: Vec<String>,
    /// Unresolved edges re-bound after the batch.
    pub relinked: usize,
}

/// The write-side surface the incremental indexer needs.
pub trait IndexStore {
    fn file_hashes(&self) -> Result<BTreeMap<String, String>, QueryError>;

    fn graph_index(&self) -> Result<GraphIndex, QueryError>;

    fn apply_updates(
        &self,
        updates: Vec<FileUpdate>,
        cancel: &CancelToken,
    ) -> Result<ApplyOutcome, QueryError>;

    fn record_diagnostic(
        &self,
        run_id: &str,
        stage: &str,
        file_path: Option<&str>,
        message: &str,
    ) -> Result<(), QueryError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexingDiagnostic {
    pub id: i64,
    pub run_id: String,
    pub stage: String,
    pub severity: String,
    pub file_path: Option<String>,
    pub message: String,
    pub created_at: Option<String>,
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

pub struct GraphStore {
    db_path: PathBuf,
    config: StoreConfig,
    writer: Mutex<Connection>,
    corruption: RwLock<Option<StoreCorruptionError>>,
}

impl GraphStore {
    /// Open (creating if needed) the store at `db_path`, apply pending
    /// migrations, and optionally verify every row.
    pub fn open(db_path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, QueryError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(StoreError::from)?;
        }
        let writer = open_connection(&db_path, config.busy_timeout_ms)?;
        init_schema(&writer)?;
        let store = Self {
            db_path,
            config,
            writer: Mutex::new(writer),
            corruption: RwLock::new(None),
        };
        info!("opened graph store at {}", store.db_path.display());
        if store.config.verify_on_open {
            // A failed verification leaves the store open but refusing queries.
            if let Err(e) = store.verify_integrity() {
                warn!("graph store failed verification on open: {e}");
            }
        }
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn reader(&self) -> PtResult<Connection> {
        open_connection(&self.db_path, self.config.busy_timeout_ms)
    }

    pub fn is_corrupted(&self) -> bool {
        self.corruption.read().is_some()
    }

    fn ensure_healthy(&self) -> Result<(), QueryError> {
        match &*self.corruption.read() {
            Some(c) => Err(QueryError::Corrupted(c.to_string())),
            None => Ok(()),
        }
    }

    fn mark_corrupted(&self, err: StoreCorruptionError) {
        warn!("graph store corruption detected: {err}");
        let mut state = self.corruption.write();
        if state.is_none() {
            *state = Some(err);
        }
    }

    /// Convert an internal error, latching the corrupted state if needed.
    fn surface(&self, err: StoreError) -> QueryError {
        if let StoreError::Corruption(c) = &err {
            self.mark_corrupted(c.clone());
        }
        QueryError::from(err)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert or replace entities atomically.
    pub fn upsert_entities(&self, entities: &[Entity]) -> Result<(), QueryError> {
        self.ensure_healthy()?;
        let mut conn = self.writer.lock();
        let mut run = || -> PtResult<()> {
            let tx = conn.transaction()?;
            write_entities(&tx, entities)?;
            tx.commit()?;
            Ok(())
        };
        run().map_err(|e| self.surface(e))?;
        debug!("upserted {} entities", entities.len());
        Ok(())
    }

    /// Insert edges atomically; duplicate triples collapse and provenance
    /// never downgrades.
    pub fn upsert_edges(&self, edges: &[Edge]) -> Result<(), QueryError> {
        self.ensure_healthy()?;
        let mut conn = self.writer.lock();
        let mut run = || -> PtResult<()> {
            let tx = conn.transaction()?;
            write_edges(&tx, edges)?;
            tx.commit()?;
            Ok(())
        };
        run().map_err(|e| self.surface(e))?;
        debug!("upserted {} edges", edges.len());
        Ok(())
    }

    /// Remove every entity of `file_path` and the edges they own.
    ///
    /// Edges from other files that pointed at a removed entity are kept and
    /// marked unresolved under the removed entity's qualified name. The
    /// file's stored hash is dropped too, so the next pass re-parses it.
    pub fn delete_entities_for_file(&self, file_path: &str) -> Result<usize, QueryError> {
        self.ensure_healthy()?;
        let mut conn = self.writer.lock();
        let mut run = || -> PtResult<usize> {
            let tx = conn.transaction()?;
            let removed = delete_file_rows(&tx, file_path)?;
            tx.execute("DELETE FROM files WHERE path = ?1;", params![file_path])?;
            tx.commit()?;
            Ok(removed)
        };
        let removed = run().map_err(|e| self.surface(e))?;
        debug!("deleted {removed} entities for {file_path}");
        Ok(removed)
    }

    /// Apply a batch of per-file updates as one transaction.
    ///
    /// Each file runs in its own savepoint: a file that fails to apply is
    /// rolled back alone and reported, the rest of the batch commits.
    /// Cancellation is honoured between files.
    pub fn apply_updates(
        &self,
        updates: Vec<FileUpdate>,
        cancel: &CancelToken,
    ) -> Result<ApplyOutcome, QueryError> {
        self.ensure_healthy()?;
        let mut conn = self.writer.lock();
        let mut outcome = ApplyOutcome::default();
        let run = |outcome: &mut ApplyOutcome| -> PtResult<()> {
            let mut tx = conn.transaction()?;
            for update in updates {
                let path = update.path().to_string();
                if cancel.is_cancelled() {
                    outcome.skipped.push(path);
                    continue;
                }
                match apply_in_savepoint(&mut tx, &update) {
                    Ok(()) => outcome.applied.push(path),
                    Err(StoreError::Corruption(c)) => return Err(c.into()),
                    Err(e) => {
                        warn!("failed to apply index update for {path}: {e}");
                        outcome.failed.push((
                            path.clone(),
                            IndexingFileError::Storage {
                                path,
                                message: e.to_string(),
                            },
                        ));
                    }
                }
            }
            if !outcome.applied.is_empty() {
                outcome.relinked = relink_unresolved(&tx)?;
                tx.execute(
                    "INSERT INTO store_meta(key, value) \
                     VALUES('last_updated', strftime('%Y-%m-%dT%H:%M:%fZ', 'now')) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                    [],
                )?;
            }
            tx.commit()?;
            Ok(())
        };
        run(&mut outcome).map_err(|e| self.surface(e))?;
        debug!(
            "applied {} file updates ({} failed, {} skipped, {} edges relinked)",
            outcome.applied.len(),
            outcome.failed.len(),
            outcome.skipped.len(),
            outcome.relinked
        );
        Ok(outcome)
    }

    /// Move a file's entities and edges to a new path, rewriting their keys.
    /// Returns `false` when nothing is stored under `old_path`.
    pub fn rename_file(&self, old_path: &str, new_path: &str) -> Result<bool, QueryError> {
        self.ensure_healthy()?;
        if old_path == new_path {
            return Ok(false);
        }
        let mut conn = self.writer.lock();
        let mut run = || -> PtResult<bool> {
            let tx = conn.transaction()?;
            let moved = rename_rows(&tx, old_path, new_path)?;
            tx.commit()?;
            Ok(moved)
        };
        run().map_err(|e| self.surface(e))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_by_key(&self, key: &EntityKey) -> Result<Option<Entity>, QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<Option<Entity>> {
            let conn = self.reader()?;
            let row = conn.query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE key = ?1;"),
                params![key.canonical()],
                EntityRow::from_row,
            );
            match row {
                Ok(row) => Ok(Some(row.decode()?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        };
        run().map_err(|e| self.surface(e))
    }

    /// Entities satisfying every predicate, ordered by key.
    pub fn query_by_field_pattern(
        &self,
        predicates: &[QueryPredicate],
    ) -> Result<Vec<Entity>, QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<Vec<Entity>> { select_entities(&self.reader()?, predicates) };
        run().map_err(|e| self.surface(e))
    }

    /// Matching entities plus every edge they own, read from one snapshot.
    pub fn select_with_edges(
        &self,
        predicates: &[QueryPredicate],
    ) -> Result<(Vec<Entity>, Vec<Edge>), QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<(Vec<Entity>, Vec<Edge>)> {
            let mut conn = self.reader()?;
            let tx = conn.transaction()?;
            let entities = select_entities(&tx, predicates)?;
            let sql = format!("SELECT {EDGE_COLUMNS} FROM edges WHERE from_key = ?1;");
            let mut edges: Vec<Edge> = Vec::new();
            for entity in &entities {
                edges.extend(select_edges(&tx, &sql, &[&entity.key.canonical()])?);
            }
            edges.sort();
            tx.commit()?;
            Ok((entities, edges))
        };
        run().map_err(|e| self.surface(e))
    }

    /// Capped BFS along outgoing resolved edges.
    pub fn traverse(
        &self,
        seeds: &[EntityKey],
        edge_kinds: &[EdgeKind],
        max_hops: u32,
        cap_per_hop: u32,
    ) -> Result<Subgraph, QueryError> {
        self.traverse_directed(seeds, edge_kinds, max_hops, cap_per_hop, Direction::Outgoing)
    }

    /// Capped BFS in the given direction. Seeds that are not stored are
    /// dropped. The whole walk reads one consistent snapshot.
    ///
    /// Out-of-range `max_hops`, `cap_per_hop` or seed counts are rejected
    /// with `InvalidRequest`; hitting the total node budget sets
    /// `Subgraph::truncated`.
    pub fn traverse_directed(
        &self,
        seeds: &[EntityKey],
        edge_kinds: &[EdgeKind],
        max_hops: u32,
        cap_per_hop: u32,
        direction: Direction,
    ) -> Result<Subgraph, QueryError> {
        self.ensure_healthy()?;
        let distinct_seeds: BTreeSet<&EntityKey> = seeds.iter().collect();
        check_traversal(max_hops, cap_per_hop, distinct_seeds.len())?;
        let limits = TraversalLimits {
            max_hops,
            cap_per_hop,
            max_nodes: MAX_GRAPH_VISITED as usize,
        };
        let run = || -> PtResult<Subgraph> {
            let mut conn = self.reader()?;
            let tx = conn.transaction()?;
            let mut present: BTreeSet<EntityKey> = BTreeSet::new();
            for seed in seeds {
                if entity_exists(&tx, &seed.canonical())? {
                    present.insert(seed.clone());
                }
            }
            let seeds: Vec<EntityKey> = present.into_iter().collect();
            let subgraph = capped_bfs(&seeds, edge_kinds, &limits, |node| {
                traversable_edges(&tx, node, direction)
            })?;
            tx.commit()?;
            Ok(subgraph)
        };
        run().map_err(|e| self.surface(e))
    }

    pub fn snapshot(&self) -> Result<IndexSnapshot, QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<IndexSnapshot> {
            let mut conn = self.reader()?;
            let tx = conn.transaction()?;
            let file_hashes = read_file_hashes(&tx)?;
            let entity_count: i64 =
                tx.query_row("SELECT COUNT(*) FROM entities;", [], |row| row.get(0))?;
            let edge_count: i64 = tx.query_row("SELECT COUNT(*) FROM edges;", [], |row| row.get(0))?;
            let last_updated = match tx.query_row(
                "SELECT value FROM store_meta WHERE key = 'last_updated';",
                [],
                |row| row.get::<_, Option<String>>(0),
            ) {
                Ok(v) => v,
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            tx.commit()?;
            Ok(IndexSnapshot {
                file_hashes,
                entity_count: entity_count as u64,
                edge_count: edge_count as u64,
                last_updated,
            })
        };
        run().map_err(|e| self.surface(e))
    }

    pub fn file_hashes(&self) -> Result<BTreeMap<String, String>, QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<BTreeMap<String, String>> { read_file_hashes(&self.reader()?) };
        run().map_err(|e| self.surface(e))
    }

    /// Name and location index over every stored entity.
    pub fn graph_index(&self) -> Result<GraphIndex, QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<GraphIndex> { load_graph_index(&self.reader()?) };
        run().map_err(|e| self.surface(e))
    }

    pub fn entities_for_file(&self, file_path: &str) -> Result<Vec<Entity>, QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<Vec<Entity>> {
            let conn = self.reader()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE file_path = ?1;"
            ))?;
            let rows = stmt.query_map(params![file_path], EntityRow::from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.decode()?);
            }
            out.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(out)
        };
        run().map_err(|e| self.surface(e))
    }

    /// Every edge owned by `key`, resolved or not.
    pub fn edges_from(&self, key: &EntityKey) -> Result<Vec<Edge>, QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<Vec<Edge>> {
            select_edges(
                &self.reader()?,
                &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE from_key = ?1;"),
                &[&key.canonical()],
            )
        };
        run().map_err(|e| self.surface(e))
    }

    pub fn all_edges(&self) -> Result<Vec<Edge>, QueryError> {
        self.ensure_healthy()?;
        let run = || -> PtResult<Vec<Edge>> {
            select_edges(
                &self.reader()?,
                &format!("SELECT {EDGE_COLUMNS} FROM edges;"),
                &[],
            )
        };
        run().map_err(|e| self.surface(e))
    }

    // -----------------------------------------------------------------------
    // Integrity, backup
    // -----------------------------------------------------------------------

    /// Run SQLite's quick check and re-verify every row checksum. On failure
    /// the store latches into the corrupted state; on success it clears it.
    pub fn verify_integrity(&self) -> Result<(), QueryError> {
        let run = || -> PtResult<()> {
            let mut conn = self.reader()?;
            let tx = conn.transaction()?;
            let status: String = tx.query_row("PRAGMA quick_check;", [], |row| row.get(0))?;
            if status != "ok" {
                return Err(StoreCorruptionError {
                    table: "sqlite".to_string(),
                    row: String::new(),
                    detail: status,
                }
                .into());
            }
            {
                let mut stmt = tx.prepare(&format!("SELECT {ENTITY_COLUMNS} FROM entities;"))?;
                let rows = stmt.query_map([], EntityRow::from_row)?;
                for row in rows {
                    row?.decode()?;
                }
            }
            select_edges(&tx, &format!("SELECT {EDGE_COLUMNS} FROM edges;"), &[])?;
            tx.commit()?;
            Ok(())
        };
        run().map_err(|e| self.surface(e))?;
        *self.corruption.write() = None;
        Ok(())
    }

    /// Drop all graph data and clear the corrupted state. The caller is
    /// expected to re-index afterwards.
    pub fn rebuild(&self) -> Result<(), QueryError> {
        let mut conn = self.writer.lock();
        let mut run = || -> PtResult<()> {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "DELETE FROM edges;
                 DELETE FROM entities;
                 DELETE FROM files;
                 DELETE FROM store_meta WHERE key = 'last_updated';",
            )?;
            tx.commit()?;
            Ok(())
        };
        run().map_err(QueryError::from)?;
        *self.corruption.write() = None;
        info!("graph store at {} cleared for rebuild", self.db_path.display());
        Ok(())
    }

    /// Copy the database to `destination` with the SQLite online backup API.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> Result<PathBuf, QueryError> {
        let destination = destination.as_ref().to_path_buf();
        let run = || -> PtResult<()> {
            if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let src_conn = self.reader()?;
            let mut dst_conn = Connection::open(&destination)?;
            let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
            backup.run_to_completion(100, Duration::from_millis(10), None)?;
            Ok(())
        };
        run().map_err(|e| self.surface(e))?;
        Ok(destination)
    }

    /// Replace the database contents from a backup file, then re-verify.
    pub fn restore_from(&self, source: impl AsRef<Path>) -> Result<(), QueryError> {
        let source = source.as_ref();
        if !source.exists() {
            return Err(QueryError::NotFound(format!(
                "backup file does not exist: {}",
                source.display()
            )));
        }
        {
            let mut writer = self.writer.lock();
            let mut run = || -> PtResult<()> {
                let src_conn = Connection::open(source)?;
                let backup = rusqlite::backup::Backup::new(&src_conn, &mut writer)?;
                backup.run_to_completion(100, Duration::from_millis(10), None)?;
                Ok(())
            };
            run().map_err(QueryError::from)?;
        }
        info!("restored graph store from {}", source.display());
        self.verify_integrity()
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    // Diagnostics bypass `ensure_healthy`: the table holds no graph rows and
    // is where failures of a corrupted store get reported.
    pub fn record_diagnostic(
        &self,
        run_id: &str,
        stage: &str,
        file_path: Option<&str>,
        message: &str,
    ) -> Result<(), QueryError> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO indexing_diagnostics(run_id, stage, severity, file_path, message) \
             VALUES (?1, ?2, 'error', ?3, ?4);",
            params![run_id, stage, file_path, message],
        )?;
        Ok(())
    }

    /// Most recent diagnostics first, optionally filtered.
    pub fn list_diagnostics(
        &self,
        run_id: Option<&str>,
        stage: Option<&str>,
        limit: i64,
    ) -> Result<Vec<IndexingDiagnostic>, QueryError> {
        let mut where_clauses: Vec<String> = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(rid) = run_id {
            where_clauses.push("run_id = ?".to_string());
            param_values.push(Box::new(rid.to_string()));
        }
        if let Some(st) = stage {
            where_clauses.push("stage = ?".to_string());
            param_values.push(Box::new(st.to_string()));
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };
        param_values.push(Box::new(limit.max(1)));
        let sql = format!(
            "SELECT id, run_id, stage, severity, file_path, message, created_at \
             FROM indexing_diagnostics {where_sql} ORDER BY id DESC LIMIT ?;"
        );

        let run = || -> PtResult<Vec<IndexingDiagnostic>> {
            let conn = self.reader()?;
            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                param_values.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(param_refs.as_slice(), |row| {
                Ok(IndexingDiagnostic {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    stage: row.get(2)?,
                    severity: row.get(3)?,
                    file_path: row.get(4)?,
                    message: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        };
        run().map_err(QueryError::from)
    }
}

impl IndexStore for GraphStore {
    fn file_hashes(&self) -> Result<BTreeMap<String, String>, QueryError> {
        GraphStore::file_hashes(self)
    }

    fn graph_index(&self) -> Result<GraphIndex, QueryError> {
        GraphStore::graph_index(self)
    }

    fn apply_updates(
        &self,
        updates: Vec<FileUpdate>,
        cancel: &CancelToken,
    ) -> Result<ApplyOutcome, QueryError> {
        GraphStore::apply_updates(self, updates, cancel)
    }

    fn record_diagnostic(
        &self,
        run_id: &str,
        stage: &str,
        file_path: Option<&str>,
        message: &str,
    ) -> Result<(), QueryError> {
        GraphStore::record_diagnostic(self, run_id, stage, file_path, message)
    }
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

fn open_connection(path: &Path, busy_timeout_ms: u64) -> PtResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    Ok(conn)
}

/// WAL journal, base tables, then pending migrations.
fn init_schema(conn: &Connection) -> PtResult<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    for stmt in schema::SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    schema::migrate_schema(conn)?;
    debug!("schema at version {}", schema::get_schema_version(conn));
    Ok(())
}

// ---------------------------------------------------------------------------
// Row-level helpers (run inside the caller's transaction)
// ---------------------------------------------------------------------------

fn write_entities(conn: &Connection, entities: &[Entity]) -> PtResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO entities( \
             key, language, file_path, kind, qualified_name, name, signature_text, \
             visibility, is_test, confidence, start_line, end_line, payload, checksum \
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
         ON CONFLICT(key) DO UPDATE SET \
             language = excluded.language, \
             file_path = excluded.file_path, \
             kind = excluded.kind, \
             qualified_name = excluded.qualified_name, \
             name = excluded.name, \
             signature_text = excluded.signature_text, \
             visibility = excluded.visibility, \
             is_test = excluded.is_test, \
             confidence = excluded.confidence, \
             start_line = excluded.start_line, \
             end_line = excluded.end_line, \
             payload = excluded.payload, \
             checksum = excluded.checksum;",
    )?;
    for entity in entities {
        let row = EntityRow::encode(entity)?;
        stmt.execute(params![
            row.key,
            entity.language(),
            entity.file_path(),
            entity.kind().as_str(),
            entity.qualified_name(),
            entity.name,
            entity.signature_text,
            entity.visibility.as_str(),
            entity.is_test,
            entity.confidence.as_str(),
            entity.span.start_line,
            entity.span.end_line,
            row.payload,
            row.checksum,
        ])?;
    }
    Ok(())
}

fn write_edges(conn: &Connection, edges: &[Edge]) -> PtResult<()> {
    // Collapse duplicate triples within the batch first.
    let mut unique: BTreeMap<(String, String, EdgeKind), Edge> = BTreeMap::new();
    for edge in edges {
        let slot = (edge.from.canonical(), edge.to.canonical(), edge.kind);
        match unique.get(&slot) {
            Some(existing) if existing.provenance >= edge.provenance => {}
            _ => {
                unique.insert(slot, edge.clone());
            }
        }
    }

    let mut existing_stmt = conn.prepare_cached(
        "SELECT provenance FROM edges WHERE from_key = ?1 AND to_key = ?2 AND kind = ?3;",
    )?;
    let mut insert_stmt = conn.prepare_cached(
        "INSERT INTO edges( \
             from_key, to_key, kind, from_file, resolution, target_name, provenance, checksum \
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(from_key, to_key, kind) DO UPDATE SET \
             from_file = excluded.from_file, \
             resolution = excluded.resolution, \
             target_name = excluded.target_name, \
             provenance = excluded.provenance, \
             checksum = excluded.checksum;",
    )?;
    for ((from_key, to_key, kind), mut edge) in unique {
        let stored = existing_stmt.query_row(params![from_key, to_key, kind.as_str()], |row| {
            row.get::<_, String>(0)
        });
        match stored {
            Ok(label) => {
                if Provenance::parse(&label).is_some_and(|p| p > edge.provenance) {
                    edge.provenance = Provenance::Hydrated;
                }
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {}
            Err(e) => return Err(e.into()),
        }
        let row = EdgeRow::encode(&edge);
        insert_stmt.execute(params![
            row.from_key,
            row.to_key,
            row.kind,
            row.from_file,
            row.resolution,
            row.target_name,
            row.provenance,
            row.checksum,
        ])?;
    }
    Ok(())
}

fn select_entities(conn: &Connection, predicates: &[QueryPredicate]) -> PtResult<Vec<Entity>> {
    let mut where_clauses: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    for predicate in predicates {
        if let Some((clause, value)) = predicate.sql_condition() {
            where_clauses.push(clause);
            param_values.push(value);
        }
    }
    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };
    let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities {where_sql};");

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), EntityRow::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        let entity = row?.decode()?;
        if matches_all(predicates, &entity) {
            out.push(entity);
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

fn entity_exists(conn: &Connection, canonical: &str) -> PtResult<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM entities WHERE key = ?1;")?;
    Ok(stmt.exists(params![canonical])?)
}

fn select_edges(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::types::ToSql],
) -> PtResult<Vec<Edge>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(args, EdgeRow::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.decode()?);
    }
    out.sort();
    Ok(out)
}

/// Resolved edges incident to `node` whose other endpoint is stored.
fn traversable_edges(conn: &Connection, node: &EntityKey, direction: Direction) -> PtResult<Vec<Edge>> {
    let key = node.canonical();
    let mut out = Vec::new();
    if direction.follows_outgoing() {
        out.extend(select_edges(
            conn,
            &format!(
                "SELECT {EDGE_COLUMNS} FROM edges e \
                 WHERE e.from_key = ?1 AND e.resolution = 'resolved' \
                   AND EXISTS (SELECT 1 FROM entities WHERE key = e.to_key);"
            ),
            &[&key],
        )?);
    }
    if direction.follows_incoming() {
        out.extend(select_edges(
            conn,
            &format!(
                "SELECT {EDGE_COLUMNS} FROM edges e \
                 WHERE e.to_key = ?1 AND e.resolution = 'resolved' \
                   AND EXISTS (SELECT 1 FROM entities WHERE key = e.from_key);"
            ),
            &[&key],
        )?);
    }
    Ok(out)
}

fn read_file_hashes(conn: &Connection) -> PtResult<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT path, content_hash FROM files;")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
}

fn load_graph_index(conn: &Connection) -> PtResult<GraphIndex> {
    let mut index = GraphIndex::new();
    index_entities(conn, "SELECT key, start_line, end_line FROM entities;", &[], &mut index)?;
    Ok(index)
}

/// Add the `(key, start_line, end_line)` rows selected by `sql` to `index`.
fn index_entities(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::types::ToSql],
    index: &mut GraphIndex,
) -> PtResult<()> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u32>(1)?,
            row.get::<_, u32>(2)?,
        ))
    })?;
    for row in rows {
        let (raw_key, start_line, end_line) = row?;
        let key: EntityKey = raw_key.parse().map_err(|e: QueryError| StoreCorruptionError {
            table: "entities".to_string(),
            row: raw_key.clone(),
            detail: e.to_string(),
        })?;
        index.insert(
            key,
            Span {
                start_line,
                start_col: 0,
                end_line,
                end_col: 0,
            },
        );
    }
    Ok(())
}

/// Remove a file's entities and owned edges; dangle incoming edges.
fn delete_file_rows(conn: &Connection, file_path: &str) -> PtResult<usize> {
    let mut removed: Vec<(String, String)> = Vec::new();
    {
        let mut stmt =
            conn.prepare_cached("SELECT key, qualified_name FROM entities WHERE file_path = ?1;")?;
        let rows = stmt.query_map(params![file_path], |row| Ok((row.get(0)?, row.get(1)?)))?;
        for row in rows {
            removed.push(row?);
        }
    }

    conn.execute("DELETE FROM edges WHERE from_file = ?1;", params![file_path])?;

    let mut dangling: Vec<Edge> = Vec::new();
    for (key, qualified_name) in &removed {
        for mut edge in select_edges(
            conn,
            &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE to_key = ?1;"),
            &[key],
        )? {
            edge.resolution = Resolution::Unresolved {
                target_name: qualified_name.clone(),
            };
            dangling.push(edge);
        }
    }
    if !dangling.is_empty() {
        write_edges(conn, &dangling)?;
    }

    let count = conn.execute("DELETE FROM entities WHERE file_path = ?1;", params![file_path])?;
    Ok(count)
}

fn apply_in_savepoint(tx: &mut Transaction<'_>, update: &FileUpdate) -> PtResult<()> {
    let sp = tx.savepoint()?;
    match update {
        FileUpdate::Replace {
            path,
            language,
            content_hash,
            entities,
            edges,
        } => {
            if let Some(stray) = entities.iter().find(|e| e.file_path() != path) {
                return Err(StoreError::Database(format!(
                    "entity {} does not belong to {path}",
                    stray.key
                )));
            }
            if let Some(stray) = edges.iter().find(|e| e.from.file_path != *path) {
                return Err(StoreError::Database(format!(
                    "edge from {} does not belong to {path}",
                    stray.from
                )));
            }
            delete_file_rows(&sp, path)?;
            write_entities(&sp, entities)?;
            write_edges(&sp, edges)?;
            sp.execute(
                "INSERT INTO files(path, language, content_hash, entity_count, last_indexed_at) \
                 VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP) \
                 ON CONFLICT(path) DO UPDATE SET \
                     language = excluded.language, \
                     content_hash = excluded.content_hash, \
                     entity_count = excluded.entity_count, \
                     last_indexed_at = excluded.last_indexed_at;",
                params![path, language, content_hash, entities.len() as i64],
            )?;
        }
        FileUpdate::Remove { path } => {
            delete_file_rows(&sp, path)?;
            sp.execute("DELETE FROM files WHERE path = ?1;", params![path])?;
        }
    }
    sp.commit()?;
    Ok(())
}

/// Re-bind unresolved edges whose target now exists or resolves uniquely.
fn relink_unresolved(conn: &Connection) -> PtResult<usize> {
    let pending = select_edges(
        conn,
        &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE resolution = 'unresolved';"),
        &[],
    )?;
    if pending.is_empty() {
        return Ok(0);
    }
    // Only the names the pending targets can bind to, not the whole table.
    let mut index = GraphIndex::new();
    let mut probed: BTreeSet<(String, String)> = BTreeSet::new();
    for edge in &pending {
        let name = edge.unresolved_name().unwrap_or(&edge.to.qualified_name);
        for qualified in probe_names(&edge.from.language, name) {
            if probed.insert((edge.from.language.clone(), qualified.clone())) {
                index_entities(
                    conn,
                    "SELECT key, start_line, end_line FROM entities \
                     WHERE language = ?1 AND qualified_name = ?2;",
                    &[&edge.from.language, &qualified],
                    &mut index,
                )?;
            }
        }
    }
    let mut rebound: Vec<Edge> = Vec::new();
    for edge in pending {
        let target = if !edge.to.is_placeholder() && entity_exists(conn, &edge.to.canonical())? {
            Some(edge.to.clone())
        } else {
            let name = edge.unresolved_name().unwrap_or(&edge.to.qualified_name);
            let found = index.candidates(&edge.from.language, name, edge.kind);
            (found.len() == 1).then(|| found[0].clone())
        };
        let Some(target) = target else {
            continue;
        };
        conn.execute(
            "DELETE FROM edges WHERE from_key = ?1 AND to_key = ?2 AND kind = ?3;",
            params![edge.from.canonical(), edge.to.canonical(), edge.kind.as_str()],
        )?;
        rebound.push(Edge::resolved(edge.from, target, edge.kind, edge.provenance));
    }
    write_edges(conn, &rebound)?;
    Ok(rebound.len())
}

fn rename_rows(conn: &Connection, old_path: &str, new_path: &str) -> PtResult<bool> {
    let source = conn.query_row(
        "SELECT language, content_hash, entity_count, last_indexed_at FROM files WHERE path = ?1;",
        params![old_path],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        },
    );
    let (language, content_hash, entity_count, last_indexed_at) = match source {
        Ok(v) => v,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut entities: Vec<Entity> = Vec::new();
    {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE file_path = ?1;"
        ))?;
        let rows = stmt.query_map(params![old_path], EntityRow::from_row)?;
        for row in rows {
            entities.push(row?.decode()?);
        }
    }
    let moved_key = |key: &EntityKey| -> EntityKey {
        if key.file_path == old_path {
            EntityKey {
                file_path: new_path.to_string(),
                ..key.clone()
            }
        } else {
            key.clone()
        }
    };

    // Owned edges plus incoming edges from other files.
    let mut affected: BTreeSet<Edge> = select_edges(
        conn,
        &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE from_file = ?1;"),
        &[&old_path],
    )?
    .into_iter()
    .collect();
    for entity in &entities {
        affected.extend(select_edges(
            conn,
            &format!("SELECT {EDGE_COLUMNS} FROM edges WHERE to_key = ?1;"),
            &[&entity.key.canonical()],
        )?);
    }
    for edge in &affected {
        conn.execute(
            "DELETE FROM edges WHERE from_key = ?1 AND to_key = ?2 AND kind = ?3;",
            params![edge.from.canonical(), edge.to.canonical(), edge.kind.as_str()],
        )?;
    }
    conn.execute("DELETE FROM entities WHERE file_path = ?1;", params![old_path])?;

    let entities: Vec<Entity> = entities
        .into_iter()
        .map(|mut e| {
            e.key = moved_key(&e.key);
            e
        })
        .collect();
    let edges: Vec<Edge> = affected
        .into_iter()
        .map(|mut e| {
            e.from = moved_key(&e.from);
            e.to = moved_key(&e.to);
            e
        })
        .collect();
    write_entities(conn, &entities)?;
    write_edges(conn, &edges)?;

    conn.execute(
        "INSERT INTO files (path, language, content_hash, entity_count, last_indexed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(path) DO UPDATE SET \
             language = excluded.language, \
             content_hash = excluded.content_hash, \
             entity_count = excluded.entity_count, \
             last_indexed_at = excluded.last_indexed_at;",
        params![new_path, language, content_hash, entity_count, last_indexed_at],
    )?;
    conn.execute("DELETE FROM files WHERE path = ?1;", params![old_path])?;
    Ok(true)
}
