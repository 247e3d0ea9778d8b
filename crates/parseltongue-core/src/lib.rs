//! Parseltongue core library: an incremental code-graph store.
//!
//! Source files are parsed tolerantly into entities, their references are
//! extracted and resolved into typed edges, and the result is kept in a
//! SQLite-backed graph store that supports key lookups, field pattern
//! queries, capped traversal and three-level disclosure exports. Re-indexing
//! is incremental: only files whose content hash changed are reparsed.

pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod query;
pub mod store;

pub use config::{Config, IndexerConfig, StoreConfig};
pub use errors::{
    IndexingFileError, PtResult, QueryError, ResolutionTimeout, StoreCorruptionError, StoreError,
};
pub use indexer::pipeline::{BatchReport, IncrementalIndexer};
pub use indexer::resolution::{ResolutionContext, ResolvedLocation, SymbolResolver};
pub use models::{
    Confidence, Edge, EdgeKind, Entity, EntityKey, EntityKind, FileEvent, FileEventKind,
    IndexSnapshot, Provenance, Resolution, Span, Subgraph, Visibility,
};
pub use query::client::{QueryClient, QueryRequest, QueryResponse};
pub use query::disclosure::{Disclosure, DisclosureLevel};
pub use query::predicate::{PredicateSpec, QueryPredicate};
pub use query::traverse::Direction;
pub use store::{CancelToken, GraphStore};
