//! Structured query surface over a [`GraphStore`].
//!
//! Requests and responses are plain serde types so a host can speak JSON
//! (or anything serde supports) without touching the store API.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::errors::QueryError;
use crate::models::{EdgeKind, Entity, EntityKey, Subgraph};
use crate::query::disclosure::{export, Disclosure, DisclosureLevel};
use crate::query::guards::{clamp_limit, MAX_QUERY_RESULTS};
use crate::query::predicate::{compile_all, PredicateSpec};
use crate::query::traverse::Direction;
use crate::store::GraphStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraverseSpec {
    pub seeds: Vec<EntityKey>,
    /// Empty follows every edge kind.
    #[serde(default)]
    pub edge_kinds: Vec<EdgeKind>,
    pub max_hops: u32,
    pub cap_per_hop: u32,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueryRequest {
    Lookup {
        key: EntityKey,
    },
    PatternQuery {
        predicates: Vec<PredicateSpec>,
        #[serde(default)]
        limit: Option<i64>,
    },
    Traverse(TraverseSpec),
    Export {
        level: u8,
        #[serde(default)]
        predicates: Vec<PredicateSpec>,
        /// Traversal whose subgraph scopes the export.
        #[serde(default)]
        scope: Option<TraverseSpec>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryResponse {
    Entity {
        entity: Entity,
    },
    Entities {
        entities: Vec<Entity>,
        /// More entities matched than `limit` allowed.
        truncated: bool,
    },
    Subgraph {
        subgraph: Subgraph,
    },
    Disclosure {
        disclosure: Disclosure,
    },
}

pub struct QueryClient<'a> {
    store: &'a GraphStore,
}

impl<'a> QueryClient<'a> {
    pub fn new(store: &'a GraphStore) -> Self {
        Self { store }
    }

    pub fn execute(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        match request {
            QueryRequest::Lookup { key } => match self.store.get_by_key(key)? {
                Some(entity) => Ok(QueryResponse::Entity { entity }),
                None => Err(QueryError::NotFound(key.canonical())),
            },
            QueryRequest::PatternQuery { predicates, limit } => {
                let predicates = compile_all(predicates)?;
                let limit = clamp_limit(limit.unwrap_or(MAX_QUERY_RESULTS), MAX_QUERY_RESULTS);
                let mut entities = self.store.query_by_field_pattern(&predicates)?;
                let truncated = entities.len() as i64 > limit;
                entities.truncate(limit as usize);
                Ok(QueryResponse::Entities {
                    entities,
                    truncated,
                })
            }
            QueryRequest::Traverse(spec) => Ok(QueryResponse::Subgraph {
                subgraph: self.traverse(spec)?,
            }),
            QueryRequest::Export {
                level,
                predicates,
                scope,
            } => {
                let level = DisclosureLevel::from_level(*level).ok_or_else(|| {
                    QueryError::InvalidRequest(format!("disclosure level {level} is not 0, 1 or 2"))
                })?;
                let predicates = compile_all(predicates)?;
                let scope = scope.as_ref().map(|spec| self.traverse(spec)).transpose()?;
                Ok(QueryResponse::Disclosure {
                    disclosure: export(self.store, level, &predicates, scope.as_ref())?,
                })
            }
        }
    }

    fn traverse(&self, spec: &TraverseSpec) -> Result<Subgraph, QueryError> {
        if spec.seeds.is_empty() {
            return Err(QueryError::InvalidRequest(
                "traverse needs at least one seed".to_string(),
            ));
        }
        self.store.traverse_directed(
            &spec.seeds,
            &spec.edge_kinds,
            spec.max_hops,
            spec.cap_per_hop,
            spec.direction,
        )
    }

    /// Decode a JSON request, run it, and encode the outcome as
    /// `{"ok": true, "result": ...}` or `{"ok": false, "error": {...}}`.
    pub fn execute_json(&self, request: &str) -> String {
        let outcome = serde_json::from_str::<QueryRequest>(request)
            .map_err(|e| QueryError::InvalidRequest(e.to_string()))
            .and_then(|req| self.execute(&req));
        let envelope = match outcome {
            Ok(response) => json!({ "ok": true, "result": response }),
            Err(err) => {
                debug!("query failed: {err}");
                json!({
                    "ok": false,
                    "error": { "code": err.code(), "message": err.to_string() },
                })
            }
        };
        envelope.to_string()
    }
}
