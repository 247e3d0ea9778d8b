//! Three-level projection of the graph for size-constrained consumers.
//!
//! Level 0 carries edge triples only, level 1 adds entity signatures, level 2
//! adds extended type detail and each entity's edges with their resolution
//! state. Every level is scoped by the same predicate list and optionally by
//! a [`Subgraph`] previously returned from a traversal; the exporter itself
//! never walks the graph.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::QueryError;
use crate::models::{
    Confidence, Edge, EdgeKind, Entity, EntityKey, EntityKind, Provenance, Resolution, Span,
    Subgraph, TypeDetail, Visibility,
};
use crate::query::predicate::QueryPredicate;
use crate::store::GraphStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisclosureLevel {
    Edges,
    Signatures,
    Full,
}

impl DisclosureLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(DisclosureLevel::Edges),
            1 => Some(DisclosureLevel::Signatures),
            2 => Some(DisclosureLevel::Full),
            _ => None,
        }
    }

    pub fn as_level(&self) -> u8 {
        match self {
            DisclosureLevel::Edges => 0,
            DisclosureLevel::Signatures => 1,
            DisclosureLevel::Full => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeTriple {
    pub from: EntityKey,
    pub to: EntityKey,
    pub kind: EdgeKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureView {
    pub key: EntityKey,
    pub kind: EntityKind,
    pub qualified_name: String,
    pub signature_text: Option<String>,
    pub visibility: Visibility,
    pub is_test: bool,
    pub file_path: String,
    pub confidence: Confidence,
}

impl SignatureView {
    fn of(entity: &Entity) -> Self {
        Self {
            key: entity.key.clone(),
            kind: entity.kind().clone(),
            qualified_name: entity.qualified_name().to_string(),
            signature_text: entity.signature_text.clone(),
            visibility: entity.visibility,
            is_test: entity.is_test,
            file_path: entity.file_path().to_string(),
            confidence: entity.confidence,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDetail {
    pub to: EntityKey,
    pub kind: EdgeKind,
    pub resolution: Resolution,
    pub provenance: Provenance,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDetail {
    #[serde(flatten)]
    pub signature: SignatureView,
    pub span: Span,
    pub type_detail: Option<TypeDetail>,
    pub edges: Vec<EdgeDetail>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum Disclosure {
    Edges { edges: Vec<EdgeTriple> },
    Signatures { entities: Vec<SignatureView> },
    Full { entities: Vec<EntityDetail> },
}

impl Disclosure {
    pub fn level(&self) -> DisclosureLevel {
        match self {
            Disclosure::Edges { .. } => DisclosureLevel::Edges,
            Disclosure::Signatures { .. } => DisclosureLevel::Signatures,
            Disclosure::Full { .. } => DisclosureLevel::Full,
        }
    }

    pub fn to_json(&self) -> Result<String, QueryError> {
        serde_json::to_string(self).map_err(|e| QueryError::Storage(e.to_string()))
    }
}

/// Project already-selected entities and their edges.
///
/// `entities` must be sorted by key; `edges` may hold edges of unselected
/// entities, which are dropped. With a `scope`, only entities in the
/// subgraph survive, and at level 0 only the subgraph's own edges.
pub fn project(
    level: DisclosureLevel,
    entities: &[Entity],
    edges: &[Edge],
    scope: Option<&Subgraph>,
) -> Disclosure {
    let selected: Vec<&Entity> = entities
        .iter()
        .filter(|e| scope.map_or(true, |sub| sub.contains(&e.key)))
        .collect();
    let owners: BTreeSet<&EntityKey> = selected.iter().map(|e| &e.key).collect();
    let mut owned: Vec<&Edge> = match scope {
        Some(sub) => sub
            .edges
            .iter()
            .filter(|e| owners.contains(&e.from))
            .collect(),
        None => edges.iter().filter(|e| owners.contains(&e.from)).collect(),
    };
    owned.sort();
    owned.dedup();

    match level {
        DisclosureLevel::Edges => Disclosure::Edges {
            edges: owned
                .into_iter()
                .map(|e| EdgeTriple {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    kind: e.kind,
                })
                .collect(),
        },
        DisclosureLevel::Signatures => Disclosure::Signatures {
            entities: selected.into_iter().map(SignatureView::of).collect(),
        },
        DisclosureLevel::Full => {
            // Level 2 lists every owned edge, resolved or not, even when
            // scoped by a subgraph.
            let all: Vec<&Edge> = edges.iter().filter(|e| owners.contains(&e.from)).collect();
            Disclosure::Full {
                entities: selected
                    .into_iter()
                    .map(|entity| EntityDetail {
                        signature: SignatureView::of(entity),
                        span: entity.span,
                        type_detail: entity.type_detail.clone(),
                        edges: edge_details(&entity.key, &all),
                    })
                    .collect(),
            }
        }
    }
}

fn edge_details(owner: &EntityKey, edges: &[&Edge]) -> Vec<EdgeDetail> {
    let mut out: Vec<&Edge> = edges.iter().copied().filter(|e| e.from == *owner).collect();
    out.sort();
    out.dedup();
    out.into_iter()
        .map(|e| EdgeDetail {
            to: e.to.clone(),
            kind: e.kind,
            resolution: e.resolution.clone(),
            provenance: e.provenance,
        })
        .collect()
}

/// Read the selection from `store` in one snapshot and project it.
pub fn export(
    store: &GraphStore,
    level: DisclosureLevel,
    predicates: &[QueryPredicate],
    scope: Option<&Subgraph>,
) -> Result<Disclosure, QueryError> {
    let (entities, edges) = store.select_with_edges(predicates)?;
    Ok(project(level, &entities, &edges, scope))
}
