//! Row encoding for entities and edges.
//!
//! Entities are stored as a JSON payload plus a few indexed columns; edges
//! are fully columnar. Every row carries a CRC32 over its logical content so
//! that a torn or tampered row is detected on read.

use rusqlite::Row;

use crate::errors::{PtResult, StoreCorruptionError};
use crate::models::{Edge, EdgeKind, Entity, EntityKey, Provenance, Resolution};

pub const ENTITY_COLUMNS: &str = "key, payload, checksum";

pub const EDGE_COLUMNS: &str =
    "from_key, to_key, kind, from_file, resolution, target_name, provenance, checksum";

pub fn checksum(parts: &[&str]) -> i64 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    i64::from(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRow {
    pub key: String,
    pub payload: String,
    pub checksum: i64,
}

impl EntityRow {
    pub fn encode(entity: &Entity) -> PtResult<Self> {
        let key = entity.key.canonical();
        let payload = serde_json::to_string(entity)?;
        let checksum = checksum(&[&key, &payload]);
        Ok(Self {
            key,
            payload,
            checksum,
        })
    }

    /// Reads the [`ENTITY_COLUMNS`] projection.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            payload: row.get(1)?,
            checksum: row.get(2)?,
        })
    }

    pub fn decode(&self) -> Result<Entity, StoreCorruptionError> {
        let corrupt = |detail: String| StoreCorruptionError {
            table: "entities".to_string(),
            row: self.key.clone(),
            detail,
        };
        if checksum(&[&self.key, &self.payload]) != self.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        let entity: Entity =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?;
        if entity.key.canonical() != self.key {
            return Err(corrupt(format!(
                "payload key `{}` does not match row key",
                entity.key
            )));
        }
        Ok(entity)
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRow {
    pub from_key: String,
    pub to_key: String,
    pub kind: String,
    pub from_file: String,
    pub resolution: String,
    pub target_name: Option<String>,
    pub provenance: String,
    pub checksum: i64,
}

impl EdgeRow {
    pub fn encode(edge: &Edge) -> Self {
        let mut row = Self {
            from_key: edge.from.canonical(),
            to_key: edge.to.canonical(),
            kind: edge.kind.as_str().to_string(),
            from_file: edge.from.file_path.clone(),
            resolution: resolution_label(&edge.resolution).to_string(),
            target_name: edge.unresolved_name().map(str::to_string),
            provenance: edge.provenance.as_str().to_string(),
            checksum: 0,
        };
        row.checksum = row.compute_checksum();
        row
    }

    /// Reads the [`EDGE_COLUMNS`] projection.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            from_key: row.get(0)?,
            to_key: row.get(1)?,
            kind: row.get(2)?,
            from_file: row.get(3)?,
            resolution: row.get(4)?,
            target_name: row.get(5)?,
            provenance: row.get(6)?,
            checksum: row.get(7)?,
        })
    }

    pub fn compute_checksum(&self) -> i64 {
        checksum(&[
            &self.from_key,
            &self.to_key,
            &self.kind,
            &self.resolution,
            self.target_name.as_deref().unwrap_or(""),
            &self.provenance,
        ])
    }

    pub fn decode(&self) -> Result<Edge, StoreCorruptionError> {
        let corrupt = |detail: String| StoreCorruptionError {
            table: "edges".to_string(),
            row: format!("{} -[{}]-> {}", self.from_key, self.kind, self.to_key),
            detail,
        };
        if self.compute_checksum() != self.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        let from: EntityKey = self.from_key.parse().map_err(|e| corrupt(format!("{e}")))?;
        let to: EntityKey = self.to_key.parse().map_err(|e| corrupt(format!("{e}")))?;
        let kind = EdgeKind::parse(&self.kind)
            .ok_or_else(|| corrupt(format!("unknown edge kind `{}`", self.kind)))?;
        let provenance = Provenance::parse(&self.provenance)
            .ok_or_else(|| corrupt(format!("unknown provenance `{}`", self.provenance)))?;
        let resolution = match (self.resolution.as_str(), &self.target_name) {
            ("resolved", _) => Resolution::Resolved,
            ("unresolved", Some(name)) => Resolution::Unresolved {
                target_name: name.clone(),
            },
            (other, _) => return Err(corrupt(format!("bad resolution `{other}`"))),
        };
        Ok(Edge {
            from,
            to,
            kind,
            resolution,
            provenance,
        })
    }
}

pub fn resolution_label(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Resolved => "resolved",
        Resolution::Unresolved { .. } => "unresolved",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, EntityKind, Span, Visibility};

    fn entity() -> Entity {
        Entity {
            key: EntityKey::new("rust", "src/lib.rs", EntityKind::Function, "foo", None),
            name: "foo".to_string(),
            span: Span {
                start_line: 1,
                start_col: 0,
                end_line: 1,
                end_col: 12,
            },
            signature_text: Some("fn foo()".to_string()),
            body_hash: "ab".to_string(),
            visibility: Visibility::Private,
            is_test: false,
            confidence: Confidence::High,
            type_detail: None,
        }
    }

    #[test]
    fn test_entity_row_decodes() {
        let row = EntityRow::encode(&entity()).unwrap();
        assert_eq!(row.key, "rust|src/lib.rs|function|foo");
        assert_eq!(row.decode().unwrap(), entity());
    }

    #[test]
    fn test_tampered_entity_payload_is_corruption() {
        let mut row = EntityRow::encode(&entity()).unwrap();
        row.payload = row.payload.replace("fn foo()", "fn bar()");
        let err = row.decode().unwrap_err();
        assert_eq!(err.table, "entities");
        assert!(err.detail.contains("checksum"));
    }

    #[test]
    fn test_unresolved_edge_row_keeps_target_name() {
        let from = entity().key;
        let edge = Edge::unresolved(from, EdgeKind::Calls, "baz");
        let row = EdgeRow::encode(&edge);
        assert_eq!(row.resolution, "unresolved");
        assert_eq!(row.target_name.as_deref(), Some("baz"));
        assert_eq!(row.decode().unwrap(), edge);
    }

    #[test]
    fn test_tampered_edge_is_corruption() {
        let from = entity().key;
        let to = EntityKey::new("rust", "src/lib.rs", EntityKind::Function, "bar", None);
        let mut row = EdgeRow::encode(&Edge::resolved(from, to, EdgeKind::Calls, Provenance::Syntactic));
        row.provenance = "hydrated".to_string();
        assert!(row.decode().is_err());
    }
}
