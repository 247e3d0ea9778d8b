//! Entity key construction.
//!
//! Keys are a pure function of language, file path, kind and qualified name.
//! Definitions that collide on `(kind, qualified_name)` within one file each
//! get their 0-based occurrence index in source order as a disambiguator, so
//! a lone definition keeps a bare key however often the file is re-indexed.

use indexmap::IndexMap;

use crate::indexer::parser::{ParsedFile, RawEntity};
use crate::models::{Entity, EntityKey, EntityKind};

/// Key for a single entity, without collision handling.
pub fn build_key(raw: &RawEntity, language: &str, file_path: &str) -> EntityKey {
    EntityKey::new(
        language,
        file_path,
        raw.kind.clone(),
        raw.qualified_name.clone(),
        None,
    )
}

/// Keys for every entity of a file, parallel to `raws`.
pub fn assign_keys(raws: &[RawEntity], language: &str, file_path: &str) -> Vec<EntityKey> {
    let mut occurrences: IndexMap<(&EntityKind, &str), Vec<usize>> = IndexMap::new();
    for (idx, raw) in raws.iter().enumerate() {
        occurrences
            .entry((&raw.kind, raw.qualified_name.as_str()))
            .or_default()
            .push(idx);
    }

    let mut keys: Vec<EntityKey> = raws
        .iter()
        .map(|raw| build_key(raw, language, file_path))
        .collect();
    for indices in occurrences.values() {
        if indices.len() < 2 {
            continue;
        }
        for (occurrence, &idx) in indices.iter().enumerate() {
            keys[idx].disambiguator = Some(occurrence as u32);
        }
    }
    keys
}

/// Turn a parsed file into stored entities, parallel to `parsed.entities`.
pub fn materialize(parsed: &ParsedFile, file_path: &str) -> Vec<Entity> {
    let keys = assign_keys(&parsed.entities, &parsed.language, file_path);
    parsed
        .entities
        .iter()
        .zip(keys)
        .map(|(raw, key)| Entity {
            key,
            name: raw.name.clone(),
            span: raw.span,
            signature_text: raw.signature_text.clone(),
            body_hash: raw.body_hash.clone(),
            visibility: raw.visibility,
            is_test: raw.is_test,
            confidence: raw.confidence,
            type_detail: raw.type_detail.clone(),
        })
        .collect()
}
