//! Dependency extraction from parsed entities.
//!
//! Turns the syntactic references recorded by the parser into [`RawEdge`]s.
//! Containment and references that name exactly one definition in the same
//! file are bound here; everything else is left to the resolution pass.

use std::collections::{BTreeMap, BTreeSet};

use crate::indexer::parser::{ParsedFile, RawEntity};
use crate::models::{EdgeKind, EntityKey, EntityKind};

/// An edge before global resolution.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawEdge {
    pub from: EntityKey,
    pub kind: EdgeKind,
    pub target_name: String,
    /// Target bound inside the file, if any.
    pub local_target: Option<EntityKey>,
    /// How many local definitions matched `target_name`. Zero means the
    /// reference was not bound locally.
    pub candidates: usize,
    pub line: u32,
}

impl RawEdge {
    pub fn is_locally_resolved(&self) -> bool {
        self.local_target.is_some() && self.candidates == 1
    }
}

/// Per-file lookup tables over the file's own definitions and imports.
pub struct LocalIndex {
    separator: &'static str,
    keys: Vec<EntityKey>,
    by_qualified: BTreeMap<String, Vec<usize>>,
    by_short: BTreeMap<String, Vec<usize>>,
    /// Imported local name -> imported path.
    imports: BTreeMap<String, String>,
}

impl LocalIndex {
    pub fn build(parsed: &ParsedFile, keys: &[EntityKey]) -> Self {
        let separator = if parsed.language == "rust" { "::" } else { "." };
        let mut by_qualified: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut by_short: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, key) in keys.iter().enumerate() {
            by_qualified
                .entry(key.qualified_name.clone())
                .or_default()
                .push(idx);
            by_short
                .entry(key.short_name().to_string())
                .or_default()
                .push(idx);
        }
        let mut imports = BTreeMap::new();
        for import in &parsed.imports {
            imports
                .entry(import.local_name.clone())
                .or_insert_with(|| import.path.clone());
        }
        Self {
            separator,
            keys: keys.to_vec(),
            by_qualified,
            by_short,
            imports,
        }
    }

    pub fn key(&self, idx: usize) -> Option<&EntityKey> {
        self.keys.get(idx)
    }

    /// Definitions named `name` that can be the target of `edge_kind`.
    ///
    /// Exact qualified-name matches win over short-name matches.
    pub fn lookup(&self, name: &str, edge_kind: EdgeKind) -> Vec<&EntityKey> {
        let pick = |indices: Option<&Vec<usize>>| -> Vec<&EntityKey> {
            let mut found: Vec<&EntityKey> = indices
                .into_iter()
                .flatten()
                .filter_map(|&i| self.keys.get(i))
                .filter(|k| edge_kind.accepts_target(&k.kind))
                .collect();
            found.sort();
            found.dedup();
            found
        };
        let exact = pick(self.by_qualified.get(name));
        if !exact.is_empty() {
            return exact;
        }
        if name.contains(self.separator) {
            return Vec::new();
        }
        pick(self.by_short.get(name))
    }

    /// Rewrite a reference through the file's imports, if its first
    /// segment names an imported item.
    pub fn through_imports(&self, name: &str) -> Option<String> {
        let (head, tail) = match name.split_once(self.separator) {
            Some((head, tail)) => (head, Some(tail)),
            None => (name, None),
        };
        let path = self.imports.get(head)?;
        Some(match tail {
            Some(tail) => format!("{path}{}{tail}", self.separator),
            None => path.clone(),
        })
    }

    /// The local type an impl block or method belongs to.
    fn owner_type(&self, owner: &str) -> Option<&EntityKey> {
        self.by_qualified
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|&i| self.keys.get(i))
            .filter(|k| k.kind.is_type_like())
            .min()
    }
}

/// Edges originating at one entity.
pub fn extract(entity: &RawEntity, from: &EntityKey, index: &LocalIndex) -> Vec<RawEdge> {
    let mut edges: BTreeSet<RawEdge> = BTreeSet::new();

    let container = match (&entity.kind, &entity.owner) {
        (EntityKind::Method, Some(owner)) => index
            .owner_type(owner)
            .or_else(|| entity.parent.and_then(|p| index.key(p))),
        _ => entity.parent.and_then(|p| index.key(p)),
    };
    if let Some(target) = container {
        edges.insert(RawEdge {
            from: from.clone(),
            kind: EdgeKind::ContainedIn,
            target_name: target.qualified_name.clone(),
            local_target: Some(target.clone()),
            candidates: 1,
            line: entity.span.start_line,
        });
    }

    for reference in &entity.references {
        let imported = if reference.kind == EdgeKind::DependsOn {
            None
        } else {
            index.through_imports(&reference.name)
        };
        let (target_name, local) = match imported {
            Some(path) => (path, Vec::new()),
            None => {
                let local = index.lookup(&reference.name, reference.kind);
                (reference.name.clone(), local)
            }
        };
        if local.is_empty() {
            edges.insert(RawEdge {
                from: from.clone(),
                kind: reference.kind,
                target_name,
                local_target: None,
                candidates: 0,
                line: reference.line,
            });
            continue;
        }
        let count = local.len();
        for target in local {
            edges.insert(RawEdge {
                from: from.clone(),
                kind: reference.kind,
                target_name: target_name.clone(),
                local_target: Some(target.clone()),
                candidates: count,
                line: reference.line,
            });
        }
    }

    dedup_by_target(edges)
}

/// Edges for every entity of a parsed file. `keys` is parallel to
/// `parsed.entities`.
pub fn extract_file(parsed: &ParsedFile, keys: &[EntityKey]) -> Vec<RawEdge> {
    let index = LocalIndex::build(parsed, keys);
    let mut edges: Vec<RawEdge> = parsed
        .entities
        .iter()
        .zip(keys)
        .flat_map(|(entity, key)| extract(entity, key, &index))
        .collect();
    edges.sort();
    edges
}

/// Keep one edge per `(kind, target_name, local_target)`, at its first line.
fn dedup_by_target(edges: BTreeSet<RawEdge>) -> Vec<RawEdge> {
    let mut seen: BTreeSet<(EdgeKind, String, Option<EntityKey>)> = BTreeSet::new();
    let mut by_line: Vec<RawEdge> = edges.into_iter().collect();
    by_line.sort_by(|a, b| a.line.cmp(&b.line).then_with(|| a.cmp(b)));
    let mut out: Vec<RawEdge> = by_line
        .into_iter()
        .filter(|e| seen.insert((e.kind, e.target_name.clone(), e.local_target.clone())))
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::keys::assign_keys;
    use crate::indexer::languages::RUST;
    use crate::indexer::parser::TolerantParser;

    fn edges_for(src: &str) -> (ParsedFile, Vec<EntityKey>, Vec<RawEdge>) {
        let parsed = TolerantParser::new(&RUST).parse(src.as_bytes());
        let keys = assign_keys(&parsed.entities, "rust", "src/lib.rs");
        let edges = extract_file(&parsed, &keys);
        (parsed, keys, edges)
    }

    #[test]
    fn test_local_call_is_bound() {
        let (_, keys, edges) = edges_for("fn foo() { bar(); }\nfn bar() {}\n");
        let calls: Vec<&RawEdge> = edges.iter().filter(|e| e.kind == EdgeKind::Calls).collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].from, keys[0]);
        assert_eq!(calls[0].local_target.as_ref(), Some(&keys[1]));
        assert!(calls[0].is_locally_resolved());
    }

    #[test]
    fn test_unknown_call_is_left_unbound() {
        let (_, _, edges) = edges_for("fn foo() { baz(); }\n");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_name, "baz");
        assert_eq!(edges[0].local_target, None);
        assert_eq!(edges[0].candidates, 0);
    }

    #[test]
    fn test_method_is_contained_in_struct() {
        let src = "struct Foo;\nimpl Foo { fn go(&self) { self.stop(); } fn stop(&self) {} }\n";
        let (_, keys, edges) = edges_for(src);
        let foo = keys.iter().find(|k| k.qualified_name == "Foo").unwrap();
        let go = keys.iter().find(|k| k.qualified_name == "Foo::go").unwrap();
        assert!(edges.iter().any(|e| e.kind == EdgeKind::ContainedIn
            && &e.from == go
            && e.local_target.as_ref() == Some(foo)));
        assert!(edges.iter().any(|e| e.kind == EdgeKind::Calls
            && &e.from == go
            && e.local_target.as_ref().map(|k| k.qualified_name.as_str()) == Some("Foo::stop")));
    }

    #[test]
    fn test_method_without_local_type_is_contained_in_impl() {
        let (_, keys, edges) = edges_for("impl Remote { fn go(&self) {} }\n");
        let imp = keys.iter().find(|k| k.kind == EntityKind::ImplBlock).unwrap();
        assert!(edges
            .iter()
            .any(|e| e.kind == EdgeKind::ContainedIn && e.local_target.as_ref() == Some(imp)));
    }

    #[test]
    fn test_module_items_are_contained_in_module() {
        let (_, keys, edges) = edges_for("mod inner { pub fn f() {} }\n");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, EdgeKind::ContainedIn);
        assert_eq!(edges[0].from, keys[1]);
        assert_eq!(edges[0].local_target.as_ref(), Some(&keys[0]));
    }

    #[test]
    fn test_ambiguous_local_name_yields_one_edge_per_candidate() {
        let src = "struct A;\nimpl A { fn run(&self) {} }\nstruct B;\nimpl B { fn run(&self) {} }\nfn go(x: A) { x.run(); }\n";
        let (_, _, edges) = edges_for(src);
        let calls: Vec<&RawEdge> = edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Calls && e.target_name == "run")
            .collect();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|e| e.candidates == 2));
        assert!(calls.iter().all(|e| !e.is_locally_resolved()));
    }

    #[test]
    fn test_imports_rewrite_targets() {
        let src = "use crate::util::helper;\nfn go() { helper(); }\n";
        let (_, _, edges) = edges_for(src);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_name, "util::helper");
        assert_eq!(edges[0].local_target, None);
    }

    #[test]
    fn test_trait_impl_is_bound_locally() {
        let src = "trait Run { fn run(&self); }\nstruct S;\nimpl Run for S { fn run(&self) {} }\n";
        let (_, keys, edges) = edges_for(src);
        let tr = keys.iter().find(|k| k.kind == EntityKind::Trait).unwrap();
        let imp = keys.iter().find(|k| k.kind == EntityKind::ImplBlock).unwrap();
        assert!(edges.iter().any(|e| e.kind == EdgeKind::Implements
            && &e.from == imp
            && e.local_target.as_ref() == Some(tr)));
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let src = "fn a() { b(); b(); c(); }\nfn b() {}\n";
        let (_, _, first) = edges_for(src);
        let (_, _, second) = edges_for(src);
        assert_eq!(first, second);
        let b_calls = first
            .iter()
            .filter(|e| e.kind == EdgeKind::Calls && e.target_name == "b")
            .count();
        assert_eq!(b_calls, 1);
    }
}
