#![allow(dead_code)]

use std::fs;
use std::path::Path;

use parseltongue_core::{
    Confidence, Entity, EntityKey, EntityKind, GraphStore, IndexerConfig, Span, StoreConfig,
    Visibility,
};
use tempfile::TempDir;

/// A scratch repository with its store under `.parseltongue/`.
pub struct Workspace {
    pub dir: TempDir,
    pub store: GraphStore,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(Self::db_path_in(dir.path()), StoreConfig::default()).unwrap();
        Self { dir, store }
    }

    pub fn db_path_in(root: &Path) -> std::path::PathBuf {
        root.join(".parseltongue").join("graph.db")
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) {
        write_file(self.root(), rel, content);
    }

    pub fn remove(&self, rel: &str) {
        fs::remove_file(self.root().join(rel)).unwrap();
    }
}

pub fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub fn indexer_config() -> IndexerConfig {
    IndexerConfig {
        workers: 2,
        ..IndexerConfig::default()
    }
}

pub fn rust_fn(file: &str, name: &str) -> EntityKey {
    EntityKey::new("rust", file, EntityKind::Function, name, None)
}

pub fn function(file: &str, name: &str) -> Entity {
    Entity {
        key: rust_fn(file, name),
        name: name.to_string(),
        span: Span {
            start_line: 1,
            start_col: 0,
            end_line: 1,
            end_col: 10,
        },
        signature_text: Some(format!("fn {name}()")),
        body_hash: format!("body-{name}"),
        visibility: Visibility::Private,
        is_test: false,
        confidence: Confidence::High,
        type_detail: None,
    }
}
