//! Criterion benchmarks for parseltongue-core.
//!
//! ## Benchmark groups
//!
//! 1. **parse**: tolerant parsing of well-formed and broken sources.
//! 2. **extract**: key assignment plus dependency extraction.
//! 3. **store**: batch apply, key lookup and pattern queries.
//! 4. **traverse**: capped BFS at several hop/cap settings.
//! 5. **indexing**: full and no-op incremental passes over a synthetic repo.
//!
//! ## Running
//!
//! ```sh
//! cargo bench -p parseltongue-core
//! # Run only the traversal group:
//! cargo bench -p parseltongue-core -- traverse
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use parseltongue_core::indexer::dependencies::extract_file;
use parseltongue_core::indexer::keys::assign_keys;
use parseltongue_core::indexer::languages::{PYTHON, RUST};
use parseltongue_core::indexer::parser::TolerantParser;
use parseltongue_core::models::Edge;
use parseltongue_core::store::FileUpdate;
use parseltongue_core::{
    CancelToken, Confidence, EdgeKind, Entity, EntityKey, EntityKind, GraphStore,
    IncrementalIndexer, IndexerConfig, Provenance, QueryPredicate, Span, StoreConfig, Visibility,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A Rust module with `n` functions, each calling the next two.
fn rust_module(n: usize) -> String {
    let mut src = String::from("use std::collections::HashMap;\n\npub struct Registry {\n    items: HashMap<String, u32>,\n}\n\nimpl Registry {\n    pub fn len(&self) -> usize { self.items.len() }\n}\n\n");
    for i in 0..n {
        src.push_str(&format!(
            "pub fn step_{i}(r: &Registry) -> usize {{\n    let x = r.len();\n    step_{}(r);\n    step_{}(r);\n    x\n}}\n\n",
            (i + 1) % n,
            (i + 2) % n
        ));
    }
    src
}

fn python_module(n: usize) -> String {
    let mut src = String::from("import os\n\nclass Worker:\n    def run(self):\n        return os.getcwd()\n\n");
    for i in 0..n {
        src.push_str(&format!(
            "def task_{i}():\n    Worker().run()\n    task_{}()\n\n",
            (i + 1) % n
        ));
    }
    src
}

fn entity(file: &str, name: &str, line: u32) -> Entity {
    Entity {
        key: EntityKey::new("rust", file, EntityKind::Function, name, None),
        name: name.to_string(),
        span: Span {
            start_line: line,
            start_col: 0,
            end_line: line + 4,
            end_col: 1,
        },
        signature_text: Some(format!("pub fn {name}(input: &str) -> Result<u32>")),
        body_hash: format!("{name}-body"),
        visibility: Visibility::Public,
        is_test: line % 7 == 0,
        confidence: Confidence::High,
        type_detail: None,
    }
}

/// `n_files` files of `per_file` functions; each function calls two others
/// in the same file and one in the next file.
fn synthetic_updates(n_files: usize, per_file: usize) -> Vec<FileUpdate> {
    let key = |f: usize, s: usize| {
        EntityKey::new(
            "rust",
            format!("src/mod_{f}.rs"),
            EntityKind::Function,
            format!("f{f}_{s}"),
            None,
        )
    };
    (0..n_files)
        .map(|f| {
            let path = format!("src/mod_{f}.rs");
            let entities = (0..per_file)
                .map(|s| entity(&path, &format!("f{f}_{s}"), (s * 5 + 1) as u32))
                .collect();
            let mut edges = Vec::new();
            for s in 0..per_file {
                for t in [(s + 1) % per_file, (s + 3) % per_file] {
                    edges.push(Edge::resolved(
                        key(f, s),
                        key(f, t),
                        EdgeKind::Calls,
                        Provenance::Syntactic,
                    ));
                }
                edges.push(Edge::resolved(
                    key(f, s),
                    key((f + 1) % n_files, s),
                    EdgeKind::Calls,
                    Provenance::Syntactic,
                ));
            }
            FileUpdate::Replace {
                path,
                language: "rust".to_string(),
                content_hash: format!("hash-{f}"),
                entities,
                edges,
            }
        })
        .collect()
}

fn populated_store(n_files: usize, per_file: usize) -> (TempDir, GraphStore) {
    let dir = TempDir::new().unwrap();
    let store = GraphStore::open(dir.path().join("graph.db"), StoreConfig::default()).unwrap();
    store
        .apply_updates(synthetic_updates(n_files, per_file), &CancelToken::new())
        .unwrap();
    (dir, store)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for &n in &[10usize, 100, 500] {
        let rust = rust_module(n);
        group.bench_with_input(BenchmarkId::new("rust", n), &rust, |b, src| {
            let parser = TolerantParser::new(&RUST);
            b.iter(|| black_box(parser.parse(black_box(src.as_bytes()))));
        });
        let python = python_module(n);
        group.bench_with_input(BenchmarkId::new("python", n), &python, |b, src| {
            let parser = TolerantParser::new(&PYTHON);
            b.iter(|| black_box(parser.parse(black_box(src.as_bytes()))));
        });
    }

    // Every function loses its closing brace.
    let broken = rust_module(100).replace("    x\n}", "    x\n");
    group.bench_function("rust_broken/100", |b| {
        let parser = TolerantParser::new(&RUST);
        b.iter(|| black_box(parser.parse(black_box(broken.as_bytes()))));
    });
    group.finish();
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract");
    for &n in &[10usize, 100, 500] {
        let parsed = TolerantParser::new(&RUST).parse(rust_module(n).as_bytes());
        group.bench_with_input(BenchmarkId::new("keys_and_edges", n), &parsed, |b, parsed| {
            b.iter(|| {
                let keys = assign_keys(&parsed.entities, "rust", "src/lib.rs");
                black_box(extract_file(parsed, &keys))
            });
        });
    }
    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    group.sample_size(20);

    group.bench_function("apply_updates/20x50", |b| {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path().join("graph.db"), StoreConfig::default()).unwrap();
        let cancel = CancelToken::new();
        b.iter(|| {
            store
                .apply_updates(black_box(synthetic_updates(20, 50)), &cancel)
                .unwrap()
        });
    });

    let (_dir, store) = populated_store(40, 50);
    let key = EntityKey::new("rust", "src/mod_7.rs", EntityKind::Function, "f7_13", None);
    group.bench_function("get_by_key", |b| {
        b.iter(|| black_box(store.get_by_key(black_box(&key)).unwrap()))
    });

    let contains = vec![QueryPredicate::name_contains("_13").unwrap()];
    group.bench_function("pattern/contains", |b| {
        b.iter(|| black_box(store.query_by_field_pattern(&contains).unwrap()))
    });

    let regex = vec![
        QueryPredicate::signature_matches(r"->\s*Result<u32>").unwrap(),
        QueryPredicate::IsTest(false),
    ];
    group.bench_function("pattern/regex_signature", |b| {
        b.iter(|| black_box(store.query_by_field_pattern(&regex).unwrap()))
    });
    group.finish();
}

fn bench_traverse(c: &mut Criterion) {
    let mut group = c.benchmark_group("traverse");
    let (_dir, store) = populated_store(40, 50);
    let seed = vec![EntityKey::new(
        "rust",
        "src/mod_0.rs",
        EntityKind::Function,
        "f0_0",
        None,
    )];
    for &(hops, cap) in &[(2u32, 1u32), (4, 10), (8, 50)] {
        group.bench_with_input(
            BenchmarkId::new("hops_cap", format!("{hops}x{cap}")),
            &(hops, cap),
            |b, &(hops, cap)| {
                b.iter(|| black_box(store.traverse(&seed, &[EdgeKind::Calls], hops, cap).unwrap()))
            },
        );
    }
    group.finish();
}

fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexing");
    group.sample_size(10);

    let repo = TempDir::new().unwrap();
    for f in 0..30 {
        let path = repo.path().join(format!("src/mod_{f}.rs"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, rust_module(40)).unwrap();
    }
    let config = IndexerConfig::default();

    group.bench_function("full/30_files", |b| {
        b.iter(|| {
            let db = TempDir::new().unwrap();
            let store = GraphStore::open(db.path().join("graph.db"), StoreConfig::default()).unwrap();
            let indexer = IncrementalIndexer::new(repo.path(), &store, config.clone());
            black_box(indexer.index_repository(&CancelToken::new()).unwrap())
        });
    });

    let db = TempDir::new().unwrap();
    let store = GraphStore::open(db.path().join("graph.db"), StoreConfig::default()).unwrap();
    let indexer = IncrementalIndexer::new(repo.path(), &store, config.clone());
    indexer.index_repository(&CancelToken::new()).unwrap();
    group.bench_function("noop/30_files", |b| {
        b.iter(|| black_box(indexer.index_repository(&CancelToken::new()).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_extract,
    bench_store,
    bench_traverse,
    bench_indexing,
);
criterion_main!(benches);
