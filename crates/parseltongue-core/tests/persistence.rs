mod common;

use std::sync::atomic::{AtomicBool, Ordering};

use common::{function, indexer_config, rust_fn, Workspace};
use parseltongue_core::models::Edge;
use parseltongue_core::store::FileUpdate;
use parseltongue_core::{
    CancelToken, EdgeKind, GraphStore, IncrementalIndexer, Provenance, QueryPredicate,
    StoreConfig,
};

const REPO: &[(&str, &str)] = &[
    (
        "src/net.rs",
        "pub struct Conn;\nimpl Conn {\n    pub fn open() -> Conn { dial(); Conn }\n}\nfn dial() {}\n",
    ),
    (
        "src/app.rs",
        "pub fn run() { start(); }\nfn start() { dial(); }\n#[test]\nfn run_works() { run(); }\n",
    ),
    (
        "tools/cli.py",
        "import os\n\ndef main():\n    helper()\n\ndef helper():\n    return os.getcwd()\n",
    ),
];

fn indexed_workspace() -> Workspace {
    let ws = Workspace::new();
    for (path, content) in REPO {
        ws.write(path, content);
    }
    IncrementalIndexer::new(ws.root(), &ws.store, indexer_config())
        .index_repository(&CancelToken::new())
        .unwrap();
    ws
}

#[test]
fn test_query_results_survive_reopen() {
    let ws = indexed_workspace();
    let predicates = vec![
        QueryPredicate::name_matches("^(run|start|dial)$").unwrap(),
        QueryPredicate::IsTest(false),
    ];
    let seeds = vec![rust_fn("src/app.rs", "run")];

    let entities_before = ws.store.query_by_field_pattern(&predicates).unwrap();
    let walk_before = ws.store.traverse(&seeds, &[], 4, 10).unwrap();
    let snapshot_before = ws.store.snapshot().unwrap();
    assert_eq!(entities_before.len(), 3);
    assert!(walk_before.contains(&rust_fn("src/net.rs", "dial")));

    let db_path = ws.store.db_path().to_path_buf();
    drop(ws.store);

    let reopened = GraphStore::open(&db_path, StoreConfig::default()).unwrap();
    assert!(!reopened.is_corrupted());
    assert_eq!(
        reopened.query_by_field_pattern(&predicates).unwrap(),
        entities_before
    );
    assert_eq!(reopened.traverse(&seeds, &[], 4, 10).unwrap(), walk_before);
    assert_eq!(reopened.snapshot().unwrap(), snapshot_before);
}

#[test]
fn test_delete_cascade_leaves_no_trace_of_file() {
    let ws = indexed_workspace();
    let doomed = "src/net.rs";
    let doomed_keys: Vec<_> = ws
        .store
        .entities_for_file(doomed)
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert!(!doomed_keys.is_empty());

    let removed = ws.store.delete_entities_for_file(doomed).unwrap();
    assert_eq!(removed, doomed_keys.len());

    let in_file = QueryPredicate::in_file(doomed).unwrap();
    assert!(ws.store.query_by_field_pattern(&[in_file]).unwrap().is_empty());
    for key in &doomed_keys {
        assert!(ws.store.get_by_key(key).unwrap().is_none());
    }

    let edges = ws.store.all_edges().unwrap();
    assert!(edges.iter().all(|e| !doomed_keys.contains(&e.from)));

    // start() -> dial() crossed files; it must still exist, now dangling.
    let start_edges = ws.store.edges_from(&rust_fn("src/app.rs", "start")).unwrap();
    assert_eq!(start_edges.len(), 1);
    assert_eq!(start_edges[0].unresolved_name(), Some("dial"));
    assert!(!ws.store.file_hashes().unwrap().contains_key(doomed));
}

#[test]
fn test_readers_never_observe_partial_batches() {
    let ws = Workspace::new();
    let file = "src/flip.rs";
    let version = |prefix: &str, count: usize| FileUpdate::Replace {
        path: file.to_string(),
        language: "rust".to_string(),
        content_hash: format!("{prefix}{count}"),
        entities: (0..count)
            .map(|i| function(file, &format!("{prefix}{i}")))
            .collect(),
        edges: (1..count)
            .map(|i| {
                Edge::resolved(
                    rust_fn(file, &format!("{prefix}0")),
                    rust_fn(file, &format!("{prefix}{i}")),
                    EdgeKind::Calls,
                    Provenance::Syntactic,
                )
            })
            .collect(),
    };
    let cancel = CancelToken::new();
    ws.store.apply_updates(vec![version("a", 5)], &cancel).unwrap();

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let store = &ws.store;
        let done = &done;
        for _ in 0..4 {
            scope.spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    let entities = store.entities_for_file(file).unwrap();
                    let prefixes: std::collections::BTreeSet<char> = entities
                        .iter()
                        .filter_map(|e| e.name.chars().next())
                        .collect();
                    assert_eq!(prefixes.len(), 1, "mixed versions visible");
                    let expected = if prefixes.contains(&'a') { 5 } else { 3 };
                    assert_eq!(entities.len(), expected);
                }
            });
        }
        for round in 0..30 {
            let update = if round % 2 == 0 {
                version("b", 3)
            } else {
                version("a", 5)
            };
            store.apply_updates(vec![update], &cancel).unwrap();
        }
        done.store(true, Ordering::SeqCst);
    });
}

#[test]
fn test_corrupted_store_refuses_queries_until_rebuilt() {
    let ws = Workspace::new();
    ws.store.upsert_entities(&[function("src/a.rs", "a")]).unwrap();
    let db_path = ws.store.db_path().to_path_buf();
    drop(ws.store);

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute("UPDATE entities SET checksum = checksum + 1;", [])
        .unwrap();
    drop(conn);

    let store = GraphStore::open(&db_path, StoreConfig::default()).unwrap();
    assert!(store.is_corrupted());
    let err = store.get_by_key(&rust_fn("src/a.rs", "a")).unwrap_err();
    assert!(matches!(err, parseltongue_core::QueryError::Corrupted(_)));

    store.rebuild().unwrap();
    assert!(!store.is_corrupted());
    assert!(store.get_by_key(&rust_fn("src/a.rs", "a")).unwrap().is_none());
}
