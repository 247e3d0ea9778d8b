mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{indexer_config, rust_fn, Workspace};
use parseltongue_core::{
    CancelToken, IncrementalIndexer, IndexerConfig, Provenance, ResolutionContext,
    ResolvedLocation, Span, SymbolResolver,
};

/// Answers every query with a fixed definition site.
struct FixedResolver {
    file_path: String,
    line: u32,
    delay: Option<Duration>,
}

impl SymbolResolver for FixedResolver {
    fn resolve(&self, _hint: &str, context: &ResolutionContext) -> Option<ResolvedLocation> {
        assert_eq!(context.language, "rust");
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Some(ResolvedLocation {
            file_path: self.file_path.clone(),
            span: Span {
                start_line: self.line,
                start_col: 0,
                end_line: self.line,
                end_col: 0,
            },
        })
    }
}

fn ambiguous_workspace() -> Workspace {
    let ws = Workspace::new();
    ws.write("src/a.rs", "pub fn helper() {}\n");
    ws.write("src/b.rs", "// b\npub fn helper() {}\n");
    ws.write("src/main.rs", "fn main() { helper(); }\n");
    ws
}

#[test]
fn test_ambiguous_reference_stays_unresolved_without_resolver() {
    let ws = ambiguous_workspace();
    let report = IncrementalIndexer::new(ws.root(), &ws.store, indexer_config())
        .index_repository(&CancelToken::new())
        .unwrap();
    assert_eq!(report.resolution.unresolved, 1);
    let edges = ws.store.edges_from(&rust_fn("src/main.rs", "main")).unwrap();
    assert_eq!(edges[0].unresolved_name(), Some("helper"));
}

#[test]
fn test_resolver_answer_hydrates_edge() {
    let ws = ambiguous_workspace();
    let resolver = Arc::new(FixedResolver {
        file_path: "src/b.rs".to_string(),
        line: 2,
        delay: None,
    });
    let report = IncrementalIndexer::new(ws.root(), &ws.store, indexer_config())
        .with_resolver(resolver)
        .index_repository(&CancelToken::new())
        .unwrap();
    assert_eq!(report.resolution.hydrated, 1);

    let edges = ws.store.edges_from(&rust_fn("src/main.rs", "main")).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].to, rust_fn("src/b.rs", "helper"));
    assert_eq!(edges[0].provenance, Provenance::Hydrated);
}

#[test]
fn test_slow_resolver_times_out_to_unresolved() {
    let ws = ambiguous_workspace();
    let resolver = Arc::new(FixedResolver {
        file_path: "src/b.rs".to_string(),
        line: 2,
        delay: Some(Duration::from_millis(500)),
    });
    let config = IndexerConfig {
        resolver_timeout_ms: 20,
        ..indexer_config()
    };
    let report = IncrementalIndexer::new(ws.root(), &ws.store, config)
        .with_resolver(resolver)
        .index_repository(&CancelToken::new())
        .unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(report.resolution.timeouts.len(), 1);
    assert_eq!(report.resolution.timeouts[0].target_name, "helper");

    let edges = ws.store.edges_from(&rust_fn("src/main.rs", "main")).unwrap();
    assert_eq!(edges[0].unresolved_name(), Some("helper"));
}
