pub mod codec;
pub mod database;
pub mod schema;

pub use database::{
    ApplyOutcome, CancelToken, FileUpdate, GraphStore, IndexStore, IndexingDiagnostic,
};
