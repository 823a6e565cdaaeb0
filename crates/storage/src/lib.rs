//! Storage - `ScanStore` implementations
//!
//! - `MemoryStore`: process-local tables, used by tests and one-shot CLI runs
//! - `SqliteStore`: durable store with the stage-run uniqueness constraint
//!   enforced by the schema

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
