//! # Vigil Store
//!
//! Store implementations behind the `vigil-core` trait seams: SQLite for
//! deployments, in-memory for tests and dry runs.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryDirectory, MemoryStore};
pub use sqlite::SqliteStore;
