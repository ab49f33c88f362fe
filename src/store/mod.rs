//! SQLite-backed persistence: the vector index and the property graph live
//! in the same database file.

mod sqlite;

pub use sqlite::{NewChunk, NewEdge, NewNode, SqliteStore};
