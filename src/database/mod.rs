// Database module
// SQLite backs the durable cache tier; the vector index keeps its own snapshot files

pub mod sqlite;
pub mod vector_index;

pub use sqlite::Database;
pub use vector_index::{ChunkMetadata, IndexStats, SearchHit, VectorIndex};
