//! Store clients: the hot KV tier, the warm relational tier, and the cold
//! document tier. Each sits behind the smallest interface its consumers
//! need, with in-process implementations for tests and degraded operation.

pub mod document;
pub mod error;
pub mod kv;
pub mod relational;

pub use document::{DocumentFilter, DocumentStore, InMemoryDocumentStore, MemoryDocument, ScoredDocument};
pub use error::StoreError;
pub use kv::{KeyValueStore, MemoryKv, RedisKv};
pub use relational::Database;
