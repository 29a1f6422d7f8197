//! Staged, hash-keyed schema cache that primes the model's context

pub mod artifacts;
pub mod pipeline;
pub mod store;

pub use artifacts::{DataDictionary, RawSchema, Stage, StructuredSchema};
pub use pipeline::{extract_raw_schema, CacheInfo, SchemaArtifacts, SchemaCachePipeline};
pub use store::{CacheEntry, CacheKey, CacheStore, EntryStat, FsCacheStore, InMemoryCacheStore};
