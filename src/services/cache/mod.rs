pub mod content_hash;
pub mod multi_tier;

pub use content_hash::{canonical_json, content_hash, short_hash};
pub use multi_tier::{CacheStats, CacheStatsSnapshot, FsObjectStore, MultiTierCache, ObjectStore};
