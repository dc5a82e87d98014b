//! Cache-aside layer and the shared key-value store it sits on.

mod entity;
mod key;
mod store;

pub use entity::{CacheTtls, EntityCache};
pub use key::{CacheKey, EntityKind};
pub use store::{KeyValueStore, MemoryStore, StoreError};

#[cfg(feature = "redis")]
pub use store::RedisStore;
