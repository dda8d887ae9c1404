//! Local consistency cache.
//!
//! Values fetched through commands and values pushed by the server land in
//! the same store, addressed by `(topic, canonical index)`:
//! - `key` derives the canonical index string
//! - `value` holds mergeable and opaque values
//! - `memory` is the in-process backend

mod key;
mod memory;
mod traits;
mod value;

pub use key::CacheKey;
pub use memory::MemoryCache;
pub use traits::CacheBackend;
pub use value::{CachedValue, MergeableValue, Observer, ObserverId};
