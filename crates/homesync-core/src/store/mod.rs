// Entity state storage: memory tier, durable tier, pending fetch batch.

mod batch;
mod cache;
mod durable;
mod entry;

pub use cache::StateCache;
pub use durable::{DurableStorage, FileStorage, MemoryStorage, StorageError};
pub use entry::{CacheEntry, Origin};
