//! The key→blob cache contract required by the index readers, plus the
//! in-memory implementation used by default.
//!
//! Readers store serialized values (see `revfs-serial`) and retrieve them
//! either whole (`get`) or through *partial getters* that read a few fields
//! out of the raw blob (`get_partial`). The cache may evict at any time;
//! returned blobs are reference-counted so a concurrent eviction never
//! invalidates data a reader is still using.

pub mod keys;
pub mod s3fifo;

use std::marker::PhantomData;
use std::sync::Arc;

use revfs_error::Result;
use revfs_serial::{BlobView, CacheBlob};

pub use keys::CacheKey;
pub use s3fifo::MemoryBlobCache;

/// A shared, internally synchronized key→blob cache.
pub trait BlobCache: Send + Sync {
    /// Fetch the blob stored under `key`, if present.
    fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>>;

    /// Whether `key` is present, without touching access statistics.
    fn has_key(&self, key: &CacheKey) -> bool;

    /// Store `value` under `key`, replacing any previous blob.
    fn set(&self, key: &CacheKey, value: Vec<u8>);
}

/// Typed view over a [`BlobCache`] namespace.
///
/// Serializes values on `set`, deserializes on `get`, and exposes
/// `get_partial` for reading individual fields out of the cached blob
/// without materializing the whole value.
pub struct TypedCache<T> {
    cache: Arc<dyn BlobCache>,
    namespace: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedCache<T> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            namespace: self.namespace,
            _marker: PhantomData,
        }
    }
}

impl<T: CacheBlob> TypedCache<T> {
    /// Create a typed view using `namespace` as the key prefix.
    pub fn new(cache: Arc<dyn BlobCache>, namespace: &'static str) -> Self {
        Self {
            cache,
            namespace,
            _marker: PhantomData,
        }
    }

    fn key(&self, parts: &[i64]) -> CacheKey {
        CacheKey::new(self.namespace, parts)
    }

    /// Fetch and deserialize the value stored under `parts`.
    pub fn get(&self, parts: &[i64]) -> Result<Option<T>> {
        match self.cache.get(&self.key(parts)) {
            Some(blob) => Ok(Some(T::deserialize(&blob)?)),
            None => Ok(None),
        }
    }

    /// Run `getter` against the serialized blob stored under `parts`.
    ///
    /// Returns `Ok(None)` on a cache miss. The getter must not retain
    /// references into the blob past the call.
    pub fn get_partial<R>(
        &self,
        parts: &[i64],
        getter: impl FnOnce(BlobView<'_>) -> Result<R>,
    ) -> Result<Option<R>> {
        match self.cache.get(&self.key(parts)) {
            Some(blob) => Ok(Some(getter(BlobView::new(&blob))?)),
            None => Ok(None),
        }
    }

    /// Whether a value is cached under `parts`.
    pub fn has_key(&self, parts: &[i64]) -> bool {
        self.cache.has_key(&self.key(parts))
    }

    /// Serialize and store `value` under `parts`.
    pub fn set(&self, parts: &[i64], value: &T) {
        self.cache.set(&self.key(parts), value.serialize());
    }
}
