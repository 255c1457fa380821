//! RevFS: a versioned filesystem built around revision and pack files with
//! compact item indexes.
//!
//! This crate re-exports the public surface of the workspace:
//!
//! - [`ItemIndex`]: the logical-to-physical / physical-to-logical index
//!   engine, with [`L2pProtoIndex`] / [`P2lProtoIndex`] for transactions
//! - [`Vfs`] implementations ([`UnixVfs`], [`MemoryVfs`])
//! - [`MemoryBlobCache`]: the default shared blob cache
//! - [`IndexConfig`] and the [`Cx`] cancellation context

pub use revfs_cache::{BlobCache, CacheKey, MemoryBlobCache, TypedCache};
pub use revfs_error::{Result, RevfsError};
pub use revfs_index::{
    FsLayout, ItemIndex, L2pProtoIndex, P2lProtoIndex, ShardedLayout,
};
pub use revfs_serial::{BlobView, BlobWriter, CacheBlob};
pub use revfs_types::{
    config, cx::Cx, fnv, item_type, varint, IndexConfig, P2lEntry, Revision, INVALID_REVISION,
};
pub use revfs_vfs::{MemoryVfs, OpenFlags, UnixVfs, Vfs, VfsFile};
