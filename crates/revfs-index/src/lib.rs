//! Item-index engine: the on-disk indexes that let a revision's items be
//! addressed by a stable `(revision, item index)` pair while their physical
//! location in the revision or pack file is free to move.
//!
//! Two index families exist per revision (or per shard once packed):
//!
//! - **log-to-phys (L2P)**: `(revision, item index) → file offset`
//! - **phys-to-log (P2L)**: `(revision, file offset) → item description`
//!
//! During a commit the transaction appends fixed records to *proto indexes*
//! ([`L2pProtoIndex`], [`P2lProtoIndex`]); at finalization the builders
//! ([`ItemIndex::create_l2p_index`], [`ItemIndex::create_p2l_index`])
//! consume them once and emit the compact, read-only index files. Readers
//! stream packed integers ([`stream::PackedStream`]), cache headers and
//! pages in a shared blob cache, and prefetch neighboring pages so scans of
//! adjacent items stay cheap.

pub mod layout;
pub mod proto;
pub mod spill;
pub mod stream;

mod l2p;
mod p2l;

use std::sync::Arc;

use revfs_cache::{BlobCache, TypedCache};
use revfs_error::Result;
use revfs_types::cx::Cx;
use revfs_types::{IndexConfig, Revision};
use revfs_vfs::Vfs;

pub use layout::{FsLayout, ShardedLayout};
pub use proto::{L2pProtoIndex, P2lProtoIndex};
pub use revfs_types::P2lEntry;

use crate::l2p::{L2pHeader, L2pPage};
use crate::p2l::{P2lHeader, P2lPage};

/// The item-index engine of one repository.
///
/// Shared across readers; all methods take `&self`. The four caches are
/// internally synchronized, and every lookup opens its own stream on
/// demand, so concurrent lookups never contend on file state.
pub struct ItemIndex<V: Vfs> {
    pub(crate) vfs: Arc<V>,
    pub(crate) layout: Arc<dyn FsLayout>,
    pub(crate) config: IndexConfig,
    pub(crate) l2p_header_cache: TypedCache<L2pHeader>,
    pub(crate) l2p_page_cache: TypedCache<L2pPage>,
    pub(crate) p2l_header_cache: TypedCache<P2lHeader>,
    pub(crate) p2l_page_cache: TypedCache<P2lPage>,
}

impl<V: Vfs> ItemIndex<V> {
    /// Create an engine over `vfs` and `layout`, storing cached headers and
    /// pages in `cache`.
    pub fn new(
        vfs: Arc<V>,
        layout: Arc<dyn FsLayout>,
        config: IndexConfig,
        cache: Arc<dyn BlobCache>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            vfs,
            layout,
            config,
            l2p_header_cache: TypedCache::new(Arc::clone(&cache), "l2p-header"),
            l2p_page_cache: TypedCache::new(Arc::clone(&cache), "l2p-page"),
            p2l_header_cache: TypedCache::new(Arc::clone(&cache), "p2l-header"),
            p2l_page_cache: TypedCache::new(cache, "p2l-page"),
        })
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Open the log-to-phys proto index of transaction `txn_id` for
    /// appending.
    pub fn open_l2p_proto_index(&self, cx: &Cx, txn_id: &str) -> Result<L2pProtoIndex<V::File>> {
        L2pProtoIndex::open(&*self.vfs, cx, &self.layout.l2p_proto_path(txn_id))
    }

    /// Open the phys-to-log proto index of transaction `txn_id` for
    /// appending.
    pub fn open_p2l_proto_index(&self, cx: &Cx, txn_id: &str) -> Result<P2lProtoIndex<V::File>> {
        P2lProtoIndex::open(&*self.vfs, cx, &self.layout.p2l_proto_path(txn_id))
    }

    /// The `(base revision, is packed)` pair identifying the index files
    /// covering `revision`, also used as the header cache key.
    pub(crate) fn rev_key(&self, revision: Revision) -> (Revision, bool) {
        let packed = self.layout.is_packed(revision);
        (self.config.base_revision(revision, packed), packed)
    }
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn header_key(base_revision: Revision, packed: bool) -> [i64; 2] {
    [base_revision as i64, i64::from(packed)]
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn page_key(revision: Revision, packed: bool, page_no: u64) -> [i64; 3] {
    [revision as i64, i64::from(packed), page_no as i64]
}
