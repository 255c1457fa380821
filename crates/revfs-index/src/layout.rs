//! Repository layout collaborator.
//!
//! The engine treats index file locations and revision addressing modes as
//! opaque facts supplied by the surrounding filesystem layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use revfs_error::{Result, RevfsError};
use revfs_types::Revision;

/// Paths and addressing facts the index engine needs from the surrounding
/// repository.
pub trait FsLayout: Send + Sync {
    /// Path of the log-to-phys index file identified by `base_revision`.
    fn l2p_index_path(&self, base_revision: Revision) -> PathBuf;

    /// Path of the phys-to-log index file identified by `base_revision`.
    fn p2l_index_path(&self, base_revision: Revision) -> PathBuf;

    /// Path of the log-to-phys proto index of transaction `txn_id`.
    fn l2p_proto_path(&self, txn_id: &str) -> PathBuf;

    /// Path of the phys-to-log proto index of transaction `txn_id`.
    fn p2l_proto_path(&self, txn_id: &str) -> PathBuf;

    /// Whether `revision` lives in a pack file.
    fn is_packed(&self, revision: Revision) -> bool;

    /// Whether `revision` is addressed through the item indexes. Repositories
    /// created before logical addressing store physical offsets directly.
    fn uses_logical_addressing(&self, revision: Revision) -> bool;

    /// Start offset of `revision` within its pack file. Only consulted for
    /// packed revisions with physical addressing.
    fn packed_base_offset(&self, revision: Revision) -> Result<i64>;
}

/// Straightforward sharded on-disk layout:
///
/// ```text
/// <root>/<shard>/<rev>.l2p        unpacked revision indexes
/// <root>/<shard>/<rev>.p2l
/// <root>/<shard>.pack/index.l2p   packed shard indexes
/// <root>/<shard>.pack/index.p2l
/// <root>/txns/<txn>.l2p-proto     transaction proto indexes
/// <root>/txns/<txn>.p2l-proto
/// ```
#[derive(Debug, Clone)]
pub struct ShardedLayout {
    root: PathBuf,
    shard_size: u64,
    /// Revisions below this bound live in pack files.
    min_unpacked_revision: Revision,
    logical_addressing: bool,
    /// Start offsets of physically addressed packed revisions within their
    /// pack file, as recorded by the pack manifests.
    pack_offsets: HashMap<Revision, i64>,
}

impl ShardedLayout {
    /// Create a layout rooted at `root` with nothing packed yet.
    pub fn new(root: impl Into<PathBuf>, shard_size: u64) -> Self {
        Self {
            root: root.into(),
            shard_size,
            min_unpacked_revision: 0,
            logical_addressing: true,
            pack_offsets: HashMap::new(),
        }
    }

    /// Mark all revisions below `revision` as packed.
    #[must_use]
    pub fn with_min_unpacked_revision(mut self, revision: Revision) -> Self {
        self.min_unpacked_revision = revision;
        self
    }

    /// Switch the layout to physical addressing (pre-index repositories).
    #[must_use]
    pub fn with_physical_addressing(mut self) -> Self {
        self.logical_addressing = false;
        self
    }

    /// Record the pack file start offset of a physically addressed revision.
    #[must_use]
    pub fn with_pack_offset(mut self, revision: Revision, offset: i64) -> Self {
        self.pack_offsets.insert(revision, offset);
        self
    }

    fn shard_dir(&self, revision: Revision) -> PathBuf {
        self.root.join((revision / self.shard_size).to_string())
    }

    fn pack_dir(&self, base_revision: Revision) -> PathBuf {
        self.root
            .join(format!("{}.pack", base_revision / self.shard_size))
    }
}

impl FsLayout for ShardedLayout {
    fn l2p_index_path(&self, base_revision: Revision) -> PathBuf {
        if self.is_packed(base_revision) {
            self.pack_dir(base_revision).join("index.l2p")
        } else {
            self.shard_dir(base_revision)
                .join(format!("{base_revision}.l2p"))
        }
    }

    fn p2l_index_path(&self, base_revision: Revision) -> PathBuf {
        if self.is_packed(base_revision) {
            self.pack_dir(base_revision).join("index.p2l")
        } else {
            self.shard_dir(base_revision)
                .join(format!("{base_revision}.p2l"))
        }
    }

    fn l2p_proto_path(&self, txn_id: &str) -> PathBuf {
        self.root.join("txns").join(format!("{txn_id}.l2p-proto"))
    }

    fn p2l_proto_path(&self, txn_id: &str) -> PathBuf {
        self.root.join("txns").join(format!("{txn_id}.p2l-proto"))
    }

    fn is_packed(&self, revision: Revision) -> bool {
        revision < self.min_unpacked_revision
    }

    fn uses_logical_addressing(&self, _revision: Revision) -> bool {
        self.logical_addressing
    }

    fn packed_base_offset(&self, revision: Revision) -> Result<i64> {
        self.pack_offsets
            .get(&revision)
            .copied()
            .ok_or(RevfsError::RevisionNotIndexed { revision })
    }
}

/// Helper shared by the builders: the temporary sibling a final index file
/// is written to before the rename into place.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(Default::default, std::ffi::OsStr::to_os_string);
    name.push(".tmp");
    path.with_file_name(name)
}
