//! Engine configuration.
//!
//! All knobs are process-wide values supplied by the surrounding filesystem
//! configuration loader and passed explicitly to the engine's entry points.

use revfs_error::{Result, RevfsError};
use serde::{Deserialize, Serialize};

/// Default maximum number of entries in a log-to-phys index page.
pub const DEFAULT_L2P_PAGE_SIZE: u64 = 0x2000;

/// Default number of rev file bytes covered by a phys-to-log index page.
pub const DEFAULT_P2L_PAGE_SIZE: u64 = 0x10000;

/// Default number of revisions per shard.
pub const DEFAULT_SHARD_SIZE: u64 = 1000;

/// Default block size for index file reads; prefetch windows align to it.
pub const DEFAULT_BLOCK_SIZE: u64 = 0x10000;

/// Tuning parameters of the item-index engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Maximum number of entries per log-to-phys index page.
    pub l2p_page_size: u64,
    /// Rev file bytes covered by one phys-to-log index page (the cluster
    /// size). Must be a power of two.
    pub p2l_page_size: u64,
    /// Number of consecutive revisions combined into one shard.
    pub shard_size: u64,
    /// Read granularity for index files. Must be a power of two.
    pub block_size: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            l2p_page_size: DEFAULT_L2P_PAGE_SIZE,
            p2l_page_size: DEFAULT_P2L_PAGE_SIZE,
            shard_size: DEFAULT_SHARD_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl IndexConfig {
    /// Validate the configuration.
    ///
    /// Alignment arithmetic in the builders and the prefetch logic requires
    /// `p2l_page_size` and `block_size` to be powers of two.
    pub fn validate(&self) -> Result<()> {
        if self.l2p_page_size == 0 {
            return Err(RevfsError::config("l2p_page_size must be > 0"));
        }
        if self.shard_size == 0 {
            return Err(RevfsError::config("shard_size must be > 0"));
        }
        if !self.p2l_page_size.is_power_of_two() {
            return Err(RevfsError::config("p2l_page_size must be a power of two"));
        }
        if !self.block_size.is_power_of_two() {
            return Err(RevfsError::config("block_size must be a power of two"));
        }
        Ok(())
    }

    /// The base revision identifying the index files covering `revision`.
    ///
    /// For a packed revision that is the first revision of its shard,
    /// otherwise the revision itself.
    #[inline]
    #[must_use]
    pub const fn base_revision(&self, revision: u64, is_packed: bool) -> u64 {
        if is_packed {
            revision - revision % self.shard_size
        } else {
            revision
        }
    }
}

/// Round `value` up to the next multiple of the power-of-two `alignment`.
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a multiple of the power-of-two `alignment`.
#[inline]
#[must_use]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}
