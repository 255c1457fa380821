use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for RevFS operations.
///
/// Structured variants for the common cases; readers of the on-disk indexes
/// attach the file name and byte offset wherever corruption can only be
/// diagnosed with that context.
#[derive(Error, Debug)]
pub enum RevfsError {
    // === Index lookup errors ===
    /// The revision is not covered by the index file that was consulted.
    #[error("revision {revision} not covered by item index")]
    RevisionNotIndexed { revision: u64 },

    /// The item index lies past the revision's item count.
    #[error("item index {item_index} too large in revision {revision}")]
    ItemIndexOverflow { revision: u64, item_index: u64 },

    /// The file offset lies past the revision's covered file size.
    #[error("offset {offset} too large in revision {revision}")]
    OffsetOverflow { revision: u64, offset: i64 },

    // === Corruption ===
    /// Generic index corruption detected while decoding cached or on-disk
    /// data.
    #[error("corrupt index: {detail}")]
    Corrupt { detail: String },

    /// A packed integer did not terminate within 64 bits.
    #[error("corrupt index '{path}': number too large at offset {offset:#x}")]
    NumberTooLarge { path: PathBuf, offset: u64 },

    /// The index file ended in the middle of a record.
    #[error("unexpected end of index file '{path}' at offset {offset:#x}")]
    UnexpectedEof { path: PathBuf, offset: u64 },

    // === I/O ===
    /// File I/O error without further context.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File I/O error while reading an index file.
    #[error("can't read index file '{path}' at offset {offset:#x}")]
    IndexRead {
        path: PathBuf,
        offset: u64,
        source: std::io::Error,
    },

    /// Cannot open a file.
    #[error("unable to open file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// A write was attempted on a read-only file.
    #[error("attempt to write a readonly file: '{path}'")]
    ReadOnly { path: PathBuf },

    // === Caller errors ===
    /// An item index too large to be used as a dense array position.
    #[error("item index {item_index} exceeds the supported maximum")]
    ItemIndexTooLarge { item_index: u64 },

    /// A file offset below the "unused" sentinel of -1.
    #[error("invalid file offset {offset}")]
    InvalidOffset { offset: i64 },

    /// Rejected engine configuration.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    // === Control flow ===
    /// The operation was interrupted through its capability context.
    #[error("operation interrupted")]
    Interrupted,
}

impl RevfsError {
    /// Create a generic corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Whether this error indicates damaged on-disk or cached index data, as
    /// opposed to an out-of-range query or an environment failure.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::NumberTooLarge { .. } | Self::UnexpectedEof { .. }
        )
    }

    /// Whether the error is an out-of-range query against a healthy index.
    #[must_use]
    pub const fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            Self::RevisionNotIndexed { .. }
                | Self::ItemIndexOverflow { .. }
                | Self::OffsetOverflow { .. }
        )
    }
}

/// Result type alias using `RevfsError`.
pub type Result<T> = std::result::Result<T, RevfsError>;
