//! Spill buffer for the index builders.
//!
//! Page bodies are produced before the header that precedes them in the
//! final file, so the builders accumulate them in a buffer first. Small
//! outputs stay in memory; past the spill threshold the buffer moves to an
//! anonymous temp file so pack-sized builds stay bounded.

use revfs_error::Result;
use revfs_types::cx::Cx;
use revfs_vfs::traits::AppendFile;
use revfs_vfs::{Vfs, VfsFile};

/// In-memory bytes kept before spilling to disk.
pub const SPILL_THRESHOLD: usize = 0x0100_0000;

/// Chunk size for copying a spilled buffer into the final file.
const COPY_CHUNK: usize = 0x10000;

/// Append-only byte buffer with a disk-backed tail.
pub struct SpillBuf<V: Vfs> {
    mem: Vec<u8>,
    spill: Option<AppendFile<V::File>>,
    threshold: usize,
}

impl<V: Vfs> SpillBuf<V> {
    /// Create a buffer that spills to a temp file past `threshold` bytes.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            mem: Vec::new(),
            spill: None,
            threshold,
        }
    }

    /// Total bytes written so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.spill.as_ref().map_or(0, AppendFile::len) + self.mem.len() as u64
    }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `data`.
    pub fn write(&mut self, cx: &Cx, vfs: &V, data: &[u8]) -> Result<()> {
        if let Some(spill) = &mut self.spill {
            return spill.append(cx, data);
        }

        self.mem.extend_from_slice(data);
        if self.mem.len() > self.threshold {
            let mut spill = AppendFile::new(cx, vfs.open_temp(cx)?)?;
            spill.append(cx, &self.mem)?;
            self.mem = Vec::new();
            self.spill = Some(spill);
        }
        Ok(())
    }

    /// Copy the accumulated bytes into `dest` in write order.
    pub fn copy_into<F: VfsFile>(mut self, cx: &Cx, dest: &mut AppendFile<F>) -> Result<()> {
        if let Some(mut spill) = self.spill.take() {
            let total = spill.len();
            let file = spill.get_mut();
            let mut chunk = vec![0u8; COPY_CHUNK];
            let mut at = 0u64;
            while at < total {
                let want = COPY_CHUNK.min((total - at) as usize);
                file.read_exact_at(cx, &mut chunk[..want], at)?;
                dest.append(cx, &chunk[..want])?;
                at += want as u64;
            }
        }
        dest.append(cx, &self.mem)
    }
}
