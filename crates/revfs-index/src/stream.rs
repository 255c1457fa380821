//! Prefetching packed number stream.
//!
//! Reads files containing packed unsigned integers (see
//! `revfs_types::varint`) and presents them as a plain sequence of `u64`
//! with random access. Values are decoded in batches to keep per-`get`
//! overhead low; refills never cross a block boundary unnecessarily, so a
//! random seek touches at most one block of the index file.

use std::path::Path;

use revfs_error::{Result, RevfsError};
use revfs_types::config::align_down;
use revfs_types::cx::Cx;
use revfs_types::varint::MAX_VARINT_LEN;
use revfs_vfs::{OpenFlags, Vfs, VfsFile};

/// How many bytes (and at most how many numbers) one refill prefetches.
const MAX_PREFETCH: usize = 64;

/// A prefetched number and the read position right after it.
#[derive(Debug, Clone, Copy)]
struct ValuePos {
    value: u64,
    /// Bytes consumed since the buffer start, *including* this number.
    total_len: u64,
}

/// Prefetching reader over a packed-integer file.
#[derive(Debug)]
pub struct PackedStream<F: VfsFile> {
    file: F,
    block_size: u64,
    buffer: Vec<ValuePos>,
    /// Index of the next buffered number to hand out (`0..=buffer.len()`).
    current: usize,
    /// File offset the first buffered number was read from.
    start_offset: u64,
    /// File offset the next refill reads from.
    next_offset: u64,
}

impl<F: VfsFile> PackedStream<F> {
    /// Open `path` for packed reading in blocks of `block_size` bytes.
    pub fn open<V: Vfs<File = F>>(
        vfs: &V,
        cx: &Cx,
        path: &Path,
        block_size: u64,
    ) -> Result<Self> {
        let file = vfs.open(cx, path, OpenFlags::read_only())?;
        Ok(Self {
            file,
            block_size,
            buffer: Vec::with_capacity(MAX_PREFETCH),
            current: 0,
            start_offset: 0,
            next_offset: 0,
        })
    }

    /// The file offset at which the next number will be read.
    #[must_use]
    pub fn offset(&self) -> u64 {
        if self.current == 0 {
            self.start_offset
        } else {
            self.start_offset + self.buffer[self.current - 1].total_len
        }
    }

    /// Read the next number.
    pub fn get(&mut self, cx: &Cx) -> Result<u64> {
        if self.current == self.buffer.len() {
            self.refill(cx)?;
        }
        let value = self.buffer[self.current].value;
        self.current += 1;
        Ok(value)
    }

    /// Position the stream at `offset`. The offset is not validated; a bad
    /// position surfaces as a decode error on the next [`PackedStream::get`].
    pub fn seek(&mut self, offset: u64) {
        if self.buffer.is_empty() || offset < self.start_offset || offset >= self.next_offset {
            // Outside buffered data; the next get() refills from `offset`.
            self.start_offset = offset;
            self.next_offset = offset;
            self.buffer.clear();
            self.current = 0;
        } else {
            // The buffer is small, so a scan is cheap enough.
            let rel = offset - self.start_offset;
            let mut i = 0;
            while i < self.buffer.len() && self.buffer[i].total_len <= rel {
                i += 1;
            }
            self.current = i;
        }
    }

    fn refill(&mut self, cx: &Cx) -> Result<()> {
        self.start_offset = self.next_offset;

        // Prefetch at least one number but, if feasible, stay within the
        // current block so speculatively read bytes are ones we will likely
        // need.
        let block_start = align_down(self.next_offset, self.block_size);
        let block_left = self.block_size - (self.next_offset - block_start);
        let mut want = MAX_PREFETCH;
        if block_left >= MAX_VARINT_LEN as u64 && (block_left as usize) < want {
            want = block_left as usize;
        }

        let mut raw = [0u8; MAX_PREFETCH];
        let mut read = self
            .file
            .read_at(cx, &mut raw[..want], self.next_offset)
            .map_err(|err| match err {
                RevfsError::Io(source) => RevfsError::IndexRead {
                    path: self.file.path().to_path_buf(),
                    offset: self.next_offset,
                    source,
                },
                other => other,
            })?;

        // Trim an incomplete trailing number; it is re-read next refill.
        while read > 0 && raw[read - 1] >= 0x80 {
            read -= 1;
        }

        // refill() only runs when get() needs more data, so there must be
        // at least one complete number here.
        if read == 0 {
            return Err(RevfsError::UnexpectedEof {
                path: self.file.path().to_path_buf(),
                offset: self.next_offset,
            });
        }

        self.buffer.clear();
        self.current = 0;

        let mut i = 0;
        while i < read {
            if raw[i] < 0x80 {
                // Single-byte numbers are frequent; decode them directly.
                let value = u64::from(raw[i]);
                i += 1;
                self.buffer.push(ValuePos {
                    value,
                    total_len: i as u64,
                });
            } else {
                let mut value: u64 = 0;
                let mut shift = 0u32;
                loop {
                    let byte = raw[i];
                    i += 1;
                    // Catch corrupted data early; a shift past 64 bits means
                    // the number cannot be valid.
                    if shift >= 64 {
                        return Err(RevfsError::NumberTooLarge {
                            path: self.file.path().to_path_buf(),
                            offset: self.start_offset + i as u64,
                        });
                    }
                    value |= u64::from(byte & 0x7F) << shift;
                    if byte < 0x80 {
                        break;
                    }
                    shift += 7;
                }
                self.buffer.push(ValuePos {
                    value,
                    total_len: i as u64,
                });
            }
        }

        self.next_offset = self.start_offset + read as u64;
        Ok(())
    }
}
