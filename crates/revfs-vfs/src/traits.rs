use std::path::Path;

use revfs_error::Result;
use revfs_types::cx::Cx;

bitflags::bitflags! {
    /// How to open a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Create the file if it does not exist.
        const CREATE = 1 << 2;
        /// Truncate the file to zero length on open.
        const TRUNCATE = 1 << 3;
    }
}

impl OpenFlags {
    /// Read-only access to an existing file.
    #[must_use]
    pub const fn read_only() -> Self {
        Self::READ
    }

    /// Append-style access: read + write, created on demand.
    #[must_use]
    pub const fn read_write_create() -> Self {
        Self::READ.union(Self::WRITE).union(Self::CREATE)
    }

    /// Fresh output file: write, created, truncated.
    #[must_use]
    pub const fn create_truncate() -> Self {
        Self::WRITE.union(Self::CREATE).union(Self::TRUNCATE)
    }
}

/// A virtual filesystem.
///
/// Abstracts the file operations the index engine performs so tests can run
/// against an in-memory backend. Backends: [`crate::UnixVfs`] (production),
/// [`crate::MemoryVfs`] (tests and ephemeral repositories).
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g. "unix", "memory").
    fn name(&self) -> &'static str;

    /// Open `path` according to `flags`.
    fn open(&self, cx: &Cx, path: &Path, flags: OpenFlags) -> Result<Self::File>;

    /// Open an anonymous temporary file that disappears when the handle is
    /// dropped. Used by spill buffers.
    fn open_temp(&self, cx: &Cx) -> Result<Self::File>;

    /// Delete the file at `path`.
    fn delete(&self, cx: &Cx, path: &Path) -> Result<()>;

    /// Atomically move `from` to `to`, replacing any existing file.
    fn rename(&self, cx: &Cx, from: &Path, to: &Path) -> Result<()>;

    /// Strip write permission from the file at `path`.
    fn set_read_only(&self, cx: &Cx, path: &Path) -> Result<()>;

    /// Whether a file exists at `path`.
    fn exists(&self, cx: &Cx, path: &Path) -> Result<bool>;
}

/// A file handle opened through a [`Vfs`].
///
/// All I/O is positioned; handles carry no cursor. Reads past the end of
/// the file return the number of bytes actually available.
pub trait VfsFile: Send {
    /// The path this handle was opened with (temp files use a synthetic
    /// name). Used in error context.
    fn path(&self) -> &Path;

    /// Read up to `buf.len()` bytes at byte `offset`, returning the number
    /// of bytes read. A short count means end of file.
    fn read_at(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<()> {
        let n = self.read_at(cx, buf, offset)?;
        if n == buf.len() {
            Ok(())
        } else {
            Err(revfs_error::RevfsError::UnexpectedEof {
                path: self.path().to_path_buf(),
                offset: offset + n as u64,
            })
        }
    }

    /// Write all of `buf` at byte `offset`, extending the file as needed.
    fn write_at(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()>;

    /// Flush file contents to stable storage.
    fn sync(&mut self, cx: &Cx) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&self, cx: &Cx) -> Result<u64>;
}

/// Helper for append-style writers: tracks the write position on top of the
/// positioned [`VfsFile`] API.
#[derive(Debug)]
pub struct AppendFile<F: VfsFile> {
    file: F,
    len: u64,
}

impl<F: VfsFile> AppendFile<F> {
    /// Wrap `file`, continuing after its current contents.
    pub fn new(cx: &Cx, mut file: F) -> Result<Self> {
        let len = file.file_size(cx)?;
        Ok(Self { file, len })
    }

    /// Append `buf` at the end of the file.
    pub fn append(&mut self, cx: &Cx, buf: &[u8]) -> Result<()> {
        self.file.write_at(cx, buf, self.len)?;
        self.len += buf.len() as u64;
        Ok(())
    }

    /// Bytes written so far (including pre-existing contents).
    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flush to stable storage.
    pub fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.file.sync(cx)
    }

    /// Access the underlying file.
    pub fn get_mut(&mut self) -> &mut F {
        &mut self.file
    }

    /// Unwrap the underlying file.
    pub fn into_inner(self) -> F {
        self.file
    }
}
