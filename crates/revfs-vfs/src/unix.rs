//! Unix VFS backed by `std::fs` positioned I/O.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use revfs_error::{Result, RevfsError};
use revfs_types::cx::Cx;

use crate::traits::{OpenFlags, Vfs, VfsFile};

/// VFS implementation on top of the host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixVfs;

impl UnixVfs {
    /// Create a new Unix VFS.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(&self, cx: &Cx, path: &Path, flags: OpenFlags) -> Result<Self::File> {
        cx.checkpoint()?;

        let mut options = OpenOptions::new();
        options
            .read(flags.contains(OpenFlags::READ))
            .write(flags.contains(OpenFlags::WRITE))
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE));

        let file = options.open(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => RevfsError::CannotOpen {
                path: path.to_path_buf(),
            },
            _ => RevfsError::Io(err),
        })?;

        Ok(UnixFile {
            path: path.to_path_buf(),
            file,
        })
    }

    fn open_temp(&self, cx: &Cx) -> Result<Self::File> {
        cx.checkpoint()?;
        let file = tempfile::tempfile()?;
        Ok(UnixFile {
            path: PathBuf::from("<temp>"),
            file,
        })
    }

    fn delete(&self, cx: &Cx, path: &Path) -> Result<()> {
        cx.checkpoint()?;
        fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, cx: &Cx, from: &Path, to: &Path) -> Result<()> {
        cx.checkpoint()?;
        fs::rename(from, to)?;
        Ok(())
    }

    fn set_read_only(&self, cx: &Cx, path: &Path) -> Result<()> {
        cx.checkpoint()?;
        let mut permissions = fs::metadata(path)?.permissions();
        permissions.set_readonly(true);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }

    fn exists(&self, cx: &Cx, path: &Path) -> Result<bool> {
        cx.checkpoint()?;
        Ok(path.exists())
    }
}

/// A file handle on the host filesystem.
#[derive(Debug)]
pub struct UnixFile {
    path: PathBuf,
    file: File,
}

impl VfsFile for UnixFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read_at(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        cx.checkpoint()?;

        // read_at may return short counts before EOF; loop until the buffer
        // is full or the file ends.
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(RevfsError::Io(err)),
            }
        }
        Ok(filled)
    }

    fn write_at(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        cx.checkpoint()?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        cx.checkpoint()?;
        self.file.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self, cx: &Cx) -> Result<()> {
        cx.checkpoint()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn file_size(&self, cx: &Cx) -> Result<u64> {
        cx.checkpoint()?;
        Ok(self.file.metadata()?.len())
    }
}
