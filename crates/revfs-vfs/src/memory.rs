//! In-memory VFS for tests and ephemeral repositories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use revfs_error::{Result, RevfsError};
use revfs_types::cx::Cx;

use crate::traits::{OpenFlags, Vfs, VfsFile};

/// Backing storage of one file.
#[derive(Debug, Default)]
struct FileStorage {
    data: Vec<u8>,
    read_only: bool,
}

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<FileStorage>>>,
    next_temp_id: u64,
}

/// An in-memory VFS.
///
/// All files are stored as named byte vectors with no persistence. Multiple
/// handles to the same path share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err() -> RevfsError {
    RevfsError::corrupt("MemoryVfs lock poisoned")
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, _cx: &Cx, path: &Path, flags: OpenFlags) -> Result<Self::File> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;

        let storage = if let Some(existing) = inner.files.get(path) {
            if flags.contains(OpenFlags::TRUNCATE) {
                let mut storage = existing.lock().map_err(|_| lock_err())?;
                if storage.read_only {
                    return Err(RevfsError::ReadOnly {
                        path: path.to_path_buf(),
                    });
                }
                storage.data.clear();
            }
            Arc::clone(existing)
        } else if flags.contains(OpenFlags::CREATE) {
            let storage = Arc::new(Mutex::new(FileStorage::default()));
            inner
                .files
                .insert(path.to_path_buf(), Arc::clone(&storage));
            storage
        } else {
            return Err(RevfsError::CannotOpen {
                path: path.to_path_buf(),
            });
        };

        Ok(MemoryFile {
            path: path.to_path_buf(),
            storage,
            writable: flags.contains(OpenFlags::WRITE),
        })
    }

    fn open_temp(&self, _cx: &Cx) -> Result<Self::File> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let id = inner.next_temp_id;
        inner.next_temp_id += 1;

        // Anonymous storage, never registered in the file table.
        Ok(MemoryFile {
            path: PathBuf::from(format!("<temp-{id}>")),
            storage: Arc::new(Mutex::new(FileStorage::default())),
            writable: true,
        })
    }

    fn delete(&self, _cx: &Cx, path: &Path) -> Result<()> {
        self.inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .remove(path);
        Ok(())
    }

    fn rename(&self, _cx: &Cx, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = inner
            .files
            .remove(from)
            .ok_or_else(|| RevfsError::CannotOpen {
                path: from.to_path_buf(),
            })?;
        inner.files.insert(to.to_path_buf(), storage);
        Ok(())
    }

    fn set_read_only(&self, _cx: &Cx, path: &Path) -> Result<()> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = inner.files.get(path).ok_or_else(|| RevfsError::CannotOpen {
            path: path.to_path_buf(),
        })?;
        storage.lock().map_err(|_| lock_err())?.read_only = true;
        Ok(())
    }

    fn exists(&self, _cx: &Cx, path: &Path) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .contains_key(path))
    }
}

/// A file handle in the memory VFS.
#[derive(Debug)]
pub struct MemoryFile {
    path: PathBuf,
    storage: Arc<Mutex<FileStorage>>,
    writable: bool,
}

impl VfsFile for MemoryFile {
    fn path(&self) -> &Path {
        &self.path
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_at(&mut self, _cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        let storage = self.storage.lock().map_err(|_| lock_err())?;

        let offset = offset as usize;
        let file_len = storage.data.len();
        if offset >= file_len {
            return Ok(0);
        }

        let to_read = buf.len().min(file_len - offset);
        buf[..to_read].copy_from_slice(&storage.data[offset..offset + to_read]);
        Ok(to_read)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_at(&mut self, _cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        if !self.writable || storage.read_only {
            return Err(RevfsError::ReadOnly {
                path: self.path.clone(),
            });
        }

        let offset = offset as usize;
        let end = offset + buf.len();
        if end > storage.data.len() {
            storage.data.resize(end, 0);
        }
        storage.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, _cx: &Cx, size: u64) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| lock_err())?;
        if !self.writable || storage.read_only {
            return Err(RevfsError::ReadOnly {
                path: self.path.clone(),
            });
        }
        storage.data.truncate(size as usize);
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx) -> Result<()> {
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(self.storage.lock().map_err(|_| lock_err())?.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_read_file() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("r0/l2p");

        let mut file = vfs
            .open(&cx, path, OpenFlags::read_write_create())
            .unwrap();
        file.write_at(&cx, b"hello", 0).unwrap();
        assert_eq!(file.file_size(&cx).unwrap(), 5);

        let mut buf = [0u8; 5];
        file.read_exact_at(&cx, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn short_read_past_end() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut file = vfs
            .open(&cx, Path::new("f"), OpenFlags::read_write_create())
            .unwrap();
        file.write_at(&cx, b"hi", 0).unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(file.read_at(&cx, &mut buf, 0).unwrap(), 2);
        assert_eq!(file.read_at(&cx, &mut buf, 5).unwrap(), 0);
        assert!(matches!(
            file.read_exact_at(&cx, &mut buf, 0),
            Err(RevfsError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn open_nonexistent_without_create_fails() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        assert!(matches!(
            vfs.open(&cx, Path::new("nope"), OpenFlags::read_only()),
            Err(RevfsError::CannotOpen { .. })
        ));
    }

    #[test]
    fn write_extends_file() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut file = vfs
            .open(&cx, Path::new("f"), OpenFlags::read_write_create())
            .unwrap();
        file.write_at(&cx, b"world", 10).unwrap();
        assert_eq!(file.file_size(&cx).unwrap(), 15);

        let mut buf = [0xFFu8; 15];
        file.read_exact_at(&cx, &mut buf, 0).unwrap();
        assert!(buf[..10].iter().all(|&b| b == 0));
        assert_eq!(&buf[10..], b"world");
    }

    #[test]
    fn rename_replaces_target() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut file = vfs
            .open(&cx, Path::new("tmp"), OpenFlags::read_write_create())
            .unwrap();
        file.write_at(&cx, b"final", 0).unwrap();

        vfs.rename(&cx, Path::new("tmp"), Path::new("index"))
            .unwrap();
        assert!(!vfs.exists(&cx, Path::new("tmp")).unwrap());
        assert!(vfs.exists(&cx, Path::new("index")).unwrap());

        let mut reader = vfs
            .open(&cx, Path::new("index"), OpenFlags::read_only())
            .unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact_at(&cx, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"final");
    }

    #[test]
    fn read_only_files_reject_writes() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("idx");
        let mut file = vfs
            .open(&cx, path, OpenFlags::read_write_create())
            .unwrap();
        file.write_at(&cx, b"data", 0).unwrap();
        vfs.set_read_only(&cx, path).unwrap();

        let mut again = vfs
            .open(&cx, path, OpenFlags::read_write_create())
            .unwrap();
        assert!(matches!(
            again.write_at(&cx, b"x", 0),
            Err(RevfsError::ReadOnly { .. })
        ));
    }

    #[test]
    fn temp_files_are_anonymous() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut t1 = vfs.open_temp(&cx).unwrap();
        let mut t2 = vfs.open_temp(&cx).unwrap();
        t1.write_at(&cx, b"one", 0).unwrap();
        t2.write_at(&cx, b"two", 0).unwrap();

        let mut buf = [0u8; 3];
        t1.read_exact_at(&cx, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"one");
        t2.read_exact_at(&cx, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"two");
    }

    #[test]
    fn delete_file() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("f");
        vfs.open(&cx, path, OpenFlags::read_write_create()).unwrap();
        assert!(vfs.exists(&cx, path).unwrap());
        vfs.delete(&cx, path).unwrap();
        assert!(!vfs.exists(&cx, path).unwrap());
    }
}
