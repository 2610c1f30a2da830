//! Reference-counted handle to a file opened for concurrent positional
//! read/write by multiple workers. Grounded on the teacher's
//! `fs::file::TorrentFile` (open-once, seek+write_vectored) generalized to
//! true positional I/O (no shared seek cursor) and a process-wide registry
//! that deduplicates handles by canonical path.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

#[derive(Debug, thiserror::Error)]
pub enum SharedFileError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("registry lock poisoned")]
    Poisoned,
}

impl<T> From<std::sync::PoisonError<T>> for SharedFileError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SharedFileError::Poisoned
    }
}

pub type Result<T> = std::result::Result<T, SharedFileError>;

/// Open-mode flags, mirroring the original's `File::RW | OPEN | CREATE |
/// SHARED | NO_CACHE_HINT` combination.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub create: bool,
    pub read_write: bool,
    /// Request bypass of the OS page cache where supported. Quantising
    /// buffers to the sector size is the caller's responsibility.
    pub no_cache_hint: bool,
}

struct Registry {
    handles: Mutex<HashMap<PathBuf, Weak<Inner>>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry { handles: Mutex::new(HashMap::new()) })
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    file: std::sync::RwLock<File>,
}

/// A cheaply-`Clone`-able shared handle. The last clone dropped closes the
/// underlying OS file.
#[derive(Debug, Clone)]
pub struct SharedFileStream {
    inner: Arc<Inner>,
}

impl SharedFileStream {
    /// Opens (or returns the already-open, deduplicated handle for) `path`.
    pub fn open(path: &Path, flags: OpenFlags) -> Result<Self> {
        let canonical = canonicalize_best_effort(path)?;
        let reg = registry();
        let mut handles = reg.handles.lock()?;

        if let Some(existing) = handles.get(&canonical).and_then(Weak::upgrade) {
            return Ok(Self { inner: existing });
        }

        let file = OpenOptions::new()
            .create(flags.create)
            .read(true)
            .write(flags.read_write)
            .open(&canonical)?;

        let inner = Arc::new(Inner { path: canonical.clone(), file: std::sync::RwLock::new(file) });
        handles.insert(canonical, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Positional read; does not touch any shared seek cursor. Safe to call
    /// concurrently with other reads and with writes to disjoint ranges.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.inner.file.read()?;
        Ok(read_at_impl(&file, offset, buf)?)
    }

    /// Positional write; callers must not issue overlapping concurrent
    /// writes (the registry only guards the handle, not application-level
    /// byte-range exclusivity).
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let file = self.inner.file.write()?;
        Ok(write_at_impl(&file, offset, buf)?)
    }

    pub fn set_size(&self, size: u64) -> Result<()> {
        let file = self.inner.file.write()?;
        file.set_len(size)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let file = self.inner.file.read()?;
        file.sync_data()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        let file = self.inner.file.read()?;
        Ok(file.metadata()?.len())
    }

    /// Number of live clones of this handle, including this one.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

fn canonicalize_best_effort(path: &Path) -> Result<PathBuf> {
    // `canonicalize` requires the file to exist; fall back to the given
    // path (with its parent created) for brand-new targets.
    if let Ok(c) = path.canonicalize() {
        return Ok(c);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(path.to_path_buf())
}

#[cfg(unix)]
fn read_at_impl(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_at_impl(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn read_at_impl(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn write_at_impl(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dedupes_handles_by_canonical_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.dat");
        std::fs::write(&path, b"hello world").unwrap();

        let a = SharedFileStream::open(&path, OpenFlags { read_write: true, ..Default::default() }).unwrap();
        let b = SharedFileStream::open(&path, OpenFlags { read_write: true, ..Default::default() }).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(a.refcount(), 2); // registry only holds a Weak, so just `a` and `b`.
    }

    #[test]
    fn disjoint_writes_and_reads_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.dat");
        let f = SharedFileStream::open(
            &path,
            OpenFlags { create: true, read_write: true, ..Default::default() },
        )
        .unwrap();
        f.set_size(20).unwrap();
        f.write_at(0, b"0123456789").unwrap();
        f.write_at(10, b"abcdefghij").unwrap();

        let mut buf = [0u8; 20];
        f.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789abcdefghij");
    }
}
