#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use nearfs::backend::{
    Backend, BackendAttr, DirEntry, FileHandle, FsStats, LocalBackend, OpenFlags,
};
use nearfs::path::BackendPath;

/// Wraps [`LocalBackend`] and counts the calls the cache layer makes, so
/// tests can assert which decisions hit the backend and which were served
/// from cache.
pub struct CountingBackend {
    inner: LocalBackend,
    pub stat_calls: AtomicU64,
    pub readdir_calls: AtomicU64,
    pub pread_calls: AtomicU64,
    pub pwrite_calls: AtomicU64,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self {
            inner: LocalBackend::new(),
            stat_calls: AtomicU64::new(0),
            readdir_calls: AtomicU64::new(0),
            pread_calls: AtomicU64::new(0),
            pwrite_calls: AtomicU64::new(0),
        }
    }

    pub fn stat_count(&self) -> u64 {
        self.stat_calls.load(Ordering::Relaxed)
    }

    pub fn readdir_count(&self) -> u64 {
        self.readdir_calls.load(Ordering::Relaxed)
    }

    pub fn pread_count(&self) -> u64 {
        self.pread_calls.load(Ordering::Relaxed)
    }

    pub fn pwrite_count(&self) -> u64 {
        self.pwrite_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Backend for CountingBackend {
    async fn stat(&self, path: &BackendPath) -> std::io::Result<BackendAttr> {
        self.stat_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.stat(path).await
    }

    async fn readdir(&self, path: &BackendPath) -> std::io::Result<Vec<DirEntry>> {
        self.readdir_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.readdir(path).await
    }

    async fn open(&self, path: &BackendPath, flags: OpenFlags) -> std::io::Result<FileHandle> {
        self.inner.open(path, flags).await
    }

    async fn create(
        &self,
        path: &BackendPath,
        flags: OpenFlags,
        mode: u32,
    ) -> std::io::Result<FileHandle> {
        self.inner.create(path, flags, mode).await
    }

    async fn pread(&self, fh: FileHandle, offset: u64, len: usize) -> std::io::Result<Bytes> {
        self.pread_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.pread(fh, offset, len).await
    }

    async fn pwrite(&self, fh: FileHandle, offset: u64, data: &[u8]) -> std::io::Result<usize> {
        self.pwrite_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.pwrite(fh, offset, data).await
    }

    async fn fsync(&self, fh: FileHandle, datasync: bool) -> std::io::Result<()> {
        self.inner.fsync(fh, datasync).await
    }

    async fn close(&self, fh: FileHandle) -> std::io::Result<()> {
        self.inner.close(fh).await
    }

    async fn mkdir(&self, path: &BackendPath, mode: u32) -> std::io::Result<()> {
        self.inner.mkdir(path, mode).await
    }

    async fn symlink(&self, target: &Path, link: &BackendPath) -> std::io::Result<()> {
        self.inner.symlink(target, link).await
    }

    async fn link(&self, existing: &BackendPath, new: &BackendPath) -> std::io::Result<()> {
        self.inner.link(existing, new).await
    }

    async fn unlink(&self, path: &BackendPath) -> std::io::Result<()> {
        self.inner.unlink(path).await
    }

    async fn rmdir(&self, path: &BackendPath) -> std::io::Result<()> {
        self.inner.rmdir(path).await
    }

    async fn rename(&self, from: &BackendPath, to: &BackendPath) -> std::io::Result<()> {
        self.inner.rename(from, to).await
    }

    async fn truncate(&self, path: &BackendPath, size: u64) -> std::io::Result<()> {
        self.inner.truncate(path, size).await
    }

    async fn set_mode(&self, path: &BackendPath, mode: u32) -> std::io::Result<()> {
        self.inner.set_mode(path, mode).await
    }

    async fn set_owner(
        &self,
        path: &BackendPath,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> std::io::Result<()> {
        self.inner.set_owner(path, uid, gid).await
    }

    async fn set_times(
        &self,
        path: &BackendPath,
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) -> std::io::Result<()> {
        self.inner.set_times(path, atime, mtime).await
    }

    async fn readlink(&self, path: &BackendPath) -> std::io::Result<PathBuf> {
        self.inner.readlink(path).await
    }

    async fn statfs(&self, path: &BackendPath) -> std::io::Result<FsStats> {
        self.inner.statfs(path).await
    }
}

/// A backing tree, a cache directory, and a counting backend rooted at the
/// backing tree.
pub struct Fixture {
    pub backing: tempfile::TempDir,
    pub cache: tempfile::TempDir,
    pub backend: Arc<CountingBackend>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            backing: tempfile::tempdir().unwrap(),
            cache: tempfile::tempdir().unwrap(),
            backend: Arc::new(CountingBackend::new()),
        }
    }

    /// The backend root as the engine sees it.
    pub fn root(&self) -> BackendPath {
        BackendPath::root(self.backing.path().to_path_buf())
    }

    /// A backend path below the root.
    pub fn path(&self, relative: &str) -> BackendPath {
        self.root().descend(Path::new(relative)).unwrap()
    }

    /// Where the metadata store and blocks live. A subdirectory of the
    /// scratch dir, so the ownership-marker logic sees a directory it
    /// created itself.
    pub fn cache_root(&self) -> PathBuf {
        self.cache.path().join("cache")
    }

    /// Writes a file directly into the backing tree, bypassing the cache.
    pub fn seed_file(&self, relative: &str, contents: &[u8]) {
        let path = self.backing.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn seed_dir(&self, relative: &str) {
        std::fs::create_dir_all(self.backing.path().join(relative)).unwrap();
    }
}
