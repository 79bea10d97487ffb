//! Backend adapter: the raw POSIX surface of the backing directory.
//!
//! [`Backend`] is the seam between the cache core and the slow directory it
//! fronts. It makes no caching decisions; every call goes to the backing
//! path and every failure surfaces the originating errno unchanged through
//! `std::io::Error`. [`LocalBackend`] is the production implementation;
//! tests substitute mocks to count and script backend traffic.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;

/// Opaque handle for an open backend file.
pub type FileHandle = u64;

bitflags! {
    /// Open flags forwarded from the gateway.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        // Access modes (mutually exclusive)
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;

        // Creation/status flags
        const APPEND = libc::O_APPEND;
        const TRUNC = libc::O_TRUNC;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;

        // Behavior flags
        const NOFOLLOW = libc::O_NOFOLLOW;
        const CLOEXEC = libc::O_CLOEXEC;
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    /// Whether these flags request write access.
    #[must_use]
    pub fn writable(self) -> bool {
        self.contains(Self::WRONLY) || self.contains(Self::RDWR)
    }
}

/// The kind of a backing filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    /// Device nodes, sockets, fifos — passed through, never block-cached.
    Other,
}

impl From<std::fs::FileType> for EntryKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_file() {
            Self::File
        } else if ft.is_dir() {
            Self::Dir
        } else if ft.is_symlink() {
            Self::Symlink
        } else {
            Self::Other
        }
    }
}

/// Attributes of a backing entry, as one lstat reports them.
///
/// Timestamps carry nanosecond precision: directory revalidation compares
/// mtimes for equality, and a seconds-only value would confuse "modified in
/// the same second" with "unchanged".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendAttr {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Live inode number. Never cached — see the coherence rules.
    pub ino: u64,
}

impl From<&std::fs::Metadata> for BackendAttr {
    fn from(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt as _;

        fn nanos(secs: i64, nsecs: i64) -> i64 {
            secs.saturating_mul(1_000_000_000).saturating_add(nsecs)
        }

        Self {
            kind: meta.file_type().into(),
            size: meta.len(),
            mtime_ns: nanos(meta.mtime(), meta.mtime_nsec()),
            ctime_ns: nanos(meta.ctime(), meta.ctime_nsec()),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            ino: meta.ino(),
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

/// Filesystem-level statistics, passed through from the backing mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u64,
    pub fragment_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub available_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub max_filename_length: u64,
}

use crate::path::BackendPath;

/// Raw operations on the backing directory.
///
/// Implementations must be safe for parallel invocation on distinct paths
/// and for concurrent reads on the same handle.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn stat(&self, path: &BackendPath) -> std::io::Result<BackendAttr>;

    async fn readdir(&self, path: &BackendPath) -> std::io::Result<Vec<DirEntry>>;

    async fn open(&self, path: &BackendPath, flags: OpenFlags) -> std::io::Result<FileHandle>;

    /// Open-and-create. The separate entry point lets the caller treat
    /// creation as a mutation even when the open flags are identical.
    async fn create(
        &self,
        path: &BackendPath,
        flags: OpenFlags,
        mode: u32,
    ) -> std::io::Result<FileHandle>;

    async fn pread(&self, fh: FileHandle, offset: u64, len: usize) -> std::io::Result<Bytes>;

    async fn pwrite(&self, fh: FileHandle, offset: u64, data: &[u8]) -> std::io::Result<usize>;

    async fn fsync(&self, fh: FileHandle, datasync: bool) -> std::io::Result<()>;

    async fn close(&self, fh: FileHandle) -> std::io::Result<()>;

    async fn mkdir(&self, path: &BackendPath, mode: u32) -> std::io::Result<()>;

    async fn symlink(&self, target: &Path, link: &BackendPath) -> std::io::Result<()>;

    async fn link(&self, existing: &BackendPath, new: &BackendPath) -> std::io::Result<()>;

    async fn unlink(&self, path: &BackendPath) -> std::io::Result<()>;

    async fn rmdir(&self, path: &BackendPath) -> std::io::Result<()>;

    async fn rename(&self, from: &BackendPath, to: &BackendPath) -> std::io::Result<()>;

    async fn truncate(&self, path: &BackendPath, size: u64) -> std::io::Result<()>;

    async fn set_mode(&self, path: &BackendPath, mode: u32) -> std::io::Result<()>;

    async fn set_owner(
        &self,
        path: &BackendPath,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> std::io::Result<()>;

    async fn set_times(
        &self,
        path: &BackendPath,
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) -> std::io::Result<()>;

    async fn readlink(&self, path: &BackendPath) -> std::io::Result<PathBuf>;

    async fn statfs(&self, path: &BackendPath) -> std::io::Result<FsStats>;
}

/// [`Backend`] over an ordinary local directory (which is how remote shares
/// such as SMB or NFS appear once the OS has mounted them).
///
/// Open files live in a concurrent handle table as `Arc<std::fs::File>`;
/// positioned reads and writes run on the blocking pool with
/// `FileExt::read_at`/`write_at`, so concurrent operations on one handle
/// never fight over a shared seek position.
pub struct LocalBackend {
    open_files: scc::HashMap<FileHandle, Arc<std::fs::File>>,
    next_fh: AtomicU64,
}

impl LocalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            open_files: scc::HashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    fn lookup_handle(&self, fh: FileHandle) -> std::io::Result<Arc<std::fs::File>> {
        self.open_files
            .read(&fh, |_, file| Arc::clone(file))
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EBADF))
    }

    fn register(&self, file: std::fs::File) -> FileHandle {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let existing = self.open_files.insert(fh, Arc::new(file));
        debug_assert!(existing.is_ok(), "file handle {fh} reused");
        fh
    }

    fn open_options(flags: OpenFlags, mode: Option<u32>) -> tokio::fs::OpenOptions {
        use std::os::unix::fs::OpenOptionsExt as _;

        let mut opts = tokio::fs::OpenOptions::new();
        opts.read(!flags.contains(OpenFlags::WRONLY))
            .write(flags.writable())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNC))
            .create(flags.contains(OpenFlags::CREAT))
            .create_new(flags.contains(OpenFlags::EXCL) && flags.contains(OpenFlags::CREAT));
        if let Some(mode) = mode {
            opts.mode(mode);
        }
        opts
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn stat(&self, path: &BackendPath) -> std::io::Result<BackendAttr> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        Ok(BackendAttr::from(&meta))
    }

    async fn readdir(&self, path: &BackendPath) -> std::io::Result<Vec<DirEntry>> {
        let mut reader = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            entries.push(DirEntry {
                name: entry.file_name(),
                kind: entry.file_type().await?.into(),
            });
        }
        Ok(entries)
    }

    async fn open(&self, path: &BackendPath, flags: OpenFlags) -> std::io::Result<FileHandle> {
        let file = Self::open_options(flags, None).open(path).await?;
        Ok(self.register(file.into_std().await))
    }

    async fn create(
        &self,
        path: &BackendPath,
        flags: OpenFlags,
        mode: u32,
    ) -> std::io::Result<FileHandle> {
        let file = Self::open_options(flags | OpenFlags::CREAT, Some(mode))
            .open(path)
            .await?;
        Ok(self.register(file.into_std().await))
    }

    async fn pread(&self, fh: FileHandle, offset: u64, len: usize) -> std::io::Result<Bytes> {
        use std::os::unix::fs::FileExt as _;

        let file = self.lookup_handle(fh)?;
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|join| std::io::Error::other(join))?
    }

    async fn pwrite(&self, fh: FileHandle, offset: u64, data: &[u8]) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt as _;

        let file = self.lookup_handle(fh)?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            file.write_all_at(&data, offset)?;
            Ok(data.len())
        })
        .await
        .map_err(|join| std::io::Error::other(join))?
    }

    async fn fsync(&self, fh: FileHandle, datasync: bool) -> std::io::Result<()> {
        let file = self.lookup_handle(fh)?;
        tokio::task::spawn_blocking(move || {
            if datasync {
                file.sync_data()
            } else {
                file.sync_all()
            }
        })
        .await
        .map_err(|join| std::io::Error::other(join))?
    }

    async fn close(&self, fh: FileHandle) -> std::io::Result<()> {
        self.open_files
            .remove(&fh)
            .map(|_| ())
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EBADF))
    }

    async fn mkdir(&self, path: &BackendPath, mode: u32) -> std::io::Result<()> {
        use std::os::unix::fs::DirBuilderExt as _;

        let path = path.as_path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::DirBuilder::new().mode(mode).create(&path)
        })
        .await
        .map_err(|join| std::io::Error::other(join))?
    }

    async fn symlink(&self, target: &Path, link: &BackendPath) -> std::io::Result<()> {
        tokio::fs::symlink(target, link).await
    }

    async fn link(&self, existing: &BackendPath, new: &BackendPath) -> std::io::Result<()> {
        tokio::fs::hard_link(existing, new).await
    }

    async fn unlink(&self, path: &BackendPath) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn rmdir(&self, path: &BackendPath) -> std::io::Result<()> {
        tokio::fs::remove_dir(path).await
    }

    async fn rename(&self, from: &BackendPath, to: &BackendPath) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn truncate(&self, path: &BackendPath, size: u64) -> std::io::Result<()> {
        let path = path.as_path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            file.set_len(size)
        })
        .await
        .map_err(|join| std::io::Error::other(join))?
    }

    async fn set_mode(&self, path: &BackendPath, mode: u32) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt as _;

        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
    }

    async fn set_owner(
        &self,
        path: &BackendPath,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> std::io::Result<()> {
        let path = path.as_path().to_path_buf();
        tokio::task::spawn_blocking(move || std::os::unix::fs::chown(&path, uid, gid))
            .await
            .map_err(|join| std::io::Error::other(join))?
    }

    async fn set_times(
        &self,
        path: &BackendPath,
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) -> std::io::Result<()> {
        let path = path.as_path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::options().write(true).open(&path)?;
            let mut times = std::fs::FileTimes::new();
            if let Some(atime) = atime {
                times = times.set_accessed(atime);
            }
            if let Some(mtime) = mtime {
                times = times.set_modified(mtime);
            }
            file.set_times(times)
        })
        .await
        .map_err(|join| std::io::Error::other(join))?
    }

    async fn readlink(&self, path: &BackendPath) -> std::io::Result<PathBuf> {
        tokio::fs::read_link(path).await
    }

    async fn statfs(&self, path: &BackendPath) -> std::io::Result<FsStats> {
        let stat = nix::sys::statvfs::statvfs(path.as_path())?;

        // Field widths differ across platforms, so widen everything.
        #[allow(clippy::useless_conversion, reason = "u64 already on 64-bit targets")]
        let stats = FsStats {
            block_size: u64::from(stat.block_size()),
            fragment_size: u64::from(stat.fragment_size()),
            total_blocks: u64::from(stat.blocks()),
            free_blocks: u64::from(stat.blocks_free()),
            available_blocks: u64::from(stat.blocks_available()),
            total_inodes: u64::from(stat.files()),
            free_inodes: u64::from(stat.files_free()),
            max_filename_length: u64::from(stat.name_max()),
        };
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_kind_from_file_type() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::symlink_metadata(&file).unwrap();
        assert_eq!(EntryKind::from(meta.file_type()), EntryKind::File);

        let meta = std::fs::symlink_metadata(tmp.path()).unwrap();
        assert_eq!(EntryKind::from(meta.file_type()), EntryKind::Dir);
    }

    #[test]
    fn attr_carries_nanosecond_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"hello").unwrap();
        let meta = std::fs::symlink_metadata(&file).unwrap();
        let attr = BackendAttr::from(&meta);

        assert_eq!(attr.size, 5);
        use std::os::unix::fs::MetadataExt as _;
        assert_eq!(
            attr.mtime_ns,
            meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
        );
    }

    #[tokio::test]
    async fn pread_reads_at_offset_without_seeking() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"0123456789").unwrap();

        let backend = LocalBackend::new();
        let path = BackendPath::root(file);
        let fh = backend.open(&path, OpenFlags::RDONLY).await.unwrap();

        // Interleaved offsets on one handle must not disturb each other.
        let a = backend.pread(fh, 2, 3).await.unwrap();
        let b = backend.pread(fh, 0, 4).await.unwrap();
        assert_eq!(&a[..], b"234");
        assert_eq!(&b[..], b"0123");

        backend.close(fh).await.unwrap();
    }

    #[tokio::test]
    async fn pread_past_eof_returns_short() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"abc").unwrap();

        let backend = LocalBackend::new();
        let path = BackendPath::root(file);
        let fh = backend.open(&path, OpenFlags::RDONLY).await.unwrap();

        assert_eq!(&backend.pread(fh, 1, 100).await.unwrap()[..], b"bc");
        assert!(backend.pread(fh, 10, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_handle_is_ebadf() {
        let backend = LocalBackend::new();
        let err = backend.pread(999, 0, 1).await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
