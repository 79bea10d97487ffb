//! Operation dispatcher: the face the filesystem gateway talks to.
//!
//! Each gateway callback lands here. The dispatcher translates the
//! gateway-visible path into a [`BackendPath`], routes the call through the
//! coherence engine (or straight to the backend when caching is disabled),
//! applies the caller's [`AttrMapper`] to returned attributes, and collapses
//! errors onto the gateway's errno channel.
//!
//! Cache initialization is lazy and modeled as an explicit state machine:
//! `Uninit -> Initializing -> Ready`, with `Ready -> Disabled` on a fatal
//! store error. In `Disabled` every operation is pure pass-through —
//! cache-internal failures are never allowed to become user-visible errors.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error};

use crate::backend::{Backend, BackendAttr, DirEntry, FileHandle, FsStats, OpenFlags};
use crate::coherence::CoherenceEngine;
use crate::config::MountConfig;
use crate::path::BackendPath;
use crate::stats::{CacheStats, StatsSnapshot};

/// Rewrites attributes between the backend's identity space and the
/// gateway's. Ownership and permission policy live outside this crate; the
/// default mapper passes attributes through unchanged.
pub trait AttrMapper: Send + Sync + 'static {
    fn map_attr(&self, attr: BackendAttr) -> BackendAttr {
        attr
    }
}

/// The pass-through mapper.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapper;

impl AttrMapper for IdentityMapper {}

/// Cache lifecycle of one mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    Uninit = 0,
    Initializing = 1,
    Ready = 2,
    Disabled = 3,
}

impl CacheState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninit,
            1 => Self::Initializing,
            2 => Self::Ready,
            _ => Self::Disabled,
        }
    }
}

/// Why a mount was refused outright. Unlike cache failures after mount,
/// these are surfaced: a misconfigured mount must not come up at all.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid configuration: {0:?}")]
    Config(Vec<String>),

    #[error("backing directory {path}: {source}")]
    BackendRoot {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn errno(e: &std::io::Error) -> i32 {
    if let Some(raw) = e.raw_os_error() {
        return raw;
    }
    match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        std::io::ErrorKind::InvalidInput => libc::EINVAL,
        _ => libc::EIO,
    }
}

/// The gateway-facing entry point for one mount.
pub struct Dispatcher<B: Backend, M: AttrMapper = IdentityMapper> {
    backend: Arc<B>,
    mapper: M,
    config: MountConfig,
    root: BackendPath,
    cache_root: PathBuf,
    state: AtomicU8,
    init_lock: tokio::sync::Mutex<()>,
    engine: OnceLock<CoherenceEngine<B>>,
    stats: Arc<CacheStats>,
}

impl<B: Backend> Dispatcher<B, IdentityMapper> {
    /// Builds a dispatcher with the identity attribute mapper.
    pub fn new(
        backend: Arc<B>,
        backing_dir: &Path,
        mount_point: &Path,
        config: MountConfig,
    ) -> Result<Self, MountError> {
        Self::with_mapper(backend, backing_dir, mount_point, config, IdentityMapper)
    }
}

impl<B: Backend, M: AttrMapper> Dispatcher<B, M> {
    /// Validates the configuration and fixes the path translation for this
    /// mount. Construction is cheap: the cache itself comes up lazily on
    /// the first operation that wants it.
    pub fn with_mapper(
        backend: Arc<B>,
        backing_dir: &Path,
        mount_point: &Path,
        config: MountConfig,
        mapper: M,
    ) -> Result<Self, MountError> {
        let canonical = std::fs::canonicalize(backing_dir).map_err(|source| {
            MountError::BackendRoot {
                path: backing_dir.to_path_buf(),
                source,
            }
        })?;

        config
            .validate(&canonical, mount_point)
            .map_err(MountError::Config)?;

        let cache_root = config.resolved_cache_root(&canonical);

        Ok(Self {
            backend,
            mapper,
            config,
            root: BackendPath::root(canonical),
            cache_root,
            state: AtomicU8::new(CacheState::Uninit as u8),
            init_lock: tokio::sync::Mutex::new(()),
            engine: OnceLock::new(),
            stats: Arc::new(CacheStats::new()),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn cache_state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Snapshot of the cache activity counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Block-store usage and budget, once the cache is up.
    #[must_use]
    pub fn block_stats(&self) -> Option<(u64, u64)> {
        self.engine.get().map(CoherenceEngine::block_stats)
    }

    /// Where this mount keeps its cache files.
    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    fn transition(&self, to: CacheState) {
        let from = self.state.swap(to as u8, Ordering::AcqRel);
        debug!(from = ?CacheState::from_u8(from), to = ?to, "cache state transition");
    }

    /// Marks the mount disabled after the engine reported a sticky store
    /// failure. Only the first caller performs the transition.
    fn disable(&self) {
        if self
            .state
            .compare_exchange(
                CacheState::Ready as u8,
                CacheState::Disabled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!("cache state transition: ready -> disabled");
        }
    }

    /// Returns the engine if caching is live, initializing it on first use.
    ///
    /// `None` means pass-through: either the mount is disabled or the cache
    /// could not be brought up (which disables it).
    async fn engine(&self) -> Option<&CoherenceEngine<B>> {
        match self.cache_state() {
            CacheState::Ready => {
                let engine = self.engine.get()?;
                if engine.is_degraded() {
                    self.disable();
                    return None;
                }
                Some(engine)
            }
            CacheState::Disabled => None,
            CacheState::Uninit | CacheState::Initializing => {
                let _guard = self.init_lock.lock().await;
                // Another caller may have finished (or failed) the init
                // while we waited on the lock.
                match self.cache_state() {
                    CacheState::Ready => return self.engine.get(),
                    CacheState::Disabled => return None,
                    CacheState::Uninit | CacheState::Initializing => {}
                }

                self.transition(CacheState::Initializing);
                let opened = CoherenceEngine::open(
                    Arc::clone(&self.backend),
                    &self.cache_root,
                    &self.config,
                    Arc::clone(&self.stats),
                )
                .await;

                match opened {
                    Ok(engine) => {
                        let stored = self.engine.set(engine);
                        debug_assert!(stored.is_ok(), "engine initialized twice");
                        self.transition(CacheState::Ready);
                        self.engine.get()
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            cache_root = %self.cache_root.display(),
                            "cache initialization failed; serving pass-through"
                        );
                        self.transition(CacheState::Disabled);
                        None
                    }
                }
            }
        }
    }

    fn translate(&self, gateway_path: &Path) -> Result<BackendPath, i32> {
        self.root.descend(gateway_path).ok_or(libc::EINVAL)
    }

    // -- Cached operations --

    pub async fn getattr(&self, gateway_path: &Path) -> Result<BackendAttr, i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.getattr(&path).await,
            None => self.backend.stat(&path).await,
        };
        result
            .map(|attr| self.mapper.map_attr(attr))
            .map_err(|e| errno(&e))
    }

    pub async fn readdir(&self, gateway_path: &Path) -> Result<Vec<DirEntry>, i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.readdir(&path).await,
            None => self.backend.readdir(&path).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn open(&self, gateway_path: &Path, flags: OpenFlags) -> Result<FileHandle, i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.open_file(&path, flags).await,
            None => self.backend.open(&path, flags).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn create(
        &self,
        gateway_path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<FileHandle, i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.create(&path, flags, mode).await,
            None => self.backend.create(&path, flags, mode).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn read(
        &self,
        gateway_path: &Path,
        fh: FileHandle,
        offset: u64,
        len: u32,
    ) -> Result<Bytes, i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.read(&path, fh, offset, len).await,
            None => self.backend.pread(fh, offset, len as usize).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn write(
        &self,
        gateway_path: &Path,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.write(&path, fh, offset, data).await,
            None => self.backend.pwrite(fh, offset, data).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn mkdir(&self, gateway_path: &Path, mode: u32) -> Result<(), i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.mkdir(&path, mode).await,
            None => self.backend.mkdir(&path, mode).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn symlink(&self, target: &Path, gateway_link: &Path) -> Result<(), i32> {
        let link = self.translate(gateway_link)?;
        let result = match self.engine().await {
            Some(engine) => engine.symlink(target, &link).await,
            None => self.backend.symlink(target, &link).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn link(&self, gateway_existing: &Path, gateway_new: &Path) -> Result<(), i32> {
        let existing = self.translate(gateway_existing)?;
        let new = self.translate(gateway_new)?;
        let result = match self.engine().await {
            Some(engine) => engine.link(&existing, &new).await,
            None => self.backend.link(&existing, &new).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn unlink(&self, gateway_path: &Path) -> Result<(), i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.unlink(&path).await,
            None => self.backend.unlink(&path).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn rmdir(&self, gateway_path: &Path) -> Result<(), i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.rmdir(&path).await,
            None => self.backend.rmdir(&path).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn rename(&self, gateway_from: &Path, gateway_to: &Path) -> Result<(), i32> {
        let from = self.translate(gateway_from)?;
        let to = self.translate(gateway_to)?;
        let result = match self.engine().await {
            Some(engine) => engine.rename(&from, &to).await,
            None => self.backend.rename(&from, &to).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn truncate(&self, gateway_path: &Path, size: u64) -> Result<(), i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.truncate(&path, size).await,
            None => self.backend.truncate(&path, size).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn set_mode(&self, gateway_path: &Path, mode: u32) -> Result<(), i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.set_mode(&path, mode).await,
            None => self.backend.set_mode(&path, mode).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn set_owner(
        &self,
        gateway_path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.set_owner(&path, uid, gid).await,
            None => self.backend.set_owner(&path, uid, gid).await,
        };
        result.map_err(|e| errno(&e))
    }

    pub async fn set_times(
        &self,
        gateway_path: &Path,
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) -> Result<(), i32> {
        let path = self.translate(gateway_path)?;
        let result = match self.engine().await {
            Some(engine) => engine.set_times(&path, atime, mtime).await,
            None => self.backend.set_times(&path, atime, mtime).await,
        };
        result.map_err(|e| errno(&e))
    }

    // -- Uncached operations: always straight to the backend --

    pub async fn readlink(&self, gateway_path: &Path) -> Result<PathBuf, i32> {
        let path = self.translate(gateway_path)?;
        self.backend.readlink(&path).await.map_err(|e| errno(&e))
    }

    pub async fn fsync(&self, fh: FileHandle, datasync: bool) -> Result<(), i32> {
        self.backend
            .fsync(fh, datasync)
            .await
            .map_err(|e| errno(&e))
    }

    pub async fn release(&self, fh: FileHandle) -> Result<(), i32> {
        self.backend.close(fh).await.map_err(|e| errno(&e))
    }

    pub async fn statfs(&self, gateway_path: &Path) -> Result<FsStats, i32> {
        let path = self.translate(gateway_path)?;
        self.backend.statfs(&path).await.map_err(|e| errno(&e))
    }
}
