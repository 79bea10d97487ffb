//! Coherence engine: decides, per operation, whether to serve from cache,
//! revalidate, or invalidate, and owns the write-through protocol.
//!
//! The ordering rule for every mutation is absolute: the backend call must
//! succeed before any cache state is touched. A backend failure leaves the
//! cache exactly as it was; a cache failure after backend success is logged
//! and absorbed, because the backend already holds truth and TTLs recover
//! the rest.
//!
//! Metadata-store structural failures flip the engine into a degraded mode
//! where every call is served pass-through. The flag is sticky for the
//! lifetime of the mount; the dispatcher observes it and stops routing
//! through the engine entirely.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::backend::{Backend, BackendAttr, DirEntry, FileHandle, OpenFlags};
use crate::blocks::{BlockStore, block_span};
use crate::config::MountConfig;
use crate::meta::{AttrLookup, CachedKind, MetaStore, StoreFailure};
use crate::path::BackendPath;
use crate::stats::CacheStats;

/// Marker file planted in the cache root so a later mount can tell its own
/// cache directory from an arbitrary directory it must not scan or evict.
const CACHE_MARKER: &str = ".nearfs-cache";

/// Why the cache could not be brought up. The mount itself survives; the
/// dispatcher serves pass-through instead.
#[derive(Debug, Error)]
pub enum CacheInitError {
    #[error("cache root {0} contains data from another source")]
    ForeignCacheRoot(PathBuf),

    #[error("io error preparing cache root: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreFailure),
}

/// A successful backend mutation, for the post-mutation cache hook.
#[derive(Debug, Clone, Copy)]
enum Mutation<'a> {
    Write {
        path: &'a BackendPath,
        offset: u64,
        len: u64,
        known_existing: bool,
    },
    PathCreated {
        path: &'a BackendPath,
    },
    LinkCreated {
        existing: &'a BackendPath,
        new: &'a BackendPath,
    },
    Removed {
        path: &'a BackendPath,
        dir: bool,
    },
    Renamed {
        from: &'a BackendPath,
        to: &'a BackendPath,
    },
    Truncated {
        path: &'a BackendPath,
    },
    AttrChanged {
        path: &'a BackendPath,
    },
}

/// The cache decision layer for one mount.
pub struct CoherenceEngine<B: Backend> {
    backend: Arc<B>,
    meta: MetaStore,
    blocks: BlockStore,
    stats: Arc<CacheStats>,
    meta_cache: bool,
    debug_events: bool,
    degraded: AtomicBool,
}

fn enoent() -> std::io::Error {
    std::io::Error::from_raw_os_error(libc::ENOENT)
}

fn is_enoent(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOENT) || e.kind() == std::io::ErrorKind::NotFound
}

impl<B: Backend> CoherenceEngine<B> {
    /// Brings up the metadata and block stores under the given cache root.
    ///
    /// The root is created with owner-only permissions. A non-empty root
    /// without our marker is refused: scanning and evicting inside a
    /// directory we do not own would be destructive.
    pub async fn open(
        backend: Arc<B>,
        cache_root: &Path,
        config: &MountConfig,
        stats: Arc<CacheStats>,
    ) -> Result<Self, CacheInitError> {
        prepare_cache_root(cache_root).await?;

        let meta = MetaStore::open(cache_root, config.ttls())?;
        let blocks = BlockStore::open(
            cache_root,
            config.block_size_bytes,
            config.max_cache_bytes(),
            Arc::clone(&stats),
            config.cache_debug,
        )
        .await?;

        Ok(Self {
            backend,
            meta,
            blocks,
            stats,
            meta_cache: config.meta_cache,
            debug_events: config.cache_debug,
            degraded: AtomicBool::new(false),
        })
    }

    /// Whether the metadata store has failed structurally. Sticky.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Current block-store usage and budget.
    #[must_use]
    pub fn block_stats(&self) -> (u64, u64) {
        self.blocks.stats()
    }

    fn degrade(&self, failure: &StoreFailure) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            error!(
                error = %failure,
                "metadata store failed; cache disabled for this mount, serving pass-through"
            );
        }
    }

    // -- Guarded store access: transient errors were already absorbed by
    // -- the store, so any error here is structural and degrades the mount.

    fn attr_lookup(&self, path: &BackendPath) -> AttrLookup {
        if self.is_degraded() {
            return AttrLookup::Miss;
        }
        match self.meta.lookup_attr(path) {
            Ok(lookup) => lookup,
            Err(failure) => {
                self.degrade(&failure);
                AttrLookup::Miss
            }
        }
    }

    fn attr_put(&self, path: &BackendPath, attr: &BackendAttr) {
        if self.is_degraded() {
            return;
        }
        if let Err(failure) = self.meta.put_attr(path, attr) {
            self.degrade(&failure);
        }
    }

    fn attr_put_negative(&self, path: &BackendPath) {
        if self.is_degraded() {
            return;
        }
        if let Err(failure) = self.meta.put_negative(path) {
            self.degrade(&failure);
        }
    }

    fn attr_invalidate(&self, path: &BackendPath) {
        if self.is_degraded() {
            return;
        }
        if let Err(failure) = self.meta.invalidate_attr(path) {
            self.degrade(&failure);
        }
    }

    fn dir_invalidate(&self, path: &BackendPath) {
        if self.is_degraded() {
            return;
        }
        if let Err(failure) = self.meta.invalidate_dir(path) {
            self.degrade(&failure);
        }
    }

    fn parent_dir_invalidate(&self, path: &BackendPath) {
        if let Some(parent) = path.parent() {
            self.dir_invalidate(&parent);
        }
    }

    async fn blocks_invalidate_file(&self, path: &BackendPath) {
        if let Err(e) = self.blocks.invalidate_file(path).await {
            // Stale blocks are dropped on the next revalidation instead.
            warn!(path = %path, error = %e, "block invalidation failed");
        }
    }

    async fn blocks_invalidate_range(&self, path: &BackendPath, offset: u64, len: u64) {
        if let Err(e) = self.blocks.invalidate_range(path, offset, len).await {
            warn!(path = %path, offset, len, error = %e, "block range invalidation failed");
        }
    }

    // -- Attribute queries --

    /// The attribute protocol: negative hits answer without backend
    /// traffic; positive hits are confirmed against a live stat (which also
    /// supplies the inode number — inodes are never served from cache);
    /// misses populate the cache.
    pub async fn getattr(&self, path: &BackendPath) -> std::io::Result<BackendAttr> {
        if !self.meta_cache || self.is_degraded() {
            return self.backend.stat(path).await;
        }

        match self.attr_lookup(path) {
            AttrLookup::Hit { record, valid } if valid => {
                if record.kind == CachedKind::Negative {
                    self.stats.meta_hit();
                    if self.debug_events {
                        debug!(path = %path, "negative hit");
                    }
                    return Err(enoent());
                }

                match self.backend.stat(path).await {
                    Ok(live) => {
                        if live.mtime_ns == record.mtime_ns && live.size == record.size {
                            self.stats.meta_hit();
                            if self.debug_events {
                                debug!(path = %path, "attribute hit");
                            }
                            Ok(record.to_attr(live.ino))
                        } else {
                            // Changed behind our back: drop everything we
                            // hold for the path and re-seed from the probe.
                            self.stats.invalidated();
                            self.stats.meta_miss();
                            if self.debug_events {
                                debug!(path = %path, "attribute stale, invalidating");
                            }
                            self.attr_invalidate(path);
                            self.blocks_invalidate_file(path).await;
                            self.attr_put(path, &live);
                            Ok(live)
                        }
                    }
                    Err(e) if is_enoent(&e) => {
                        self.stats.invalidated();
                        self.attr_invalidate(path);
                        self.blocks_invalidate_file(path).await;
                        self.attr_put_negative(path);
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => {
                self.stats.meta_miss();
                if self.debug_events {
                    debug!(path = %path, "attribute miss");
                }
                match self.backend.stat(path).await {
                    Ok(live) => {
                        self.attr_put(path, &live);
                        Ok(live)
                    }
                    Err(e) if is_enoent(&e) => {
                        // A negative record may never coexist with blocks.
                        self.blocks_invalidate_file(path).await;
                        self.attr_put_negative(path);
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    // -- Directory listings --

    /// Serves a listing from cache only when its TTL is live *and* the
    /// directory's current mtime still equals the captured one.
    pub async fn readdir(&self, path: &BackendPath) -> std::io::Result<Vec<DirEntry>> {
        let dir_attr = self.backend.stat(path).await?;

        if !self.is_degraded() {
            let cached = match self.meta.lookup_dir(path) {
                Ok(cached) => cached,
                Err(failure) => {
                    self.degrade(&failure);
                    None
                }
            };
            if let Some(listing) = cached
                && listing.valid
                && listing.dir_mtime_ns == dir_attr.mtime_ns
            {
                self.stats.dir_hit();
                if self.debug_events {
                    debug!(path = %path, entries = listing.entries.len(), "listing hit");
                }
                return Ok(listing.entries);
            }
        }

        self.stats.dir_miss();
        if self.debug_events {
            debug!(path = %path, "listing miss");
        }
        let entries = self.backend.readdir(path).await?;
        if !self.is_degraded()
            && let Err(failure) = self.meta.put_dir(path, &entries, dir_attr.mtime_ns)
        {
            self.degrade(&failure);
        }
        Ok(entries)
    }

    // -- Open / read / write --

    /// Open-time revalidation gives close-to-open consistency: the
    /// attribute protocol runs first, and its stale branch drops the path's
    /// blocks before the backend handle is returned.
    pub async fn open_file(
        &self,
        path: &BackendPath,
        flags: OpenFlags,
    ) -> std::io::Result<FileHandle> {
        if self.meta_cache {
            match self.getattr(path).await {
                Ok(_) => {}
                Err(e) if is_enoent(&e) && flags.contains(OpenFlags::CREAT) => {}
                Err(e) => return Err(e),
            }
        } else {
            // No cached mtime to compare against, so the only safe reading
            // of close-to-open is to drop the blocks on every open.
            self.blocks_invalidate_file(path).await;
        }

        let fh = self.backend.open(path, flags).await?;

        if flags.contains(OpenFlags::TRUNC) {
            self.note_mutation(Mutation::Truncated { path }).await;
        }
        if flags.contains(OpenFlags::CREAT) {
            self.note_mutation(Mutation::PathCreated { path }).await;
        }
        Ok(fh)
    }

    /// Creates (and opens) a regular file.
    pub async fn create(
        &self,
        path: &BackendPath,
        flags: OpenFlags,
        mode: u32,
    ) -> std::io::Result<FileHandle> {
        let fh = self.backend.create(path, flags, mode).await?;
        if flags.contains(OpenFlags::TRUNC) {
            self.note_mutation(Mutation::Truncated { path }).await;
        }
        self.note_mutation(Mutation::PathCreated { path }).await;
        Ok(fh)
    }

    /// Serves a read block-by-block: cached blocks from disk, missing
    /// blocks from the backend (cached on the way through). A short block
    /// means end-of-file and stops assembly.
    pub async fn read(
        &self,
        path: &BackendPath,
        fh: FileHandle,
        offset: u64,
        len: u32,
    ) -> std::io::Result<Bytes> {
        let len = u64::from(len);
        if len == 0 {
            return Ok(Bytes::new());
        }
        if self.is_degraded() {
            return self.backend.pread(fh, offset, len as usize).await;
        }

        let block_size = self.blocks.block_size();
        let Some((first, last)) = block_span(offset, len, block_size) else {
            return Ok(Bytes::new());
        };

        let mut out = BytesMut::with_capacity(len as usize);
        for index in first..=last {
            let block_start = index * block_size;
            let want_from = offset.max(block_start) - block_start;
            let want_to = (offset + len).min(block_start + block_size) - block_start;
            let want_len = (want_to - want_from) as usize;

            if let Some(chunk) = self.blocks.read(path, index, want_from, want_len).await {
                self.stats.block_hit();
                if self.debug_events {
                    debug!(path = %path, index, len = chunk.len(), "block hit");
                }
                let short = chunk.len() < want_len;
                out.extend_from_slice(&chunk);
                if short {
                    break;
                }
                continue;
            }

            self.stats.block_miss();
            if self.debug_events {
                debug!(path = %path, index, "block miss");
            }
            let fetched = self
                .backend
                .pread(fh, block_start, block_size as usize)
                .await?;
            if !fetched.is_empty()
                && let Err(e) = self.blocks.write(path, index, &fetched).await
            {
                // Losing the cache write only loses future hits; the bytes
                // below still come from the backend fetch.
                warn!(path = %path, index, error = %e, "block store write failed");
            }

            let slice_from = (want_from as usize).min(fetched.len());
            let slice_to = (want_to as usize).min(fetched.len());
            out.extend_from_slice(&fetched[slice_from..slice_to]);
            if fetched.len() < block_size as usize {
                break;
            }
        }

        Ok(out.freeze())
    }

    /// Write-through: the backend write happens first and alone decides
    /// success. Only then are the overlapping blocks and the attribute
    /// record dropped; the parent listing falls only when the write may
    /// have brought the file into existence.
    pub async fn write(
        &self,
        path: &BackendPath,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> std::io::Result<usize> {
        let known_existing = match self.attr_lookup(path) {
            AttrLookup::Hit { record, .. } => {
                record.kind != CachedKind::Negative && record.size > 0
            }
            AttrLookup::Miss => false,
        };

        let written = self.backend.pwrite(fh, offset, data).await?;

        self.note_mutation(Mutation::Write {
            path,
            offset,
            len: written as u64,
            known_existing,
        })
        .await;
        Ok(written)
    }

    // -- Namespace mutations: backend first, then the post-mutation hook --

    pub async fn mkdir(&self, path: &BackendPath, mode: u32) -> std::io::Result<()> {
        self.backend.mkdir(path, mode).await?;
        self.note_mutation(Mutation::PathCreated { path }).await;
        Ok(())
    }

    pub async fn symlink(&self, target: &Path, link: &BackendPath) -> std::io::Result<()> {
        self.backend.symlink(target, link).await?;
        self.note_mutation(Mutation::PathCreated { path: link }).await;
        Ok(())
    }

    pub async fn link(&self, existing: &BackendPath, new: &BackendPath) -> std::io::Result<()> {
        self.backend.link(existing, new).await?;
        self.note_mutation(Mutation::LinkCreated { existing, new })
            .await;
        Ok(())
    }

    pub async fn unlink(&self, path: &BackendPath) -> std::io::Result<()> {
        self.backend.unlink(path).await?;
        self.note_mutation(Mutation::Removed { path, dir: false })
            .await;
        Ok(())
    }

    pub async fn rmdir(&self, path: &BackendPath) -> std::io::Result<()> {
        self.backend.rmdir(path).await?;
        self.note_mutation(Mutation::Removed { path, dir: true })
            .await;
        Ok(())
    }

    pub async fn rename(&self, from: &BackendPath, to: &BackendPath) -> std::io::Result<()> {
        self.backend.rename(from, to).await?;
        self.note_mutation(Mutation::Renamed { from, to }).await;
        Ok(())
    }

    pub async fn truncate(&self, path: &BackendPath, size: u64) -> std::io::Result<()> {
        self.backend.truncate(path, size).await?;
        self.note_mutation(Mutation::Truncated { path }).await;
        Ok(())
    }

    pub async fn set_mode(&self, path: &BackendPath, mode: u32) -> std::io::Result<()> {
        self.backend.set_mode(path, mode).await?;
        self.note_mutation(Mutation::AttrChanged { path }).await;
        Ok(())
    }

    pub async fn set_owner(
        &self,
        path: &BackendPath,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> std::io::Result<()> {
        self.backend.set_owner(path, uid, gid).await?;
        self.note_mutation(Mutation::AttrChanged { path }).await;
        Ok(())
    }

    pub async fn set_times(
        &self,
        path: &BackendPath,
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) -> std::io::Result<()> {
        self.backend.set_times(path, atime, mtime).await?;
        self.note_mutation(Mutation::AttrChanged { path }).await;
        Ok(())
    }

    /// The single place cache state reacts to a successful mutation.
    ///
    /// Every arm only ever *removes* cache state, so any interleaving of
    /// concurrent mutations converges on a correct (possibly pessimistic)
    /// cache.
    async fn note_mutation(&self, mutation: Mutation<'_>) {
        if self.is_degraded() {
            return;
        }
        if self.debug_events {
            debug!(?mutation, "invalidating after mutation");
        }
        self.stats.invalidated();

        match mutation {
            Mutation::Write {
                path,
                offset,
                len,
                known_existing,
            } => {
                self.blocks_invalidate_range(path, offset, len).await;
                self.attr_invalidate(path);
                if !known_existing {
                    self.parent_dir_invalidate(path);
                }
            }
            Mutation::PathCreated { path } => {
                self.attr_invalidate(path);
                self.parent_dir_invalidate(path);
            }
            Mutation::LinkCreated { existing, new } => {
                self.attr_invalidate(existing);
                self.attr_invalidate(new);
                self.parent_dir_invalidate(new);
            }
            Mutation::Removed { path, dir } => {
                self.attr_invalidate(path);
                self.blocks_invalidate_file(path).await;
                self.parent_dir_invalidate(path);
                if dir {
                    self.dir_invalidate(path);
                }
            }
            Mutation::Renamed { from, to } => {
                self.attr_invalidate(from);
                self.attr_invalidate(to);
                self.blocks_invalidate_file(from).await;
                self.blocks_invalidate_file(to).await;
                self.parent_dir_invalidate(from);
                self.parent_dir_invalidate(to);
                // A renamed directory carries its listing with it.
                self.dir_invalidate(from);
                self.dir_invalidate(to);
            }
            Mutation::Truncated { path } => {
                self.blocks_invalidate_file(path).await;
                self.attr_invalidate(path);
            }
            Mutation::AttrChanged { path } => {
                self.attr_invalidate(path);
            }
        }
    }
}

/// Creates the cache root (0700) and claims it with the marker file.
///
/// A non-empty directory without the marker is refused rather than adopted.
async fn prepare_cache_root(cache_root: &Path) -> Result<(), CacheInitError> {
    use std::os::unix::fs::DirBuilderExt as _;

    let root = cache_root.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), CacheInitError> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&root)?;

        let marker = root.join(CACHE_MARKER);
        if !marker.exists() {
            let is_empty = std::fs::read_dir(&root)?.next().is_none();
            if !is_empty {
                return Err(CacheInitError::ForeignCacheRoot(root));
            }
            std::fs::write(&marker, b"")?;
        }
        Ok(())
    })
    .await
    .map_err(|join| CacheInitError::Io(std::io::Error::other(join)))?
}
