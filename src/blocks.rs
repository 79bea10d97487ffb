//! Persistent block store: one file per fixed-size content block, with
//! atime-ordered LRU eviction under a byte budget.
//!
//! Blocks live at `blocks/<xx>/<yy>/<16-hex-hash>-<index>` where the hash is
//! the stable DJB2 of the backend path and `xx`/`yy` are two bytes of it, so
//! no single directory grows unbounded. Block files are replaced atomically
//! (temp file + rename); readers holding an open handle keep reading the old
//! bytes, which makes eviction and invalidation safe against concurrent
//! reads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::path::BackendPath;
use crate::stats::CacheStats;

const BLOCKS_DIR: &str = "blocks";

/// Fraction of the budget eviction drives usage down to, in percent.
const EVICTION_TARGET_PERCENT: u64 = 90;

/// Compute the inclusive block span covered by `[offset, offset + len)`.
///
/// Returns `None` for an empty range.
#[must_use]
pub fn block_span(offset: u64, len: u64, block_size: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let first = offset / block_size;
    let last = (offset + len - 1) / block_size;
    Some((first, last))
}

/// The on-disk block cache for one mount.
pub struct BlockStore {
    blocks_dir: PathBuf,
    block_size: u64,
    max_bytes: u64,
    /// Rough running total of stored bytes. Kept close to truth by
    /// adjusting on every write, unlink, and eviction; seeded by a full
    /// scan at open.
    current_bytes: AtomicU64,
    /// Serializes eviction passes with one another and with the budget
    /// check that follows each write.
    evict_lock: tokio::sync::Mutex<()>,
    tmp_counter: AtomicU64,
    stats: Arc<CacheStats>,
    debug_events: bool,
}

impl BlockStore {
    /// Opens the block store under `cache_root`, creating the fan-out root
    /// and seeding the byte counter from whatever blocks already exist.
    pub async fn open(
        cache_root: &Path,
        block_size: u64,
        max_bytes: u64,
        stats: Arc<CacheStats>,
        debug_events: bool,
    ) -> std::io::Result<Self> {
        let blocks_dir = cache_root.join(BLOCKS_DIR);
        create_dir_private(&blocks_dir).await?;

        let store = Self {
            blocks_dir,
            block_size,
            max_bytes,
            current_bytes: AtomicU64::new(0),
            evict_lock: tokio::sync::Mutex::new(()),
            tmp_counter: AtomicU64::new(0),
            stats,
            debug_events,
        };

        let mut total = 0;
        for (_, meta) in store.collect_blocks().await? {
            total += meta.len();
        }
        store.current_bytes.store(total, Ordering::Relaxed);

        Ok(store)
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Current usage and configured budget, in bytes. A budget of zero
    /// means unbounded.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.current_bytes.load(Ordering::Relaxed), self.max_bytes)
    }

    /// `blocks/<xx>/<yy>` for a path hash.
    fn fan_dir(&self, hash: u64) -> PathBuf {
        let h1 = (hash >> 8) & 0xff;
        let h2 = hash & 0xff;
        self.blocks_dir.join(format!("{h1:02x}")).join(format!("{h2:02x}"))
    }

    fn block_file(&self, hash: u64, index: u64) -> PathBuf {
        self.fan_dir(hash).join(format!("{hash:016x}-{index}"))
    }

    /// Whether a block is present. Presence is advisory: a concurrent
    /// invalidation may remove the block before a following read.
    pub async fn exists(&self, path: &BackendPath, index: u64) -> bool {
        tokio::fs::metadata(self.block_file(path.hash(), index))
            .await
            .is_ok()
    }

    /// Reads up to `len` bytes starting at `offset_in_block` from a cached
    /// block. Returns `None` on a miss; a cached short block returns fewer
    /// bytes than requested, which the caller interprets as end-of-file.
    ///
    /// I/O errors other than not-found are logged and reported as a miss:
    /// the caller falls back to the backend, which is always correct.
    pub async fn read(
        &self,
        path: &BackendPath,
        index: u64,
        offset_in_block: u64,
        len: usize,
    ) -> Option<Bytes> {
        use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

        let file_path = self.block_file(path.hash(), index);
        let mut file = match tokio::fs::File::open(&file_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path, index, error = %e, "block open failed, treating as miss");
                return None;
            }
        };

        let result: std::io::Result<Bytes> = async {
            file.seek(std::io::SeekFrom::Start(offset_in_block)).await?;
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        }
        .await;

        match result {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(path = %path, index, error = %e, "block read failed, treating as miss");
                None
            }
        }
    }

    /// Stores a block, replacing any previous content atomically.
    ///
    /// The data is written to a temp file in the same fan-out directory and
    /// renamed over the final name, so a concurrent reader observes either
    /// the old block or the new one in full, never a splice. On failure the
    /// byte accounting is left untouched and the block counts as not
    /// cached.
    pub async fn write(
        &self,
        path: &BackendPath,
        index: u64,
        data: &[u8],
    ) -> std::io::Result<()> {
        let hash = path.hash();
        let final_path = self.block_file(hash, index);
        let fan_dir = self.fan_dir(hash);
        create_dir_private(&fan_dir).await?;

        let tmp_path = fan_dir.join(format!(
            ".tmp-{hash:016x}-{index}-{}",
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let write_result: std::io::Result<()> = async {
            use std::os::unix::fs::OpenOptionsExt as _;
            use tokio::io::AsyncWriteExt as _;

            let mut tmp = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&tmp_path)
                .await?;
            tmp.write_all(data).await?;
            tmp.flush().await?;

            // Replaced blocks must not be double-counted.
            let old_len = match tokio::fs::metadata(&final_path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            tokio::fs::rename(&tmp_path, &final_path).await?;
            self.sub_bytes(old_len);
            self.current_bytes
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        if self.debug_events {
            debug!(path = %path, index, len = data.len(), "block stored");
        }

        self.maybe_evict().await;
        Ok(())
    }

    /// Deletes every block whose byte range intersects
    /// `[offset, offset + len)`.
    pub async fn invalidate_range(
        &self,
        path: &BackendPath,
        offset: u64,
        len: u64,
    ) -> std::io::Result<()> {
        let Some((first, last)) = block_span(offset, len, self.block_size) else {
            return Ok(());
        };
        let hash = path.hash();
        for index in first..=last {
            self.unlink_counted(&self.block_file(hash, index)).await?;
        }
        if self.debug_events {
            debug!(path = %path, first, last, "blocks invalidated");
        }
        Ok(())
    }

    /// Deletes every block belonging to a path, by scanning its fan-out
    /// directory for the hash prefix.
    pub async fn invalidate_file(&self, path: &BackendPath) -> std::io::Result<()> {
        let hash = path.hash();
        let fan_dir = self.fan_dir(hash);
        let prefix = format!("{hash:016x}-");

        let mut reader = match tokio::fs::read_dir(&fan_dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        while let Some(entry) = reader.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                self.unlink_counted(&entry.path()).await?;
            }
        }
        if self.debug_events {
            debug!(path = %path, "all blocks invalidated");
        }
        Ok(())
    }

    /// Removes a block file and subtracts its size from the counter.
    /// Already-gone files are a success: invalidation and eviction race
    /// benignly over the same names.
    async fn unlink_counted(&self, file: &Path) -> std::io::Result<()> {
        let len = match tokio::fs::metadata(file).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        match tokio::fs::remove_file(file).await {
            Ok(()) => {
                self.sub_bytes(len);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Subtracts from the byte counter without wrapping below zero; the
    /// counter is an estimate and concurrent replacements can race it.
    fn sub_bytes(&self, len: u64) {
        let _ = self
            .current_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(len))
            });
    }

    /// Walks the two-level fan-out and returns every block file with its
    /// metadata.
    async fn collect_blocks(&self) -> std::io::Result<Vec<(PathBuf, std::fs::Metadata)>> {
        let mut blocks = Vec::new();
        let mut level1 = match tokio::fs::read_dir(&self.blocks_dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(blocks),
            Err(e) => return Err(e),
        };
        while let Some(outer) = level1.next_entry().await? {
            let mut level2 = match tokio::fs::read_dir(outer.path()).await {
                Ok(reader) => reader,
                Err(_) => continue,
            };
            while let Some(inner) = level2.next_entry().await? {
                let mut files = match tokio::fs::read_dir(inner.path()).await {
                    Ok(reader) => reader,
                    Err(_) => continue,
                };
                while let Some(file) = files.next_entry().await? {
                    if file.file_name().to_string_lossy().starts_with('.') {
                        continue;
                    }
                    if let Ok(meta) = file.metadata().await {
                        blocks.push((file.path(), meta));
                    }
                }
            }
        }
        Ok(blocks)
    }

    /// Runs an eviction pass if the budget is exceeded.
    ///
    /// All blocks are collected with their last-access time and unlinked
    /// oldest-first until usage drops to the eviction target. The pass is
    /// synchronous with the triggering write so the budget invariant holds
    /// by the time the write returns.
    async fn maybe_evict(&self) {
        if self.max_bytes == 0 || self.current_bytes.load(Ordering::Relaxed) <= self.max_bytes {
            return;
        }

        let _guard = self.evict_lock.lock().await;
        // A pass that ran while we waited may already have freed enough.
        if self.current_bytes.load(Ordering::Relaxed) <= self.max_bytes {
            return;
        }

        let target = self.max_bytes.saturating_mul(EVICTION_TARGET_PERCENT) / 100;
        let mut blocks = match self.collect_blocks().await {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(error = %e, "eviction scan failed, budget temporarily exceeded");
                return;
            }
        };
        blocks.sort_by_key(|(_, meta)| {
            meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH)
        });

        let mut evicted = 0u64;
        for (file, _) in &blocks {
            if self.current_bytes.load(Ordering::Relaxed) <= target {
                break;
            }
            match self.unlink_counted(file).await {
                Ok(()) => evicted += 1,
                Err(e) => warn!(file = %file.display(), error = %e, "eviction unlink failed"),
            }
        }

        self.stats.evicted(evicted);
        if self.debug_events {
            debug!(
                evicted,
                current = self.current_bytes.load(Ordering::Relaxed),
                max = self.max_bytes,
                "eviction pass complete"
            );
        }
    }
}

/// Creates a directory chain with owner-only permissions.
async fn create_dir_private(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt as _;

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&path)
    })
    .await
    .map_err(|join| std::io::Error::other(join))?
}
