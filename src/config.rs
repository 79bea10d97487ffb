//! Per-mount configuration record.
//!
//! Constructed once at mount time and passed to the engine and dispatcher;
//! there is no process-wide state. The record derives `serde` so an outer
//! application config can embed it — loading such a file is the embedder's
//! job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::path::path_hash;

/// Default attribute-record TTL in seconds.
pub const DEFAULT_META_TTL_SECS: u64 = 5;
/// Default directory-listing TTL in seconds.
pub const DEFAULT_DIR_TTL_SECS: u64 = 10;
/// Default negative-entry TTL in seconds.
pub const DEFAULT_NEG_TTL_SECS: u64 = 2;
/// Default block size in bytes (256 KiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 256 * 1024;
/// Smallest permitted block size.
pub const MIN_BLOCK_SIZE: u64 = 4096;

/// Cache behavior knobs for one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MountConfig {
    /// Where to place this mount's cache files. `None` selects a per-user
    /// directory keyed by a stable hash of the backing path.
    pub cache_root: Option<PathBuf>,

    /// Attribute-record TTL in seconds.
    pub meta_ttl_seconds: u64,

    /// Directory-listing TTL in seconds.
    pub dir_ttl_seconds: u64,

    /// Negative-entry TTL in seconds. Clamped to the attribute TTL.
    pub neg_ttl_seconds: u64,

    /// Fixed content block size. Must be a power of two, at least 4 KiB.
    pub block_size_bytes: u64,

    /// Byte budget for the block store. `None` means unbounded.
    pub max_cache_size: Option<ByteSize>,

    /// Emit structured hit/miss/evict/invalidate events at debug level.
    pub cache_debug: bool,

    /// Kill-switch for positive metadata caching. When false, every
    /// attribute query goes straight to the backend; block caching is
    /// unaffected.
    pub meta_cache: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            meta_ttl_seconds: DEFAULT_META_TTL_SECS,
            dir_ttl_seconds: DEFAULT_DIR_TTL_SECS,
            neg_ttl_seconds: DEFAULT_NEG_TTL_SECS,
            block_size_bytes: DEFAULT_BLOCK_SIZE,
            max_cache_size: None,
            cache_debug: false,
            meta_cache: true,
        }
    }
}

/// TTLs resolved to durations, with the negative TTL clamp applied.
#[derive(Debug, Clone, Copy)]
pub struct Ttls {
    pub meta: Duration,
    pub dir: Duration,
    pub neg: Duration,
}

impl MountConfig {
    /// Resolved TTL set. The negative TTL must never outlive the attribute
    /// TTL, otherwise a deleted-then-recreated file could be reported absent
    /// after its positive record has already been refreshed.
    #[must_use]
    pub fn ttls(&self) -> Ttls {
        Ttls {
            meta: Duration::from_secs(self.meta_ttl_seconds),
            dir: Duration::from_secs(self.dir_ttl_seconds),
            neg: Duration::from_secs(self.neg_ttl_seconds.min(self.meta_ttl_seconds)),
        }
    }

    /// Block-store byte budget; 0 means unbounded.
    #[must_use]
    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size.map_or(0, |size| size.as_u64())
    }

    /// The cache root for a mount backed by `backend_root`: the configured
    /// path, or a per-user directory keyed by the backing path's hash.
    #[must_use]
    pub fn resolved_cache_root(&self, backend_root: &Path) -> PathBuf {
        if let Some(root) = &self.cache_root {
            return root.clone();
        }
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        base.join("nearfs")
            .join(format!("{:016x}", path_hash(backend_root)))
    }

    /// Validate the configuration for a mount of `backend_root` at
    /// `mount_point`.
    ///
    /// Returns every problem found rather than stopping at the first. The
    /// cache root living inside the mount point is rejected here: a cache
    /// that writes through its own mount deadlocks the gateway.
    pub fn validate(&self, backend_root: &Path, mount_point: &Path) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.block_size_bytes < MIN_BLOCK_SIZE || !self.block_size_bytes.is_power_of_two() {
            errors.push(format!(
                "block-size-bytes must be a power of two >= {MIN_BLOCK_SIZE}, got {}",
                self.block_size_bytes
            ));
        }

        let cache_root = self.resolved_cache_root(backend_root);
        if cache_root.starts_with(mount_point) {
            errors.push(format!(
                "cache root '{}' lies inside the mount point '{}'",
                cache_root.display(),
                mount_point.display()
            ));
        }

        if let Some(max) = self.max_cache_size
            && max.as_u64() > 0
            && max.as_u64() < self.block_size_bytes
        {
            errors.push(format!(
                "max-cache-size {} is smaller than a single block ({} bytes)",
                max,
                self.block_size_bytes
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
