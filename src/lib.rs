//! nearfs — a persistent cache core for pass-through filesystems.
//!
//! nearfs sits between a filesystem gateway and a slow backing directory
//! (typically a remote share mounted locally) and serves metadata and file
//! content out of a local on-disk cache: attribute records, negative
//! entries, and directory listings in SQLite, file content in fixed-size
//! blocks with LRU eviction under a byte budget.
//!
//! Correctness rules the design: every mutation is written through to the
//! backend before any cache state changes, cached attributes are
//! revalidated against a live stat (which also supplies the inode number —
//! inodes are never cached), and any structural cache failure degrades the
//! mount to pure pass-through instead of surfacing errors to users.
//!
//! The crate deliberately stops at the [`dispatch::Dispatcher`] surface:
//! the kernel gateway adapter, identity remapping, and configuration
//! loading live with the embedder.

/// Backend adapter over the backing POSIX directory.
pub mod backend;
/// File-per-block content cache with LRU eviction.
pub mod blocks;
/// The serve/revalidate/invalidate decision layer.
pub mod coherence;
/// Per-mount configuration record.
pub mod config;
/// Gateway-facing dispatcher and cache lifecycle.
pub mod dispatch;
/// Persistent attribute and listing store.
pub mod meta;
/// Typed backend paths and the stable path hash.
pub mod path;
/// Cache activity counters.
pub mod stats;

pub use backend::{Backend, BackendAttr, DirEntry, EntryKind, FileHandle, LocalBackend, OpenFlags};
pub use config::MountConfig;
pub use dispatch::{AttrMapper, CacheState, Dispatcher, IdentityMapper, MountError};
pub use path::BackendPath;
pub use stats::StatsSnapshot;
