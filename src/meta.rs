//! Persistent metadata store: attributes, negative entries, and directory
//! listings with TTLs.
//!
//! Backed by SQLite in WAL mode. One connection is shared by all tasks; the
//! write-ahead journal gives single-writer/multi-reader concurrency, and a
//! 100 ms busy timeout turns transient contention into momentary latency.
//! Transient (busy/locked) errors are absorbed — a contended read reports a
//! MISS, a contended write is logged and skipped, and the TTL recovers the
//! difference. Structural errors surface as [`StoreFailure`] so the mount
//! can fall back to pure pass-through.

use std::os::unix::ffi::{OsStrExt as _, OsStringExt as _};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags as SqliteOpenFlags, params};
use thiserror::Error;
use tracing::warn;

use crate::backend::{BackendAttr, DirEntry, EntryKind};
use crate::config::Ttls;
use crate::path::BackendPath;

const META_DB_NAME: &str = "metadata.db";
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

/// A failure the store cannot recover from (cannot open, not a database,
/// corruption). The mount reacts by disabling caching; it never aborts.
#[derive(Debug, Error)]
pub enum StoreFailure {
    #[error("failed to open metadata store at {path}: {source}")]
    Open {
        path: std::path::PathBuf,
        source: rusqlite::Error,
    },

    #[error("metadata store unusable: {0}")]
    Unusable(rusqlite::Error),

    #[error("metadata store lock poisoned")]
    Poisoned,

    #[error("io error preparing metadata store: {0}")]
    Io(#[from] std::io::Error),
}

/// Entry kinds as stored in the `kind` column.
///
/// `Negative` records a confirmed-absent path; it shares the attribute table
/// so a path has exactly one record at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedKind {
    File,
    Dir,
    Negative,
    Symlink,
    Other,
}

impl CachedKind {
    fn code(self) -> i64 {
        match self {
            Self::File => 1,
            Self::Dir => 2,
            Self::Negative => 3,
            Self::Symlink => 4,
            Self::Other => 5,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            1 => Self::File,
            2 => Self::Dir,
            3 => Self::Negative,
            4 => Self::Symlink,
            _ => Self::Other,
        }
    }
}

impl From<EntryKind> for CachedKind {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => Self::File,
            EntryKind::Dir => Self::Dir,
            EntryKind::Symlink => Self::Symlink,
            EntryKind::Other => Self::Other,
        }
    }
}

/// A cached attribute record. Never carries an inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrRecord {
    pub kind: CachedKind,
    pub size: u64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub cached_at: i64,
    pub valid_until: i64,
}

impl AttrRecord {
    /// Rebuild gateway-facing attributes from this record plus the live
    /// inode obtained from the revalidation probe.
    #[must_use]
    pub fn to_attr(&self, live_ino: u64) -> BackendAttr {
        let kind = match self.kind {
            CachedKind::File => EntryKind::File,
            CachedKind::Dir => EntryKind::Dir,
            CachedKind::Symlink => EntryKind::Symlink,
            CachedKind::Negative | CachedKind::Other => EntryKind::Other,
        };
        BackendAttr {
            kind,
            size: self.size,
            mtime_ns: self.mtime_ns,
            ctime_ns: self.ctime_ns,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            ino: live_ino,
        }
    }
}

/// Result of an attribute lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrLookup {
    Miss,
    Hit { record: AttrRecord, valid: bool },
}

/// A cached directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub entries: Vec<DirEntry>,
    pub dir_mtime_ns: i64,
    pub valid: bool,
}

/// Seconds since the epoch, for TTL bookkeeping.
fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Whether a rusqlite error is transient contention rather than a
/// structural problem with the store.
fn is_transient(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(ffi, _)
            if matches!(
                ffi.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

fn key_bytes(path: &BackendPath) -> &[u8] {
    path.as_path().as_os_str().as_bytes()
}

/// The persistent metadata store for one mount.
pub struct MetaStore {
    conn: Mutex<Connection>,
    ttls: Ttls,
}

impl MetaStore {
    /// Opens (creating if needed) `metadata.db` under `cache_root`.
    ///
    /// The cache root must already exist; the database file is created with
    /// owner-only permissions.
    pub fn open(cache_root: &Path, ttls: Ttls) -> Result<Self, StoreFailure> {
        let db_path = cache_root.join(META_DB_NAME);
        let conn = Connection::open_with_flags(
            &db_path,
            SqliteOpenFlags::SQLITE_OPEN_READ_WRITE
                | SqliteOpenFlags::SQLITE_OPEN_CREATE
                | SqliteOpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreFailure::Open {
            path: db_path.clone(),
            source,
        })?;

        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&db_path, std::fs::Permissions::from_mode(0o600))?;
        }

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(StoreFailure::Unusable)?;
        // journal_mode returns a result row; query it instead of execute.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(StoreFailure::Unusable)?;
        conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY;")
            .map_err(StoreFailure::Unusable)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attribute (
               path        BLOB PRIMARY KEY,
               kind        INTEGER NOT NULL,
               size        INTEGER NOT NULL,
               mtime_ns    INTEGER NOT NULL,
               ctime_ns    INTEGER NOT NULL,
               mode        INTEGER NOT NULL,
               uid         INTEGER NOT NULL,
               gid         INTEGER NOT NULL,
               cached_at   INTEGER NOT NULL,
               valid_until INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS directory_entry (
               dir_path     BLOB NOT NULL,
               entry_name   BLOB NOT NULL,
               entry_kind   INTEGER NOT NULL,
               dir_mtime_ns INTEGER NOT NULL,
               cached_at    INTEGER NOT NULL,
               valid_until  INTEGER NOT NULL,
               PRIMARY KEY (dir_path, entry_name)
             );",
        )
        .map_err(StoreFailure::Unusable)?;

        Ok(Self {
            conn: Mutex::new(conn),
            ttls,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreFailure> {
        self.conn.lock().map_err(|_| StoreFailure::Poisoned)
    }

    /// Looks up the attribute record for a path.
    ///
    /// Transient contention reports a MISS; the caller revalidates against
    /// the backend, which is always correct, just slower.
    pub fn lookup_attr(&self, path: &BackendPath) -> Result<AttrLookup, StoreFailure> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT kind, size, mtime_ns, ctime_ns, mode, uid, gid, cached_at, valid_until
                 FROM attribute WHERE path = ?1",
            )
            .map_err(StoreFailure::Unusable)?;

        let row = stmt
            .query_row(params![key_bytes(path)], |row| {
                Ok(AttrRecord {
                    kind: CachedKind::from_code(row.get(0)?),
                    size: row.get::<_, i64>(1)?.cast_unsigned(),
                    mtime_ns: row.get(2)?,
                    ctime_ns: row.get(3)?,
                    mode: row.get::<_, i64>(4)?.cast_unsigned() as u32,
                    uid: row.get::<_, i64>(5)?.cast_unsigned() as u32,
                    gid: row.get::<_, i64>(6)?.cast_unsigned() as u32,
                    cached_at: row.get(7)?,
                    valid_until: row.get(8)?,
                })
            });

        match row {
            Ok(record) => Ok(AttrLookup::Hit {
                record,
                valid: now_epoch() < record.valid_until,
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(AttrLookup::Miss),
            Err(e) if is_transient(&e) => {
                warn!(path = %path, error = %e, "metadata lookup contended, treating as miss");
                Ok(AttrLookup::Miss)
            }
            Err(e) => Err(StoreFailure::Unusable(e)),
        }
    }

    /// Stores (or replaces) the attribute record for a path.
    pub fn put_attr(&self, path: &BackendPath, attr: &BackendAttr) -> Result<(), StoreFailure> {
        let now = now_epoch();
        let valid_until =
            now.saturating_add(i64::try_from(self.ttls.meta.as_secs()).unwrap_or(i64::MAX));
        self.upsert_attr(
            path,
            CachedKind::from(attr.kind),
            attr.size,
            attr.mtime_ns,
            attr.ctime_ns,
            attr.mode,
            attr.uid,
            attr.gid,
            now,
            valid_until,
        )
    }

    /// Records that a path does not exist, with the short negative TTL.
    pub fn put_negative(&self, path: &BackendPath) -> Result<(), StoreFailure> {
        let now = now_epoch();
        let valid_until =
            now.saturating_add(i64::try_from(self.ttls.neg.as_secs()).unwrap_or(i64::MAX));
        self.upsert_attr(path, CachedKind::Negative, 0, 0, 0, 0, 0, 0, now, valid_until)
    }

    #[expect(clippy::too_many_arguments, reason = "one row, one statement")]
    fn upsert_attr(
        &self,
        path: &BackendPath,
        kind: CachedKind,
        size: u64,
        mtime_ns: i64,
        ctime_ns: i64,
        mode: u32,
        uid: u32,
        gid: u32,
        cached_at: i64,
        valid_until: i64,
    ) -> Result<(), StoreFailure> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "INSERT OR REPLACE INTO attribute
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .map_err(StoreFailure::Unusable)?;

        let result = stmt.execute(params![
            key_bytes(path),
            kind.code(),
            size.cast_signed(),
            mtime_ns,
            ctime_ns,
            i64::from(mode),
            i64::from(uid),
            i64::from(gid),
            cached_at,
            valid_until,
        ]);

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => {
                warn!(path = %path, error = %e, "metadata store contended, entry not cached");
                Ok(())
            }
            Err(e) => Err(StoreFailure::Unusable(e)),
        }
    }

    /// Drops the attribute record for a path, if any.
    pub fn invalidate_attr(&self, path: &BackendPath) -> Result<(), StoreFailure> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("DELETE FROM attribute WHERE path = ?1")
            .map_err(StoreFailure::Unusable)?;

        match stmt.execute(params![key_bytes(path)]) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => {
                // TTL expiry bounds how long the stale record can survive.
                warn!(path = %path, error = %e, "attribute invalidation contended");
                Ok(())
            }
            Err(e) => Err(StoreFailure::Unusable(e)),
        }
    }

    /// Looks up the cached listing for a directory.
    ///
    /// An empty directory stores no rows and is indistinguishable from a
    /// miss, so empty listings are simply never served from cache.
    pub fn lookup_dir(&self, path: &BackendPath) -> Result<Option<DirListing>, StoreFailure> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT entry_name, entry_kind, dir_mtime_ns, valid_until
                 FROM directory_entry WHERE dir_path = ?1 ORDER BY entry_name",
            )
            .map_err(StoreFailure::Unusable)?;

        let rows = stmt.query_map(params![key_bytes(path)], |row| {
            let name: Vec<u8> = row.get(0)?;
            let kind_code: i64 = row.get(1)?;
            let dir_mtime_ns: i64 = row.get(2)?;
            let valid_until: i64 = row.get(3)?;
            Ok((name, kind_code, dir_mtime_ns, valid_until))
        });

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) if is_transient(&e) => {
                warn!(path = %path, error = %e, "listing lookup contended, treating as miss");
                return Ok(None);
            }
            Err(e) => return Err(StoreFailure::Unusable(e)),
        };

        let mut entries = Vec::new();
        let mut dir_mtime_ns = 0;
        let mut valid_until = 0;
        for row in rows {
            let (name, kind_code, row_mtime, row_valid) = match row {
                Ok(row) => row,
                Err(e) if is_transient(&e) => {
                    warn!(path = %path, error = %e, "listing read contended, treating as miss");
                    return Ok(None);
                }
                Err(e) => return Err(StoreFailure::Unusable(e)),
            };
            if entries.is_empty() {
                dir_mtime_ns = row_mtime;
                valid_until = row_valid;
            }
            let kind = match CachedKind::from_code(kind_code) {
                CachedKind::Dir => EntryKind::Dir,
                CachedKind::Symlink => EntryKind::Symlink,
                CachedKind::File => EntryKind::File,
                CachedKind::Negative | CachedKind::Other => EntryKind::Other,
            };
            entries.push(DirEntry {
                name: std::ffi::OsString::from_vec(name),
                kind,
            });
        }

        if entries.is_empty() {
            return Ok(None);
        }

        Ok(Some(DirListing {
            entries,
            dir_mtime_ns,
            valid: now_epoch() < valid_until,
        }))
    }

    /// Atomically replaces the listing for a directory.
    ///
    /// Delete and insert run in one transaction: a concurrent reader sees
    /// the previous listing or the new one, never a mix.
    pub fn put_dir(
        &self,
        path: &BackendPath,
        entries: &[DirEntry],
        dir_mtime_ns: i64,
    ) -> Result<(), StoreFailure> {
        let now = now_epoch();
        let valid_until =
            now.saturating_add(i64::try_from(self.ttls.dir.as_secs()).unwrap_or(i64::MAX));

        let mut conn = self.lock()?;
        let result = (|| -> Result<(), rusqlite::Error> {
            let tx = conn.transaction()?;
            {
                let mut delete = tx.prepare_cached(
                    "DELETE FROM directory_entry WHERE dir_path = ?1",
                )?;
                delete.execute(params![key_bytes(path)])?;

                let mut insert = tx.prepare_cached(
                    "INSERT OR REPLACE INTO directory_entry
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for entry in entries {
                    insert.execute(params![
                        key_bytes(path),
                        entry.name.as_bytes(),
                        CachedKind::from(entry.kind).code(),
                        dir_mtime_ns,
                        now,
                        valid_until,
                    ])?;
                }
            }
            tx.commit()
        })();

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_transient(&e) => {
                warn!(path = %path, error = %e, "listing store contended, not cached");
                Ok(())
            }
            Err(e) => Err(StoreFailure::Unusable(e)),
        }
    }

    /// Drops the cached listing for a directory, if any.
    pub fn invalidate_dir(&self, path: &BackendPath) -> Result<(), StoreFailure> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("DELETE FROM directory_entry WHERE dir_path = ?1")
            .map_err(StoreFailure::Unusable)?;

        match stmt.execute(params![key_bytes(path)]) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => {
                warn!(path = %path, error = %e, "listing invalidation contended");
                Ok(())
            }
            Err(e) => Err(StoreFailure::Unusable(e)),
        }
    }
}
