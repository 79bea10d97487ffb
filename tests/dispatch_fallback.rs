#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nearfs::backend::OpenFlags;
use nearfs::config::MountConfig;
use nearfs::dispatch::{CacheState, Dispatcher, MountError};

use common::{CountingBackend, Fixture};

fn mount_point() -> PathBuf {
    PathBuf::from("/nearfs-test-mnt")
}

fn dispatcher_with(
    fx: &Fixture,
    config: MountConfig,
) -> Dispatcher<CountingBackend> {
    Dispatcher::new(
        Arc::clone(&fx.backend),
        fx.backing.path(),
        &mount_point(),
        config,
    )
    .unwrap()
}

fn dispatcher(fx: &Fixture) -> Dispatcher<CountingBackend> {
    dispatcher_with(
        fx,
        MountConfig {
            cache_root: Some(fx.cache_root()),
            ..MountConfig::default()
        },
    )
}

// -- Construction-time refusals --

#[test]
fn refuses_cache_root_inside_mount_point() {
    let fx = Fixture::new();
    let result = Dispatcher::new(
        Arc::clone(&fx.backend),
        fx.backing.path(),
        &mount_point(),
        MountConfig {
            cache_root: Some(mount_point().join("cache")),
            ..MountConfig::default()
        },
    );

    assert!(matches!(result, Err(MountError::Config(_))));
}

#[test]
fn refuses_missing_backing_directory() {
    let fx = Fixture::new();
    let result = Dispatcher::new(
        Arc::clone(&fx.backend),
        Path::new("/definitely/not/here"),
        &mount_point(),
        MountConfig::default(),
    );

    assert!(matches!(result, Err(MountError::BackendRoot { .. })));
}

#[test]
fn refuses_invalid_block_size() {
    let fx = Fixture::new();
    let result = Dispatcher::new(
        Arc::clone(&fx.backend),
        fx.backing.path(),
        &mount_point(),
        MountConfig {
            block_size_bytes: 1000,
            ..MountConfig::default()
        },
    );

    assert!(matches!(result, Err(MountError::Config(_))));
}

// -- Lazy initialization --

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_comes_up_on_first_operation_only() {
    let fx = Fixture::new();
    fx.seed_file("a.txt", b"hello world");
    let disp = dispatcher(&fx);

    assert_eq!(disp.cache_state(), CacheState::Uninit);
    assert!(
        !fx.cache_root().exists(),
        "construction must not touch the cache root"
    );

    let attr = disp.getattr(Path::new("a.txt")).await.unwrap();
    assert_eq!(attr.size, 11);

    assert_eq!(disp.cache_state(), CacheState::Ready);
    assert!(fx.cache_root().join("metadata.db").exists());
    assert!(fx.cache_root().join(".nearfs-cache").exists());
    assert!(fx.cache_root().join("blocks").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_operations_initialize_once() {
    let fx = Fixture::new();
    fx.seed_file("a.txt", b"hello world");
    let disp = Arc::new(dispatcher(&fx));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let disp = Arc::clone(&disp);
        tasks.push(tokio::spawn(async move {
            disp.getattr(Path::new("a.txt")).await.unwrap().size
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 11);
    }
    assert_eq!(disp.cache_state(), CacheState::Ready);
}

// -- Path translation --

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn escaping_relative_paths_are_einval() {
    let fx = Fixture::new();
    let disp = dispatcher(&fx);

    let err = disp.getattr(Path::new("../escape")).await.unwrap_err();
    assert_eq!(err, libc::EINVAL);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leading_slash_paths_resolve_below_the_root() {
    let fx = Fixture::new();
    fx.seed_file("d/f", b"xy");
    let disp = dispatcher(&fx);

    let attr = disp.getattr(Path::new("/d/f")).await.unwrap();
    assert_eq!(attr.size, 2);
}

// -- End-to-end through the gateway surface --

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_then_read_roundtrip_via_dispatcher() {
    let fx = Fixture::new();
    fx.seed_dir(".");
    let disp = dispatcher(&fx);
    let path = Path::new("f");

    let fh = disp
        .create(path, OpenFlags::RDWR, 0o644)
        .await
        .unwrap();
    assert_eq!(disp.write(path, fh, 0, b"write through").await.unwrap(), 13);

    let out = disp.read(path, fh, 0, 13).await.unwrap();
    assert_eq!(&out[..], b"write through");

    disp.fsync(fh, false).await.unwrap();

    // The backend holds the bytes regardless of cache state.
    assert_eq!(
        std::fs::read(fx.backing.path().join("f")).unwrap(),
        b"write through"
    );

    disp.release(fh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readdir_readlink_statfs_roundtrip() {
    let fx = Fixture::new();
    fx.seed_file("d/a", b"");
    let disp = dispatcher(&fx);

    disp.symlink(Path::new("a"), Path::new("d/ln")).await.unwrap();
    let target = disp.readlink(Path::new("d/ln")).await.unwrap();
    assert_eq!(target, Path::new("a"));

    let mut names: Vec<_> = disp
        .readdir(Path::new("d"))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, ["a", "ln"]);

    let stats = disp.statfs(Path::new("d")).await.unwrap();
    assert!(stats.block_size > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enoent_propagates_as_errno() {
    let fx = Fixture::new();
    let disp = dispatcher(&fx);

    let err = disp.getattr(Path::new("ghost")).await.unwrap_err();
    assert_eq!(err, libc::ENOENT);

    let err = disp
        .open(Path::new("ghost"), OpenFlags::RDONLY)
        .await
        .unwrap_err();
    assert_eq!(err, libc::ENOENT);
}

// -- S6: structural store failure degrades to pass-through --

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupted_store_disables_cache_without_user_errors() {
    let fx = Fixture::new();
    fx.seed_file("a.txt", b"hello world");
    fx.seed_file("b.txt", b"other");
    let disp = dispatcher(&fx);

    // Bring the cache up.
    disp.getattr(Path::new("a.txt")).await.unwrap();
    assert_eq!(disp.cache_state(), CacheState::Ready);

    // Corrupt the store between two operations: drop the schema out from
    // under the open connection.
    let sabotage = rusqlite::Connection::open(fx.cache_root().join("metadata.db")).unwrap();
    sabotage
        .execute_batch("DROP TABLE attribute; DROP TABLE directory_entry;")
        .unwrap();
    drop(sabotage);

    // The failing operation still returns the correct backend answer.
    let attr = disp.getattr(Path::new("a.txt")).await.unwrap();
    assert_eq!(attr.size, 11);

    // Every subsequent operation is pure pass-through.
    let attr = disp.getattr(Path::new("b.txt")).await.unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(disp.cache_state(), CacheState::Disabled);

    let before = fx.backend.stat_count();
    disp.getattr(Path::new("a.txt")).await.unwrap();
    disp.getattr(Path::new("a.txt")).await.unwrap();
    assert_eq!(
        fx.backend.stat_count(),
        before + 2,
        "no cache answers once disabled"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unusable_cache_root_disables_cache_not_the_mount() {
    let fx = Fixture::new();
    fx.seed_file("a.txt", b"hello world");

    // The configured cache root is an existing regular file.
    let bogus = fx.cache.path().join("not-a-dir");
    std::fs::write(&bogus, b"oops").unwrap();
    let disp = dispatcher_with(
        &fx,
        MountConfig {
            cache_root: Some(bogus),
            ..MountConfig::default()
        },
    );

    let attr = disp.getattr(Path::new("a.txt")).await.unwrap();
    assert_eq!(attr.size, 11, "pass-through answer despite cache failure");
    assert_eq!(disp.cache_state(), CacheState::Disabled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_cache_root_disables_cache_not_the_mount() {
    let fx = Fixture::new();
    fx.seed_file("a.txt", b"hello world");

    let foreign = fx.cache_root();
    std::fs::create_dir_all(&foreign).unwrap();
    std::fs::write(foreign.join("unrelated"), b"keep me").unwrap();
    let disp = dispatcher(&fx);

    let attr = disp.getattr(Path::new("a.txt")).await.unwrap();
    assert_eq!(attr.size, 11);
    assert_eq!(disp.cache_state(), CacheState::Disabled);
    assert_eq!(
        std::fs::read(foreign.join("unrelated")).unwrap(),
        b"keep me",
        "foreign data must be left alone"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_mount_still_supports_mutations() {
    let fx = Fixture::new();
    fx.seed_file("a.txt", b"hello world");
    let bogus = fx.cache.path().join("not-a-dir");
    std::fs::write(&bogus, b"oops").unwrap();
    let disp = dispatcher_with(
        &fx,
        MountConfig {
            cache_root: Some(bogus),
            ..MountConfig::default()
        },
    );

    disp.getattr(Path::new("a.txt")).await.unwrap();
    assert_eq!(disp.cache_state(), CacheState::Disabled);

    disp.mkdir(Path::new("d"), 0o755).await.unwrap();
    let fh = disp.create(Path::new("d/f"), OpenFlags::RDWR, 0o644).await.unwrap();
    disp.write(Path::new("d/f"), fh, 0, b"direct").await.unwrap();
    assert_eq!(&disp.read(Path::new("d/f"), fh, 0, 6).await.unwrap()[..], b"direct");
    disp.release(fh).await.unwrap();
    disp.unlink(Path::new("d/f")).await.unwrap();
    disp.rmdir(Path::new("d")).await.unwrap();

    assert!(!fx.backing.path().join("d").exists());
}

// -- Cached behavior through the dispatcher (S1 shape) --

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatcher_serves_metadata_hits() {
    let fx = Fixture::new();
    fx.seed_file("a.txt", b"hello world");
    let disp = dispatcher(&fx);

    disp.getattr(Path::new("a.txt")).await.unwrap();
    disp.getattr(Path::new("a.txt")).await.unwrap();

    let snap = disp.stats();
    assert_eq!(snap.meta_misses, 1);
    assert_eq!(snap.meta_hits, 1);
    assert_eq!(fx.backend.stat_count(), 2, "one inode probe per query");

    let (current, max) = disp.block_stats().unwrap();
    assert_eq!(current, 0, "attribute traffic stores no blocks");
    assert_eq!(max, 0);
}
