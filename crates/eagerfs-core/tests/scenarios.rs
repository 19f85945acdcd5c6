// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end engine scenarios against a real backing tree, no mount.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use eagerfs_core::{Engine, Options};
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use tempfile::TempDir;

fn engine_with(options: Options) -> (TempDir, Arc<Engine>) {
    let dir = TempDir::new().expect("tempdir");
    let engine = Engine::new(dir.path(), options).expect("engine");
    (dir, Arc::new(engine))
}

fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).expect("metadata").permissions().mode() & 0o777
}

#[test]
fn deferred_chmod_is_observed_by_a_following_stat() {
    let (dir, engine) = engine_with(Options::default());
    fs::write(dir.path().join("a"), b"payload").expect("seed");

    let id = engine.open(Path::new("/a"), libc::O_RDONLY).expect("open");
    engine.chmod(Path::new("/a"), 0o600).expect("chmod");
    let st = engine.getattr(Path::new("/a")).expect("stat");
    assert_eq!(st.st_mode & 0o777, 0o600);

    engine.release(Path::new("/a"), id).expect("release");
}

#[test]
fn cross_path_chowns_complete_with_a_single_worker() {
    let mut options = Options::default();
    options.num_threads = 1;
    let (dir, engine) = engine_with(options);
    fs::write(dir.path().join("a"), b"").expect("seed");
    fs::write(dir.path().join("b"), b"").expect("seed");

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    engine.chown(Path::new("/a"), Some(uid), Some(gid)).expect("chown a");
    engine.chown(Path::new("/b"), Some(uid), Some(gid)).expect("chown b");
    engine.drain();
    assert_eq!(engine.pending_operations(), 0);
}

#[test]
fn write_pipeline_lands_in_submission_order() {
    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 1000;

    let (dir, engine) = engine_with(Options::default());
    let id = engine
        .create(Path::new("/out"), libc::O_WRONLY | libc::O_TRUNC, 0o644)
        .expect("create");

    let mut rng = SmallRng::seed_from_u64(7);
    let mut expected = Vec::with_capacity(CHUNK * CHUNKS);
    let mut chunk = vec![0u8; CHUNK];
    for i in 0..CHUNKS {
        rng.fill_bytes(&mut chunk);
        expected.extend_from_slice(&chunk);
        let written = engine
            .write(Path::new("/out"), id, (i * CHUNK) as i64, &chunk)
            .expect("write");
        assert_eq!(written as usize, CHUNK);
    }
    engine.flush(Path::new("/out"), id).expect("flush");
    engine.release(Path::new("/out"), id).expect("release");
    engine.shutdown();

    let on_disk = fs::read(dir.path().join("out")).expect("read back");
    assert_eq!(on_disk.len(), expected.len());
    assert!(on_disk == expected, "backing file differs from submitted writes");
}

#[test]
fn restrictive_dirs_serializes_mutations_before_enumeration() {
    let mut options = Options::default();
    options.restrictive_dirs = true;
    options.num_threads = 1;
    let (dir, engine) = engine_with(options);

    fs::create_dir(dir.path().join("dir")).expect("mkdir");
    fs::write(dir.path().join("dir/file"), b"").expect("seed");
    fs::create_dir(dir.path().join("other")).expect("mkdir");

    // Queue a long tail of mutations, then enumerate an unrelated
    // directory: the sentinel forces the enumeration to drain them all.
    for i in 0..200u32 {
        let mode = if i % 2 == 0 { 0o600 } else { 0o640 };
        engine.chmod(Path::new("/dir/file"), mode).expect("chmod");
    }
    let entries = engine.read_dir(Path::new("/other")).expect("read_dir");
    assert!(entries.is_empty());
    assert_eq!(engine.pending_operations(), 0);
    assert_eq!(mode_of(&dir.path().join("dir/file")), 0o640);
}

#[test]
fn ignored_fsync_succeeds_without_touching_storage() {
    let (dir, engine) = engine_with(Options::default());
    fs::write(dir.path().join("f"), b"x").expect("seed");
    let id = engine.open(Path::new("/f"), libc::O_RDWR).expect("open");
    engine.fsync(Path::new("/f"), id, false).expect("fsync");
    engine.release(Path::new("/f"), id).expect("release");
}

#[test]
fn eager_fsync_reaches_the_backing_descriptor() {
    let mut options = Options::default();
    options.ignore_fsync = false;
    let (dir, engine) = engine_with(options);
    fs::write(dir.path().join("f"), b"x").expect("seed");

    let id = engine.open(Path::new("/f"), libc::O_RDWR).expect("open");
    engine.fsync(Path::new("/f"), id, true).expect("fsync");
    engine.drain();
    assert_eq!(engine.pending_operations(), 0);
    engine.release(Path::new("/f"), id).expect("release");
}

#[test]
fn a_write_racing_the_backing_open_still_lands() {
    let (dir, engine) = engine_with(Options::default());

    let id = engine
        .create(Path::new("/new"), libc::O_WRONLY, 0o644)
        .expect("create");

    // Write from another thread immediately; the backing open may not
    // have run yet and the write must wait on the late bind, not fail.
    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.write(Path::new("/new"), id, 0, b"late-bound").expect("write"))
    };
    assert_eq!(writer.join().expect("writer"), 10);

    let read_id = engine.open(Path::new("/new"), libc::O_RDONLY).expect("open");
    let data = engine.read(Path::new("/new"), read_id, 0, 32).expect("read");
    assert_eq!(&data, b"late-bound");

    engine.release(Path::new("/new"), id).expect("release");
    engine.release(Path::new("/new"), read_id).expect("release");
    drop(dir);
}

#[test]
fn bytes_written_are_readable_after_a_barrier() {
    let (_dir, engine) = engine_with(Options::default());
    let id = engine
        .create(Path::new("/data"), libc::O_RDWR, 0o644)
        .expect("create");

    engine.write(Path::new("/data"), id, 3, b"abcdef").expect("write");
    // getattr doubles as the reader barrier draining the write.
    let st = engine.getattr(Path::new("/data")).expect("stat");
    assert_eq!(st.st_size, 9);

    let data = engine.read(Path::new("/data"), id, 3, 6).expect("read");
    assert_eq!(&data, b"abcdef");
    engine.release(Path::new("/data"), id).expect("release");
}

#[test]
fn create_then_open_sees_the_created_file() {
    let (_dir, engine) = engine_with(Options::default());

    let writer = engine
        .create(Path::new("/both"), libc::O_WRONLY, 0o600)
        .expect("create");
    let reader = engine.open(Path::new("/both"), libc::O_RDONLY).expect("open");

    engine.write(Path::new("/both"), writer, 0, b"shared").expect("write");
    let data = engine.read(Path::new("/both"), reader, 0, 16).expect("read");
    assert_eq!(&data, b"shared");

    engine.release(Path::new("/both"), writer).expect("release");
    engine.release(Path::new("/both"), reader).expect("release");
}

#[test]
fn rename_after_a_pending_chmod_neither_deadlocks_nor_loses_the_mode() {
    let (dir, engine) = engine_with(Options::default());
    fs::write(dir.path().join("src"), b"x").expect("seed");

    engine.chmod(Path::new("/src"), 0o640).expect("chmod");
    engine.rename(Path::new("/src"), Path::new("/dst"), 0).expect("rename");

    assert_eq!(mode_of(&dir.path().join("dst")), 0o640);
    assert!(!dir.path().join("src").exists());
}

#[test]
fn unlink_with_writes_in_flight_does_not_deadlock() {
    let (dir, engine) = engine_with(Options::default());

    let id = engine
        .create(Path::new("/doomed"), libc::O_WRONLY, 0o644)
        .expect("create");
    // Pin the backing open; unlink is synchronous and would otherwise
    // race the deferred create for the name itself.
    engine.getattr(Path::new("/doomed")).expect("created");
    for i in 0..8 {
        engine
            .write(Path::new("/doomed"), id, i * 4096, &[0xau8; 4096])
            .expect("write");
    }
    engine.unlink(Path::new("/doomed")).expect("unlink");
    engine.release(Path::new("/doomed"), id).expect("release");
    engine.shutdown();

    assert!(!dir.path().join("doomed").exists());
    assert_eq!(engine.pending_operations(), 0);
}

#[test]
fn writes_after_teardown_run_inline() {
    let (dir, engine) = engine_with(Options::default());
    let id = engine
        .create(Path::new("/late"), libc::O_WRONLY, 0o644)
        .expect("create");
    engine.write(Path::new("/late"), id, 0, b"first").expect("write");
    engine.shutdown();

    // No workers are left to drain the pipe; the write must complete on
    // the calling thread instead of deadlocking against itself.
    engine.write(Path::new("/late"), id, 5, b"-second").expect("inline write");

    let data = fs::read(dir.path().join("late")).expect("read back");
    assert_eq!(&data, b"first-second");
}

#[test]
fn clean_shutdown_leaves_nothing_pending_and_nothing_parked() {
    let (dir, engine) = engine_with(Options::default());
    for name in ["a", "b", "c"] {
        let path = format!("/{name}");
        let id = engine
            .create(Path::new(&path), libc::O_WRONLY, 0o644)
            .expect("create");
        engine.write(Path::new(&path), id, 0, name.as_bytes()).expect("write");
        engine.flush(Path::new(&path), id).expect("flush");
        engine.release(Path::new(&path), id).expect("release");
    }
    engine.shutdown();

    assert_eq!(engine.pending_operations(), 0);
    assert_eq!(engine.reservoir_len(), 0);
    for name in ["a", "b", "c"] {
        let data = fs::read(dir.path().join(name)).expect("read back");
        assert_eq!(data, name.as_bytes());
    }
}

#[test]
fn deferred_failures_surface_on_later_synchronous_calls_only_as_absence() {
    let (dir, engine) = engine_with(Options::default());

    // chmod of a missing file fails in the worker; the submission itself
    // succeeded and nothing later reports the error.
    engine.chmod(Path::new("/ghost"), 0o600).expect("deferred chmod accepted");
    engine.drain();
    assert_eq!(engine.pending_operations(), 0);
    assert!(!dir.path().join("ghost").exists());
}

#[test]
fn link_is_deferred_and_ordered_behind_the_source_write() {
    let (dir, engine) = engine_with(Options::default());

    let id = engine
        .create(Path::new("/orig"), libc::O_WRONLY, 0o644)
        .expect("create");
    engine.write(Path::new("/orig"), id, 0, b"linked-data").expect("write");
    engine.link(Path::new("/orig"), Path::new("/alias")).expect("link");
    engine.drain();

    let via_alias = fs::read(dir.path().join("alias")).expect("alias readable");
    assert_eq!(&via_alias, b"linked-data");
    engine.release(Path::new("/orig"), id).expect("release");
}

#[test]
fn flock_serializes_on_the_late_bound_descriptor() {
    let (dir, engine) = engine_with(Options::default());
    fs::write(dir.path().join("locked"), b"x").expect("seed");

    let id = engine.open(Path::new("/locked"), libc::O_RDWR).expect("open");
    engine.flock(Path::new("/locked"), id, libc::LOCK_EX).expect("flock ex");
    engine.flock(Path::new("/locked"), id, libc::LOCK_UN).expect("flock un");
    engine.release(Path::new("/locked"), id).expect("release");
}

#[test]
fn read_style_calls_pass_through_with_a_barrier() {
    let (dir, engine) = engine_with(Options::default());
    fs::write(dir.path().join("target"), b"x").expect("seed");
    std::os::unix::fs::symlink("target", dir.path().join("sym")).expect("symlink");

    let target = engine.readlink(Path::new("/sym")).expect("readlink");
    assert_eq!(target, Path::new("target"));

    let stats = engine.statfs(Path::new("/")).expect("statfs");
    assert!(stats.f_bsize > 0);
}

#[test]
fn directory_enumeration_reflects_prior_structural_mutations() {
    let (_dir, engine) = engine_with(Options::default());

    engine.mkdir(Path::new("/d"), 0o755).expect("mkdir");
    let id = engine
        .create(Path::new("/d/child"), libc::O_WRONLY, 0o644)
        .expect("create");
    engine.release(Path::new("/d/child"), id).expect("release");
    engine.drain();

    let names: Vec<_> = engine
        .read_dir(Path::new("/d"))
        .expect("read_dir")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["child"]);
}
