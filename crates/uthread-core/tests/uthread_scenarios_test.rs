//! End-to-end thread and TLS lifecycle scenarios through the Rust API.

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use uthread_core::{Key, RuntimeConfig, ThreadError, ThreadPriority};

static TEST_LOCK: Mutex<()> = Mutex::new(());
static DTOR_LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn take_log() -> Vec<usize> {
    std::mem::take(&mut *DTOR_LOG.lock().unwrap_or_else(|e| e.into_inner()))
}

unsafe extern "C" fn logging_dtor(value: *mut c_void) {
    DTOR_LOG
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(value as usize);
}

#[test]
fn create_join_free() {
    let _g = lock();
    let mut thread = uthread_core::create(|| 42, true).expect("create");
    assert_eq!(thread.join().expect("join"), 42);
    drop(thread);
}

#[test]
fn every_pure_routine_result_roundtrips() {
    let _g = lock();
    for k in [0, 1, -1, 255, i32::MAX, i32::MIN] {
        let mut thread = uthread_core::create(move || k, true).expect("create");
        assert_eq!(thread.join().expect("join"), k);
    }
}

#[test]
fn two_threads_each_destroy_their_own_value() {
    let _g = lock();
    take_log();
    let key = Arc::new(Key::new(Some(logging_dtor)));
    let spawn_with = |value: usize| {
        let key = Arc::clone(&key);
        uthread_core::create(
            move || {
                unsafe { key.set(value as *mut c_void) }.expect("set");
                0
            },
            true,
        )
        .expect("create")
    };
    let mut t1 = spawn_with(0xA);
    let mut t2 = spawn_with(0xB);
    t1.join().expect("join t1");
    t2.join().expect("join t2");

    let mut log = take_log();
    log.sort_unstable();
    assert_eq!(log, vec![0xA, 0xB]);
}

static S3_KEY: Key = Key::new(Some(s3_dtor));
static S3_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn s3_dtor(value: *mut c_void) {
    let call = S3_CALLS.fetch_add(1, Ordering::SeqCst);
    DTOR_LOG
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(value as usize);
    let next = if call == 0 { 0x5EC0_usize } else { 0 };
    unsafe { S3_KEY.set(next as *mut c_void) }.expect("reinstall");
}

#[test]
fn destructor_that_reinstalls_runs_until_null() {
    let _g = lock();
    take_log();
    S3_CALLS.store(0, Ordering::SeqCst);
    let mut thread = uthread_core::create(
        || {
            unsafe { S3_KEY.set(0xF1_usize as *mut c_void) }.expect("set");
            0
        },
        true,
    )
    .expect("create");
    thread.join().expect("join");
    assert_eq!(S3_CALLS.load(Ordering::SeqCst), 2);
    assert_eq!(take_log(), vec![0xF1, 0x5EC0]);
}

#[test]
fn sixty_four_concurrent_first_uses_bind_one_slot() {
    let _g = lock();
    const THREADS: usize = 64;
    let key = Arc::new(Key::new(Some(logging_dtor)));
    let barrier = Arc::new(Barrier::new(THREADS));
    let before = uthread_core::tls_stats();

    let mut threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let key = Arc::clone(&key);
            let barrier = Arc::clone(&barrier);
            uthread_core::create(
                move || {
                    barrier.wait();
                    i32::from(!key.get().is_null())
                },
                true,
            )
            .expect("create")
        })
        .collect();
    let non_null: i32 = threads
        .iter_mut()
        .map(|t| t.join().expect("join"))
        .sum();
    let after = uthread_core::tls_stats();

    assert_eq!(non_null, 0);
    assert_eq!(after.slots_allocated - before.slots_allocated, 1);
    assert_eq!(after.registry_entries - before.registry_entries, 1);
}

#[test]
fn thread_ids_are_unique_among_live_threads() {
    let _g = lock();
    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let ids = Arc::new(Mutex::new(Vec::new()));
    let mut threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let ids = Arc::clone(&ids);
            uthread_core::create(
                move || {
                    ids.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(uthread_core::current_id());
                    barrier.wait();
                    0
                },
                true,
            )
            .expect("create")
        })
        .collect();
    barrier.wait();
    for t in &mut threads {
        t.join().expect("join");
    }
    let ids = ids.lock().unwrap_or_else(|e| e.into_inner());
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), THREADS);
    for t in &threads {
        assert!(ids.contains(&t.native_id()));
    }
}

#[test]
fn unjoinable_join_does_not_block() {
    let _g = lock();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let mut thread = uthread_core::create(
        move || {
            let _ = release_rx.recv();
            0
        },
        false,
    )
    .expect("create");
    // The thread is still parked, so a blocking join would hang here.
    assert!(matches!(thread.join(), Err(ThreadError::NotJoinable)));
    let _ = release_tx.send(());
}

#[test]
fn priority_query_reflects_last_accepted_level() {
    let _g = lock();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let mut thread = uthread_core::create(
        move || {
            let _ = release_rx.recv();
            0
        },
        true,
    )
    .expect("create");
    assert_eq!(thread.priority(), ThreadPriority::Normal);
    thread.set_priority(ThreadPriority::Low).expect("lower priority");
    assert_eq!(thread.priority(), ThreadPriority::Low);
    let _ = release_tx.send(());
    thread.join().expect("join");
}

#[test]
fn shutdown_reclaims_and_reinit_rebinds() {
    let _g = lock();
    take_log();
    uthread_core::init_with(RuntimeConfig::default()).expect("init");
    let key = Key::new(Some(logging_dtor));
    unsafe { key.set(0x600D_usize as *mut c_void) }.expect("set");
    let old_slot = key.native_slot();
    assert!(old_slot.is_some());

    uthread_core::shutdown();
    assert!(!uthread_core::is_initialized());
    assert_eq!(take_log(), vec![0x600D]);
    assert_eq!(uthread_core::tls_stats().registry_entries, 0);
    assert!(key.native_slot().is_none());

    uthread_core::init().expect("re-init");
    assert!(key.get().is_null());
    unsafe { key.set(0x7E57_usize as *mut c_void) }.expect("set after re-init");
    assert_eq!(key.get() as usize, 0x7E57);
    assert_eq!(uthread_core::tls_stats().registry_entries, 1);
    unsafe { key.set(ptr::null_mut()) }.expect("clear");
}
