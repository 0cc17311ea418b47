use gpuvm_sync::SpinLock;
use std::panic;

#[test]
fn guard_releases_on_drop() {
    let lock = SpinLock::new(0_u32);

    {
        let mut guard = lock.lock();
        *guard = 7;
    }

    // A second acquisition must succeed; the guard above unlocked on drop.
    {
        let mut guard = lock.lock();
        *guard += 1;
        assert_eq!(*guard, 8);
    }
}

#[test]
fn try_lock_fails_while_held() {
    let lock = SpinLock::new(1_u8);

    let first = lock.try_lock();
    assert!(first.is_some());
    assert!(lock.try_lock().is_none());

    drop(first);
    assert!(lock.try_lock().is_some());
}

#[test]
fn with_lock_runs_and_unlocks() {
    let lock = SpinLock::new(String::from("pt"));
    let len = lock.with_lock(|s| {
        s.push('e');
        s.len()
    });
    assert_eq!(len, 3);
    assert_eq!(lock.with_lock(|s| s.clone()), "pte");
}

#[test]
fn into_inner_returns_value() {
    let lock = SpinLock::new(vec![1, 2]);
    lock.lock().push(3);
    assert_eq!(lock.into_inner(), vec![1, 2, 3]);
}

#[test]
fn contended_counting_is_exact() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    let threads = 8;
    let iters = 4_000;

    let lock = Arc::new(SpinLock::new(0_usize));
    let in_section = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_section = Arc::clone(&in_section);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|count| {
                    let nested = in_section.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(nested, 0, "mutual exclusion violated");
                    *count += 1;
                    in_section.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(lock.with_lock(|count| *count), threads * iters);
}

#[test]
fn unlocks_when_critical_section_panics() {
    let lock = SpinLock::new(0_u32);

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        lock.with_lock(|value| {
            *value = 99;
            panic!("poisoned on purpose");
        });
    }));
    assert!(result.is_err());

    // The guard dropped during unwinding; the lock must be free again.
    assert_eq!(lock.with_lock(|value| *value), 99);
}
