use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::runtime::suspend::Closure;
use crate::runtime::thread::{default_stack_spec, Thread};
use crate::runtime::thread_state::ThreadState;
use crate::tests::{runnable_thread, test_runtime};

/// Poll until `stop` is set, counting iterations, then leave `Runnable`.
fn mutator(t: &Thread, stop: &AtomicBool, spins: &AtomicUsize) {
    while !stop.load(Ordering::Acquire) {
        t.check_suspend();
        spins.fetch_add(1, Ordering::Relaxed);
        std::thread::yield_now();
    }
    t.transition_from_runnable_to_suspended(ThreadState::Native);
}

fn wait_until<F: Fn() -> bool>(f: F) {
    for _ in 0..50_000 {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_micros(100));
    }
    panic!("condition never became true");
}

#[test]
fn checkpoint_runs_once_on_the_runnable_target() {
    let rt = test_runtime();
    let a = runnable_thread(&rt, "A");
    let b = runnable_thread(&rt, "B");
    let seen: Arc<Mutex<Vec<(u32, ThreadState)>>> = Arc::default();
    let stop = AtomicBool::new(false);
    let spins = AtomicUsize::new(0);

    crossbeam::scope(|s| {
        s.spawn(|_| mutator(&b, &stop, &spins));
        let record = seen.clone();
        let c: Arc<dyn Closure> = Arc::new(move |t: &Thread| record.lock().push((t.id(), t.state())));
        let covered = rt.thread_list().run_checkpoint(c, Some(&a));
        assert_eq!(covered, 2);
        wait_until(|| seen.lock().iter().any(|(tid, _)| *tid == b.id()));
        stop.store(true, Ordering::Release);
    })
    .unwrap();

    let seen = seen.lock();
    let on_b: Vec<_> = seen.iter().filter(|(tid, _)| *tid == b.id()).collect();
    assert_eq!(on_b.len(), 1);
    assert_eq!(on_b[0].1, ThreadState::Runnable);
    // The requester ran it for itself.
    assert!(seen.iter().any(|(tid, _)| *tid == a.id()));
    assert_eq!(b.pending_checkpoints(), 0);
    a.detach();
    b.detach();
}

#[test]
fn queued_checkpoints_run_in_install_order() {
    let rt = test_runtime();
    let b = runnable_thread(&rt, "B");
    let order: Arc<Mutex<Vec<u32>>> = Arc::default();
    {
        let _tsc = rt.locks().thread_suspend_count_lock.lock();
        for n in 1..=3 {
            let order = order.clone();
            assert!(b.request_checkpoint(Arc::new(move |_: &Thread| order.lock().push(n))));
        }
    }
    assert_eq!(b.pending_checkpoints(), 3);
    b.check_suspend();
    assert_eq!(*order.lock(), vec![1, 2, 3]);
    assert_eq!(b.pending_checkpoints(), 0);
    b.detach();
}

#[test]
fn checkpoint_requests_need_a_runnable_target() {
    let rt = test_runtime();
    let native = Thread::attach(&rt, "native", default_stack_spec(64 * 1024), false).unwrap();
    let _tsc = rt.locks().thread_suspend_count_lock.lock();
    assert!(!native.request_checkpoint(Arc::new(|_: &Thread| {})));
    drop(_tsc);
    native.detach();
}

#[test]
fn run_checkpoint_covers_suspended_threads_on_their_behalf() {
    let rt = test_runtime();
    let native = Thread::attach(&rt, "native", default_stack_spec(64 * 1024), false).unwrap();
    let states: Arc<Mutex<Vec<ThreadState>>> = Arc::default();
    let record = states.clone();
    let covered = rt.thread_list().run_checkpoint(Arc::new(move |t: &Thread| record.lock().push(t.state())), None);
    assert_eq!(covered, 1);
    assert_eq!(*states.lock(), vec![ThreadState::Native]);
    assert_eq!(native.suspend_count(), 0);
    native.detach();
}

#[test]
fn suspend_all_stops_mutators_until_resumed() {
    let rt = test_runtime();
    let b = runnable_thread(&rt, "B");
    let stop = AtomicBool::new(false);
    let spins = AtomicUsize::new(0);

    crossbeam::scope(|s| {
        s.spawn(|_| mutator(&b, &stop, &spins));
        wait_until(|| spins.load(Ordering::Relaxed) > 0);

        rt.thread_list().suspend_all(None);
        assert_eq!(b.state(), ThreadState::Suspended);
        assert_eq!(b.suspend_count(), 1);
        let frozen = spins.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(spins.load(Ordering::Relaxed), frozen);

        rt.thread_list().resume_all(None);
        wait_until(|| spins.load(Ordering::Relaxed) > frozen);
        stop.store(true, Ordering::Release);
    })
    .unwrap();
    assert_eq!(b.suspend_count(), 0);
    b.detach();
}

#[test]
fn suspend_by_id_and_synchronous_checkpoints() {
    let rt = test_runtime();
    let b = runnable_thread(&rt, "B");
    let stop = AtomicBool::new(false);
    let spins = AtomicUsize::new(0);
    let ran_on = Arc::new(Mutex::new(None));

    crossbeam::scope(|s| {
        s.spawn(|_| mutator(&b, &stop, &spins));

        let target = rt.thread_list().suspend_thread_by_id(b.id(), None).unwrap();
        assert!(!target.state().is_runnable());
        rt.thread_list().resume(&target);

        let record = ran_on.clone();
        let ok = rt.thread_list().request_synchronous_checkpoint(
            b.id(),
            Arc::new(move |t: &Thread| *record.lock() = Some(t.id())),
            None,
        );
        assert!(ok);
        assert_eq!(*ran_on.lock(), Some(b.id()));
        stop.store(true, Ordering::Release);
    })
    .unwrap();

    let gone = b.id();
    b.detach();
    assert!(!rt.thread_list().request_synchronous_checkpoint(gone, Arc::new(|_: &Thread| {}), None));
    assert!(rt.thread_list().suspend_thread_by_id(gone, None).is_err());
}

#[test]
fn empty_checkpoint_waits_for_runnable_threads() {
    let rt = test_runtime();
    let b = runnable_thread(&rt, "B");
    let idle = Thread::attach(&rt, "idle", default_stack_spec(64 * 1024), false).unwrap();
    let stop = AtomicBool::new(false);
    let spins = AtomicUsize::new(0);

    crossbeam::scope(|s| {
        s.spawn(|_| mutator(&b, &stop, &spins));
        rt.thread_list().run_empty_checkpoint(None);
        stop.store(true, Ordering::Release);
    })
    .unwrap();
    assert!(!b.is_flag_set(crate::runtime::thread_state::ThreadFlag::EMPTY_CHECKPOINT_REQUEST));
    idle.detach();
    b.detach();
}

#[test]
fn flip_runs_once_per_thread() {
    let rt = test_runtime();
    let busy = runnable_thread(&rt, "busy");
    let idle = Thread::attach(&rt, "idle", default_stack_spec(64 * 1024), false).unwrap();
    let flipped: Arc<Mutex<Vec<u32>>> = Arc::default();
    let stop = AtomicBool::new(false);
    let spins = AtomicUsize::new(0);

    crossbeam::scope(|s| {
        s.spawn(|_| mutator(&busy, &stop, &spins));
        let record = flipped.clone();
        let n = rt.thread_flip(Arc::new(move |t: &Thread| record.lock().push(t.id())), None);
        assert_eq!(n, 2);
        stop.store(true, Ordering::Release);
    })
    .unwrap();

    let mut ids = flipped.lock().clone();
    ids.sort_unstable();
    let mut expected = vec![busy.id(), idle.id()];
    expected.sort_unstable();
    assert_eq!(ids, expected);
    busy.detach();
    idle.detach();
}
