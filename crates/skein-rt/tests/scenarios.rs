// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end scheduling scenarios against a live scheduler.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use skein_rt::{
    enter_native, sleep, yield_now, CountDownLatch, Handle, NativeMonitor, NativeSection,
    PinSink, ReentrantLock, RuntimeError, Scheduler, SchedulerConfig, Signal, TaskError,
    TaskResult, TaskState,
};

fn scheduler(carriers: usize) -> Scheduler {
    Scheduler::new(
        SchedulerConfig::default()
            .with_carriers(carriers)
            .with_pin_sink(PinSink::Silent),
    )
    .unwrap()
}

/// Poll `cond` until it holds or five seconds pass.
fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < give_up, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn single_carrier_interleaves_yielding_tasks() {
    let sched = scheduler(1);
    let gate = Arc::new(CountDownLatch::new(1));
    let trace = Arc::new(Mutex::new(Vec::new()));
    let ids: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|name| {
            let (gate, trace) = (gate.clone(), trace.clone());
            sched
                .builder()
                .name(name)
                .submit(async move {
                    gate.wait().await?;
                    for i in 0..4 {
                        trace.lock().unwrap().push(format!("{name}{i}"));
                        yield_now().await?;
                    }
                    Ok(())
                })
                .unwrap()
        })
        .collect();
    wait_for("both tasks at the gate", || gate.waiting() == 2);
    gate.count_down();
    sched.await_all(&ids).unwrap();
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["a0", "b0", "a1", "b1", "a2", "b2", "a3", "b3"]
    );
}

#[test]
fn never_more_mounted_tasks_than_carriers() {
    let sched = scheduler(2);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let ids: Vec<_> = (0..5)
        .map(|_| {
            let (running, peak) = (running.clone(), peak.clone());
            sched
                .submit(async move {
                    for _ in 0..20 {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                        running.fetch_sub(1, Ordering::SeqCst);
                        yield_now().await?;
                    }
                    Ok(())
                })
                .unwrap()
        })
        .collect();
    sched.await_all(&ids).unwrap();
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(sched.stats().completed, 5);
}

#[test]
fn parked_tasks_free_their_carriers() {
    let sched = scheduler(2);
    let start = Instant::now();
    let ids: Vec<_> = (0..100)
        .map(|_| {
            sched
                .submit(async {
                    sleep(Duration::from_millis(50)).await?;
                    Ok(())
                })
                .unwrap()
        })
        .collect();
    sched.await_all(&ids).unwrap();
    // Pinned sleeps would need 100 * 50ms / 2 carriers.
    assert!(start.elapsed() < Duration::from_millis(1500), "took {:?}", start.elapsed());
    assert!(sched.pin_records().is_empty());
    assert!(ids.iter().all(|id| sched.task_state(*id) == Some(TaskState::Terminated)));
}

#[test]
fn lock_is_granted_in_arrival_order() {
    let sched = scheduler(1);
    let lock = Arc::new(ReentrantLock::new());
    let release = Arc::new(Signal::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let holder = {
        let (lock, release) = (lock.clone(), release.clone());
        sched
            .submit(async move {
                lock.lock().await?;
                release.wait().await?;
                lock.unlock()?;
                Ok(())
            })
            .unwrap()
    };
    let mut ids = vec![holder];
    for name in ["A", "B", "C"] {
        let (lock, order) = (lock.clone(), order.clone());
        ids.push(
            sched
                .submit(async move {
                    lock.lock().await?;
                    order.lock().unwrap().push(name);
                    lock.unlock()?;
                    Ok(())
                })
                .unwrap(),
        );
    }

    wait_for("three queued lockers", || lock.queue_len() == 3);
    assert_eq!(lock.queued(), ids[1..].to_vec());
    release.notify_one();
    sched.await_all(&ids).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    assert!(!lock.is_locked());
}

#[test]
fn reentrant_holds_and_foreign_unlock() {
    let sched = scheduler(2);
    let lock = Arc::new(ReentrantLock::new());
    let owner = {
        let lock = lock.clone();
        sched
            .submit(async move {
                lock.lock().await?;
                lock.lock().await?;
                assert_eq!(lock.hold_count(), 2);
                sleep(Duration::from_millis(100)).await?;
                lock.unlock()?;
                lock.unlock()?;
                assert!(!lock.is_held_by_current());
                Ok(())
            })
            .unwrap()
    };
    wait_for("owner to take the lock", || lock.is_locked());
    let intruder = {
        let lock = lock.clone();
        sched
            .submit(async move {
                match lock.unlock() {
                    Err(RuntimeError::InvalidState(_)) => Ok(()),
                    other => Err(TaskError::msg(format!("unexpected {other:?}"))),
                }
            })
            .unwrap()
    };
    sched.await_all(&[owner, intruder]).unwrap();
}

#[test]
fn timed_lock_gives_up_and_leaves_the_queue() {
    let sched = scheduler(2);
    let lock = Arc::new(ReentrantLock::new());
    let holder = {
        let lock = lock.clone();
        sched
            .submit(async move {
                lock.lock().await?;
                sleep(Duration::from_millis(300)).await?;
                lock.unlock()?;
                Ok(())
            })
            .unwrap()
    };
    wait_for("holder", || lock.is_locked());
    let waiter = {
        let lock = lock.clone();
        sched
            .submit(async move {
                match lock.lock_timeout(Duration::from_millis(30)).await {
                    Err(RuntimeError::Timeout) => {}
                    other => return Err(TaskError::msg(format!("unexpected {other:?}"))),
                }
                if lock.try_lock()? {
                    return Err(TaskError::msg("lock should still be held"));
                }
                Ok(())
            })
            .unwrap()
    };
    sched.await_all(&[waiter]).unwrap();
    assert_eq!(lock.queue_len(), 0);
    sched.await_all(&[holder]).unwrap();
}

async fn hold_for(
    lock: Arc<ReentrantLock>,
    inside: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    hold: Duration,
) -> TaskResult {
    lock.lock().await?;
    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
    peak.fetch_max(now, Ordering::SeqCst);
    let slept = sleep(hold).await;
    inside.fetch_sub(1, Ordering::SeqCst);
    lock.unlock()?;
    slept?;
    Ok(())
}

#[test]
fn lock_shared_by_two_schedulers_has_one_holder() {
    let a = scheduler(1);
    let b = scheduler(1);
    let lock = Arc::new(ReentrantLock::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let first = a
        .submit(hold_for(
            lock.clone(),
            inside.clone(),
            peak.clone(),
            Duration::from_millis(300),
        ))
        .unwrap();
    wait_for("first holder", || lock.is_locked());

    // Same task id as the holder, but from the other scheduler.
    let stranger = {
        let lock = lock.clone();
        b.submit(async move {
            if lock.try_lock()? {
                return Err(TaskError::msg("took a lock held elsewhere"));
            }
            match lock.unlock() {
                Err(RuntimeError::InvalidState(_)) => Ok(()),
                other => Err(TaskError::msg(format!("unexpected {other:?}"))),
            }
        })
        .unwrap()
    };
    assert_eq!(first, stranger);
    b.await_all(&[stranger]).unwrap();
    assert_eq!(lock.hold_count(), 0);
    assert_eq!(lock.holder(), Some(first));

    let second = b
        .submit(hold_for(
            lock.clone(),
            inside.clone(),
            peak.clone(),
            Duration::from_millis(10),
        ))
        .unwrap();
    a.await_all(&[first]).unwrap();
    b.await_all(&[second]).unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(!lock.is_locked());
}

#[test]
fn monitor_shared_by_two_schedulers_is_exclusive() {
    let a = scheduler(1);
    let b = scheduler(1);
    let monitor = Arc::new(NativeMonitor::new());
    let release = Arc::new(Signal::new());
    let owner = {
        let (monitor, release) = (monitor.clone(), release.clone());
        a.submit(async move {
            let _guard = monitor.enter();
            release.wait().await?;
            Ok(())
        })
        .unwrap()
    };
    wait_for("monitor owner", || monitor.is_held());
    let got_in = Arc::new(AtomicBool::new(false));
    let stranger = {
        let (monitor, got_in) = (monitor.clone(), got_in.clone());
        b.submit(async move {
            got_in.store(monitor.try_enter().is_some(), Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
    };
    assert_eq!(owner, stranger);
    b.await_all(&[stranger]).unwrap();
    assert!(!got_in.load(Ordering::SeqCst));
    release.notify_one();
    a.await_all(&[owner]).unwrap();
    assert!(!monitor.is_held());
}

#[test]
fn latch_releases_all_waiters_at_zero() {
    let sched = scheduler(2);
    let latch = Arc::new(CountDownLatch::new(3));
    let ids: Vec<_> = (0..2)
        .map(|_| {
            let latch = latch.clone();
            sched
                .submit(async move {
                    latch.wait().await?;
                    Ok(())
                })
                .unwrap()
        })
        .collect();
    wait_for("both waiters parked", || latch.waiting() == 2);
    assert_eq!(latch.count_down(), 0);
    assert_eq!(latch.count_down(), 0);
    wait_for("waiters still parked", || {
        ids.iter().all(|id| sched.task_state(*id) == Some(TaskState::Parked))
    });
    assert_eq!(latch.count_down(), 2);
    assert_eq!(latch.count_down(), 0);
    assert_eq!(latch.count(), 0);
    sched.await_all(&ids).unwrap();
}

#[test]
fn sleeping_inside_a_native_section_pins_once() {
    let sched = scheduler(2);
    let pinned = sched
        .submit(async {
            let _section = enter_native();
            sleep(Duration::from_millis(50)).await?;
            Ok(())
        })
        .unwrap();
    sched.await_all(&[pinned]).unwrap();
    let records = sched.pin_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event.task, pinned);
    assert!(records[0].blocked_for.unwrap() >= Duration::from_millis(40));

    let free = sched
        .submit(async {
            sleep(Duration::from_millis(50)).await?;
            Ok(())
        })
        .unwrap();
    sched.await_all(&[free]).unwrap();
    assert_eq!(sched.pin_records().len(), 1);
}

#[test]
fn pinned_holder_does_not_starve_lock_waiters() {
    let sched = scheduler(2);
    let lock = Arc::new(ReentrantLock::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let holder = {
        let (lock, counter) = (lock.clone(), counter.clone());
        sched
            .submit(async move {
                let _section = enter_native();
                lock.lock().await?;
                sleep(Duration::from_millis(100)).await?;
                counter.fetch_add(1, Ordering::SeqCst);
                lock.unlock()?;
                Ok(())
            })
            .unwrap()
    };
    wait_for("holder to take the lock", || lock.is_locked());
    let mut ids = vec![holder];
    for _ in 1..50 {
        let (lock, counter) = (lock.clone(), counter.clone());
        ids.push(
            sched
                .submit(async move {
                    lock.lock().await?;
                    counter.fetch_add(1, Ordering::SeqCst);
                    lock.unlock()?;
                    Ok(())
                })
                .unwrap(),
        );
    }
    sched.await_all(&ids).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 50);
    let records = sched.pin_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event.task, holder);
    assert!(records[0].blocked_for.unwrap() > Duration::ZERO);
}

#[test]
fn contended_monitor_blocks_carriers() {
    let sched = scheduler(2);
    let monitor = Arc::new(NativeMonitor::new());
    let ids: Vec<_> = (0..4)
        .map(|_| {
            let monitor = monitor.clone();
            sched
                .submit(async move {
                    let _guard = monitor.enter();
                    sleep(Duration::from_millis(20)).await?;
                    Ok(())
                })
                .unwrap()
        })
        .collect();
    sched.await_all(&ids).unwrap();
    assert_eq!(sched.pin_records().len(), 4);
    assert!(!monitor.is_held());
}

#[test]
fn cancellation_needs_a_suspension_point() {
    let sched = scheduler(1);
    let stop = Arc::new(AtomicBool::new(false));
    let spinner = {
        let stop = stop.clone();
        sched
            .submit(async move {
                while !stop.load(Ordering::SeqCst) {
                    std::hint::spin_loop();
                }
                Ok(())
            })
            .unwrap()
    };
    wait_for("spinner mounted", || sched.task_state(spinner) == Some(TaskState::Mounted));
    sched.cancel(spinner).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(sched.task_state(spinner), Some(TaskState::Mounted));
    stop.store(true, Ordering::SeqCst);
    sched.await_all(&[spinner]).unwrap();
}

#[test]
fn cancellation_surfaces_at_sleep() {
    let sched = scheduler(1);
    let sleeper = sched
        .submit(async {
            loop {
                sleep(Duration::from_millis(10)).await?;
            }
        })
        .unwrap();
    wait_for("sleeper parked", || sched.task_state(sleeper) == Some(TaskState::Parked));
    sched.cancel(sleeper).unwrap();
    match sched.await_all(&[sleeper]) {
        Err(RuntimeError::Aggregate(agg)) => {
            assert_eq!(agg.failures()[0].error, TaskError::Cancelled);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn closing_a_native_section_elsewhere_unpins() {
    let sched = scheduler(1);
    let slot: Arc<Mutex<Option<NativeSection>>> = Arc::new(Mutex::new(None));
    let go = Arc::new(Signal::new());
    let task = {
        let (slot, go) = (slot.clone(), go.clone());
        sched
            .submit(async move {
                *slot.lock().unwrap() = Some(enter_native());
                go.wait().await?;
                Ok(())
            })
            .unwrap()
    };
    wait_for("task pinned", || sched.task_state(task) == Some(TaskState::Pinned));
    assert_eq!(sched.carriers()[0].task, Some(task));

    drop(slot.lock().unwrap().take());
    wait_for("task parked", || sched.task_state(task) == Some(TaskState::Parked));
    assert_eq!(sched.carriers()[0].task, None);
    wait_for("pin closed", || {
        sched.pin_records().first().is_some_and(|r| r.blocked_for.is_some())
    });

    go.notify_one();
    sched.await_all(&[task]).unwrap();
}

#[test]
fn failures_are_isolated_and_aggregated() {
    let sched = scheduler(2);
    let ok = sched.submit(async { Ok(()) }).unwrap();
    let boom = sched
        .submit(async {
            sleep(Duration::from_millis(5)).await?;
            if true {
                panic!("deep failure");
            }
            Ok(())
        })
        .unwrap();
    let bad = sched.submit(async { Err(TaskError::msg("nope")) }).unwrap();
    match sched.await_all(&[ok, boom, bad]) {
        Err(RuntimeError::Aggregate(agg)) => {
            assert_eq!(agg.tasks().collect::<Vec<_>>(), vec![boom, bad]);
            assert_eq!(agg.failures()[0].error, TaskError::Panicked("deep failure".into()));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(sched.stats().failed, 2);
}

#[test]
fn await_any_prefers_success() {
    let sched = scheduler(2);
    let fails = sched.submit(async { Err(TaskError::msg("fast failure")) }).unwrap();
    let wins = sched
        .submit(async {
            sleep(Duration::from_millis(20)).await?;
            Ok(())
        })
        .unwrap();
    assert_eq!(sched.await_any(&[fails, wins]), Ok(wins));

    let a = sched.submit(async { Err(TaskError::msg("a")) }).unwrap();
    let b = sched.submit(async { Err(TaskError::msg("b")) }).unwrap();
    match sched.await_any(&[a, b]) {
        Err(RuntimeError::Aggregate(agg)) => assert_eq!(agg.len(), 2),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(sched.await_any(&[]), Err(RuntimeError::InvalidState(_))));
}

#[test]
fn await_all_timeout_leaves_tasks_running() {
    let sched = scheduler(1);
    let slow = sched
        .submit(async {
            sleep(Duration::from_millis(200)).await?;
            Ok(())
        })
        .unwrap();
    assert_eq!(
        sched.await_all_timeout(&[slow], Duration::from_millis(20)),
        Err(RuntimeError::Timeout)
    );
    sched.await_all(&[slow]).unwrap();
}

#[test]
fn children_are_joined_from_their_parent() {
    let sched = scheduler(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let factory = sched.factory("worker-", 1);
    let parent = {
        let (seen, spawner) = (seen.clone(), factory.clone());
        factory
            .submit(async move {
                let handle = Handle::current().ok_or_else(|| TaskError::msg("no scheduler"))?;
                let mut children = Vec::new();
                for _ in 0..3 {
                    let seen = seen.clone();
                    children.push(spawner.submit(async move {
                        let name = skein_rt::current_task_name().unwrap_or_default();
                        seen.lock().unwrap().push(name);
                        Ok(())
                    })?);
                }
                for child in children {
                    handle.join(child).await?;
                }
                Ok(())
            })
            .unwrap()
    };
    sched.await_all(&[parent]).unwrap();
    assert_eq!(sched.task_info(parent).unwrap().name.as_deref(), Some("worker-1"));
    let mut names = seen.lock().unwrap().clone();
    names.sort();
    assert_eq!(names, vec!["worker-2", "worker-3", "worker-4"]);
}

#[test]
fn join_reports_child_failure() {
    let sched = scheduler(2);
    let parent = sched
        .submit(async {
            let handle = Handle::current().ok_or_else(|| TaskError::msg("no scheduler"))?;
            let child = handle.submit(async { Err(TaskError::msg("child failed")) })?;
            match handle.join(child).await {
                Err(RuntimeError::Aggregate(agg)) if agg.len() == 1 => Ok(()),
                other => Err(TaskError::msg(format!("unexpected {other:?}"))),
            }
        })
        .unwrap();
    sched.await_all(&[parent]).unwrap();
}

#[test]
fn shutdown_waits_for_live_tasks() {
    let sched = scheduler(2);
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let done = done.clone();
        sched
            .submit(async move {
                sleep(Duration::from_millis(20)).await?;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }
    sched.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert!(sched.is_shut_down());
    assert_eq!(sched.reap(), 10);
    assert!(sched.tasks().is_empty());
}

#[test]
fn terminated_tasks_are_kept_until_reaped() {
    let sched = scheduler(1);
    let release = Arc::new(Signal::new());
    let finished = sched.submit(async { Ok(()) }).unwrap();
    sched.await_all(&[finished]).unwrap();
    let running = {
        let release = release.clone();
        sched
            .submit(async move {
                release.wait().await?;
                Ok(())
            })
            .unwrap()
    };
    wait_for("running task parked", || {
        sched.task_state(running) == Some(TaskState::Parked)
    });
    assert_eq!(sched.task_state(finished), Some(TaskState::Terminated));
    assert_eq!(sched.tasks().len(), 2);

    assert_eq!(sched.reap(), 1);
    assert_eq!(sched.task_state(finished), None);
    assert_eq!(sched.await_all(&[finished]), Err(RuntimeError::UnknownTask(finished)));
    assert_eq!(sched.task_state(running), Some(TaskState::Parked));

    release.notify_one();
    sched.await_all(&[running]).unwrap();
    assert_eq!(sched.reap(), 1);
    assert!(sched.tasks().is_empty());
}

#[test]
fn unknown_task_is_reported() {
    let sched = scheduler(1);
    let ghost = skein_rt::TaskId::from_raw(999);
    assert_eq!(sched.cancel(ghost), Err(RuntimeError::UnknownTask(ghost)));
    assert_eq!(sched.await_all(&[ghost]), Err(RuntimeError::UnknownTask(ghost)));
    assert_eq!(sched.task_state(ghost), None);
}
