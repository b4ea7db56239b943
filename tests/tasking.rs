use dart::{
    Dart, DartBuilder, DartError, TaskDep, TaskRef, DART_TEAM_ALL, USER_AM_BASE,
};
use serial_test::serial;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const INT: i64 = std::mem::size_of::<i32>() as i64;

fn launch<R: Send>(num_units: usize, f: impl Fn(&Dart) -> R + Sync) -> Vec<R> {
    DartBuilder::new()
        .with_threads(2)
        .launch(num_units, f)
        .unwrap()
}

#[test]
#[serial]
fn handle_returns_value() {
    let results = launch(2, |dart| {
        let handle = dart.create_task_handle(|| 6 * 7, &[]).unwrap();
        handle.get().unwrap()
    });
    assert_eq!(results, vec![42, 42]);
}

#[test]
#[serial]
fn current_task_is_visible_inside_body() {
    launch(1, |dart| {
        assert!(dart.current_task().is_none());
        let d = dart.clone();
        let handle = dart
            .create_task_handle(move || d.current_task(), &[])
            .unwrap();
        let me = handle.task_ref();
        assert_eq!(handle.get().unwrap(), Some(me));
    });
}

#[test]
#[serial]
fn cancellation_skips_body_and_successors() {
    launch(1, |dart| {
        let x = dart.memalloc(INT as usize).unwrap();
        let gate = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicUsize::new(0));

        let producer = {
            let gate = gate.clone();
            dart.create_task_handle(
                move || {
                    while !gate.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                },
                &[TaskDep::output(x)],
            )
            .unwrap()
        };
        let victim = {
            let ran = ran.clone();
            dart.create_task_handle(
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                },
                &[TaskDep::input(x)],
            )
            .unwrap()
        };
        let follower = {
            let ran = ran.clone();
            dart.create_task_handle(
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                },
                &[TaskDep::direct(victim.task_ref())],
            )
            .unwrap()
        };
        dart.task_cancel(&victim.task_ref()).unwrap();
        gate.store(true, Ordering::SeqCst);

        producer.get().unwrap();
        assert_eq!(victim.get().unwrap_err(), DartError::NotFound);
        assert_eq!(follower.get().unwrap_err(), DartError::NotFound);
        dart.task_complete().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        dart.memfree(x).unwrap();
    });
}

#[test]
#[serial]
fn remote_tasks_cannot_be_cancelled() {
    launch(2, |dart| {
        let other = TaskRef {
            unit: (dart.my_unit() + 1) % 2,
            id: 0,
        };
        assert_eq!(dart.task_cancel(&other), Err(DartError::Inval));
    });
}

#[test]
#[serial]
fn nested_complete_waits_for_children() {
    let results = launch(2, |dart| {
        let d = dart.clone();
        let handle = dart
            .create_task_handle(
                move || {
                    let count = Arc::new(AtomicUsize::new(0));
                    for _ in 0..10 {
                        let count = count.clone();
                        d.create_task(
                            move || {
                                count.fetch_add(1, Ordering::SeqCst);
                            },
                            &[],
                        )
                        .unwrap();
                    }
                    d.task_complete().unwrap();
                    count.load(Ordering::SeqCst)
                },
                &[],
            )
            .unwrap();
        let children = handle.get().unwrap();
        dart.task_complete().unwrap();
        children
    });
    assert_eq!(results, vec![10, 10]);
}

#[test]
#[serial]
fn later_phases_wait_until_runnable() {
    launch(1, |dart| {
        assert_eq!(dart.current_phase().unwrap(), 0);
        assert_eq!(dart.phase_advance().unwrap(), 1);
        let flag = Arc::new(AtomicBool::new(false));
        let handle = {
            let flag = flag.clone();
            dart.create_task_handle(move || flag.store(true, Ordering::SeqCst), &[])
                .unwrap()
        };
        assert!(!handle.test());
        assert!(!flag.load(Ordering::SeqCst));
        dart.phase_set_runnable(1).unwrap();
        handle.wait().unwrap();
        assert!(flag.load(Ordering::SeqCst));
        dart.task_complete().unwrap();
    });
}

#[test]
#[serial]
fn resync_agrees_on_next_phase() {
    let results = launch(4, |dart| {
        for _ in 0..dart.my_unit() {
            dart.phase_advance().unwrap();
        }
        let phase = dart.phase_resync(DART_TEAM_ALL).unwrap();
        assert_eq!(dart.current_phase().unwrap(), phase);
        dart.task_complete().unwrap();
        phase
    });
    assert_eq!(results, vec![4; 4]);
}

#[test]
#[serial]
fn direct_dependency_across_units() {
    let results = launch(2, |dart| {
        let array = dart.team_memalloc_aligned(DART_TEAM_ALL, INT as usize).unwrap();
        let at_unit0 = array.with_unit(0).unwrap();
        let mut id = [0u64];
        if dart.my_unit() == 0 {
            let d = dart.clone();
            let task = dart
                .create_task(move || d.put_value(at_unit0, 5i32).unwrap(), &[])
                .unwrap();
            id[0] = task.id;
        }
        dart.bcast(DART_TEAM_ALL, 0, &mut id).unwrap();
        let mut seen = None;
        if dart.my_unit() == 1 {
            let d = dart.clone();
            let handle = dart
                .create_task_handle(
                    move || d.get_value::<i32>(at_unit0).unwrap(),
                    &[TaskDep::direct(TaskRef { unit: 0, id: id[0] })],
                )
                .unwrap();
            seen = Some(handle.get().unwrap());
        }
        dart.task_complete().unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();
        dart.team_memfree(array).unwrap();
        seen
    });
    assert_eq!(results[1], Some(5));
}

#[test]
#[serial]
fn copyin_fetches_neighbor_data() {
    let results = launch(4, |dart| {
        let n = dart.num_units();
        let me = dart.my_unit();
        let array = dart.team_memalloc_aligned(DART_TEAM_ALL, 4 * INT as usize).unwrap();
        let mine = array.with_unit(me).unwrap();
        let values: Vec<i32> = (0..4).map(|i| (me * 10 + i) as i32).collect();
        dart.put_blocking(mine, &values).unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();

        let neighbor = array.with_unit((me + 1) % n).unwrap();
        let buffer = dart.copyin(neighbor, 4 * INT as usize).unwrap();
        let again = dart.copyin(neighbor, 4 * INT as usize).unwrap();
        assert_eq!(again.gptr(), buffer.gptr());
        let dep = TaskDep::copyin(&buffer);
        let handle = dart
            .create_task_handle(move || buffer.to_values::<i32>(), &[dep])
            .unwrap();
        let got = handle.get().unwrap();
        dart.task_complete().unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();
        dart.team_memfree(array).unwrap();
        got
    });
    for (me, got) in results.into_iter().enumerate() {
        let from = ((me + 1) % 4) * 10;
        assert_eq!(got, (from..from + 4).map(|v| v as i32).collect::<Vec<_>>());
    }
}

#[test]
#[serial]
fn finalize_inside_task_is_rejected() {
    launch(1, |dart| {
        let d = dart.clone();
        let handle = dart.create_task_handle(move || d.finalize(), &[]).unwrap();
        assert_eq!(handle.get().unwrap(), Err(DartError::Inval));
    });
}

/// Unit 1 sends a marker after its dependency messages; once unit 0 handled the
/// marker it has handled everything unit 1 sent before it.
fn fence_from(dart: &Dart, sender: usize, seen: &AtomicBool) {
    if dart.my_unit() == sender {
        dart.request_send(0, USER_AM_BASE, Vec::new()).unwrap();
    } else if dart.my_unit() == 0 {
        while !seen.load(Ordering::SeqCst) {
            dart.progress().unwrap();
        }
    }
}

fn register_marker(dart: &Dart) -> Arc<AtomicBool> {
    let seen = Arc::new(AtomicBool::new(false));
    let flag = seen.clone();
    dart.register_handler(USER_AM_BASE, move |_, _| flag.store(true, Ordering::SeqCst))
        .unwrap();
    seen
}

#[test]
#[serial]
fn input_at_earlier_phase_skips_later_writer() {
    launch(1, |dart| {
        let x = dart.memalloc(INT as usize).unwrap();
        let first = dart
            .create_task_handle(|| (), &[TaskDep::output(x)])
            .unwrap();
        first.get().unwrap();
        assert_eq!(dart.phase_advance().unwrap(), 1);

        let gate = Arc::new(AtomicBool::new(false));
        let later_done = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::new(AtomicBool::new(false));
        let later = {
            let (gate, later_done) = (gate.clone(), later_done.clone());
            dart.create_task_handle(
                move || {
                    while !gate.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                    later_done.store(true, Ordering::SeqCst);
                },
                &[TaskDep::output(x)],
            )
            .unwrap()
        };
        let reader = {
            let (later_done, reader_done) = (later_done.clone(), reader_done.clone());
            dart.create_task_handle(
                move || {
                    let saw_later = later_done.load(Ordering::SeqCst);
                    reader_done.store(true, Ordering::SeqCst);
                    saw_later
                },
                &[TaskDep::input(x).at_phase(0)],
            )
            .unwrap()
        };
        // opens the gate once the reader ran, or after a grace period when it waits
        // for the later writer
        let opener = {
            let (gate, reader_done) = (gate.clone(), reader_done.clone());
            std::thread::spawn(move || {
                let start = Instant::now();
                while !reader_done.load(Ordering::SeqCst)
                    && start.elapsed() < Duration::from_secs(2)
                {
                    std::thread::sleep(Duration::from_millis(1));
                }
                gate.store(true, Ordering::SeqCst);
            })
        };
        dart.phase_set_runnable(1).unwrap();
        assert!(!reader.get().unwrap());
        later.get().unwrap();
        opener.join().unwrap();
        dart.task_complete().unwrap();
        dart.memfree(x).unwrap();
    });
}

#[test]
#[serial]
fn cancellation_reaches_remote_successor() {
    let results = launch(2, |dart| {
        let marker = register_marker(dart);
        dart.barrier(DART_TEAM_ALL).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let mut id = [0u64];
        let mut victim = None;
        if dart.my_unit() == 0 {
            // created in a phase that is not runnable yet, it cannot start early
            dart.phase_advance().unwrap();
            let ran = ran.clone();
            let handle = dart
                .create_task_handle(move || ran.fetch_add(1, Ordering::SeqCst), &[])
                .unwrap();
            id[0] = handle.task_ref().id;
            victim = Some(handle);
        }
        dart.bcast(DART_TEAM_ALL, 0, &mut id).unwrap();

        let mut successor = None;
        if dart.my_unit() == 1 {
            let ran = ran.clone();
            successor = Some(
                dart.create_task_handle(
                    move || ran.fetch_add(1, Ordering::SeqCst),
                    &[TaskDep::direct(TaskRef { unit: 0, id: id[0] })],
                )
                .unwrap(),
            );
        }
        fence_from(dart, 1, &marker);

        if let Some(victim) = victim {
            dart.task_cancel(&victim.task_ref()).unwrap();
            dart.phase_set_runnable(1).unwrap();
            assert_eq!(victim.get().unwrap_err(), DartError::NotFound);
        }
        let outcome = successor.map(|s| s.get());
        dart.task_complete().unwrap();
        (outcome, ran.load(Ordering::SeqCst))
    });
    assert_eq!(results[0], (None, 0));
    assert_eq!(results[1], (Some(Err(DartError::NotFound)), 0));
}

#[test]
#[serial]
fn remote_inout_waits_for_owner_writer() {
    let results = launch(2, |dart| {
        let array = dart.team_memalloc_aligned(DART_TEAM_ALL, INT as usize).unwrap();
        let x = array.with_unit(0).unwrap();
        dart.put_value(array.with_unit(dart.my_unit()).unwrap(), 0i32)
            .unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();

        if dart.my_unit() == 0 {
            let d = dart.clone();
            dart.create_task(
                move || {
                    std::thread::sleep(Duration::from_millis(50));
                    d.put_value(x, 7i32).unwrap();
                },
                &[TaskDep::output(x)],
            )
            .unwrap();
            // requests for phase 0 can be matched from now on
            dart.phase_advance().unwrap();
        } else {
            let d = dart.clone();
            dart.create_task(
                move || {
                    let v = d.get_value::<i32>(x).unwrap();
                    d.put_value(x, v + 1).unwrap();
                },
                &[TaskDep::inout(x)],
            )
            .unwrap();
        }
        dart.task_complete().unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();
        let seen = dart.get_value::<i32>(x).unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();
        dart.team_memfree(array).unwrap();
        seen
    });
    assert_eq!(results, vec![8, 8]);
}

#[test]
#[serial]
fn requests_for_later_phases_wait_for_owner() {
    let results = launch(2, |dart| {
        let marker = register_marker(dart);
        let array = dart
            .team_memalloc_aligned(DART_TEAM_ALL, 2 * INT as usize)
            .unwrap();
        let x = array.with_unit(0).unwrap();
        let y = x.offset_by(INT).unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();

        let mut readers = None;
        if dart.my_unit() == 1 {
            let (d1, d2) = (dart.clone(), dart.clone());
            let first = dart
                .create_task_handle(
                    move || d1.get_value::<i32>(x).unwrap(),
                    &[TaskDep::input(x).at_phase(1)],
                )
                .unwrap();
            let second = dart
                .create_task_handle(
                    move || d2.get_value::<i32>(y).unwrap(),
                    &[TaskDep::input(y).at_phase(2)],
                )
                .unwrap();
            readers = Some((first, second));
        }
        // both requests are queued at unit 0 before it creates the writers
        fence_from(dart, 1, &marker);

        if dart.my_unit() == 0 {
            dart.phase_advance().unwrap();
            let d = dart.clone();
            dart.create_task(move || d.put_value(x, 9i32).unwrap(), &[TaskDep::output(x)])
                .unwrap();
            dart.phase_advance().unwrap();
            let d = dart.clone();
            dart.create_task(move || d.put_value(y, 11i32).unwrap(), &[TaskDep::output(y)])
                .unwrap();
            dart.phase_set_runnable(2).unwrap();
        }
        // observed before task_complete
        let seen = readers.map(|(first, second)| (first.get().unwrap(), second.get().unwrap()));
        dart.barrier(DART_TEAM_ALL).unwrap();
        dart.task_complete().unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();
        dart.team_memfree(array).unwrap();
        seen
    });
    assert_eq!(results[1], Some((9, 11)));
}
