use dart::{
    Dart, DartBuilder, DartOp, Distribution, Group, MemoryOrder, TaskDep, DART_TEAM_ALL,
};
use serial_test::serial;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

const NUM_UNITS: usize = 4;
const INT: i64 = std::mem::size_of::<i32>() as i64;

fn launch<R: Send>(f: impl Fn(&Dart) -> R + Sync) -> Vec<R> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    DartBuilder::new()
        .with_threads(2)
        .with_trace(false)
        .launch(NUM_UNITS, f)
        .unwrap()
}

#[test]
#[serial]
fn broadcast_sum() {
    let results = launch(|dart| {
        let mut value = [0i32];
        if dart.my_unit() == 0 {
            value[0] = 42;
        }
        dart.bcast(DART_TEAM_ALL, 0, &mut value).unwrap();
        value[0] += dart.my_unit() as i32;
        let mut sum = [0i32];
        dart.allreduce(DART_TEAM_ALL, &value, &mut sum, DartOp::Sum)
            .unwrap();
        sum[0]
    });
    assert_eq!(results, vec![174; NUM_UNITS]);
}

#[test]
#[serial]
fn blocked_array_write_read() {
    let results = launch(|dart| {
        let pattern = dart
            .pattern(DART_TEAM_ALL, [20], [Distribution::Blocked], MemoryOrder::RowMajor)
            .unwrap();
        assert_eq!(pattern.block_extents(), [5]);
        let array = dart
            .team_memalloc_aligned(DART_TEAM_ALL, pattern.local_capacity() * INT as usize)
            .unwrap();
        let (owner, offset) = pattern.local_at(&[7]).unwrap();
        let elem = array
            .with_unit(owner)
            .unwrap()
            .offset_by(offset as i64 * INT)
            .unwrap();
        if dart.my_unit() == 1 {
            dart.put_blocking(elem, &[99i32]).unwrap();
        }
        dart.barrier(DART_TEAM_ALL).unwrap();
        let mut read = [0i32];
        if dart.my_unit() == 3 {
            dart.get_blocking(&mut read, elem).unwrap();
        }
        dart.barrier(DART_TEAM_ALL).unwrap();
        dart.team_memfree(array).unwrap();
        (owner, read[0])
    });
    assert_eq!(results[3], (1, 99));
    assert!(results.iter().all(|(owner, _)| *owner == 1));
}

#[test]
#[serial]
fn lock_protects_counter() {
    let results = launch(|dart| {
        let counter = dart.team_memalloc_aligned(DART_TEAM_ALL, INT as usize).unwrap();
        let lock = dart.team_lock_init(DART_TEAM_ALL).unwrap();
        for _ in 0..10 {
            lock.acquire().unwrap();
            let c: i32 = dart.get_value(counter).unwrap();
            dart.put_value(counter, c + 1).unwrap();
            dart.flush(counter).unwrap();
            lock.release().unwrap();
        }
        dart.barrier(DART_TEAM_ALL).unwrap();
        let total: i32 = dart.get_value(counter).unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();
        lock.free().unwrap();
        dart.team_memfree(counter).unwrap();
        total
    });
    assert_eq!(results, vec![40; NUM_UNITS]);
}

#[test]
#[serial]
fn local_task_chain() {
    let results = launch(|dart| {
        let v = dart.memalloc(100 * INT as usize).unwrap();
        let elem = |i: usize| v.offset_by(i as i64 * INT).unwrap();
        for i in 0..100 {
            let d = dart.clone();
            let mut deps = vec![TaskDep::output(elem(i))];
            if i > 0 {
                deps.push(TaskDep::input(elem(i - 1)));
            }
            let (src, dst) = (if i > 0 { Some(elem(i - 1)) } else { None }, elem(i));
            dart.create_task(
                move || {
                    let prev = src.map_or(0, |g| d.get_value::<i32>(g).unwrap());
                    d.put_value(dst, prev + 1).unwrap();
                },
                &deps,
            )
            .unwrap();
        }
        dart.task_complete().unwrap();
        let mut values = vec![0i32; 100];
        dart.get_blocking(&mut values, v).unwrap();
        dart.memfree(v).unwrap();
        values
    });
    let expected: Vec<i32> = (1..=100).collect();
    for values in results {
        assert_eq!(values, expected);
    }
}

#[test]
#[serial]
fn remote_data_flow() {
    let results = launch(|dart| {
        let array = dart.team_memalloc_aligned(DART_TEAM_ALL, INT as usize).unwrap();
        let at_unit0 = array.with_unit(0).unwrap();
        let r = Arc::new(AtomicI32::new(0));
        if dart.my_unit() == 0 {
            let d = dart.clone();
            dart.create_task(
                move || d.put_value(at_unit0, 7i32).unwrap(),
                &[TaskDep::output(at_unit0)],
            )
            .unwrap();
        }
        dart.phase_advance().unwrap();
        if dart.my_unit() == 1 {
            let d = dart.clone();
            let r = r.clone();
            dart.create_task(
                move || r.store(d.get_value::<i32>(at_unit0).unwrap(), Ordering::SeqCst),
                &[TaskDep::input(at_unit0)],
            )
            .unwrap();
        }
        dart.task_complete().unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();
        dart.team_memfree(array).unwrap();
        r.load(Ordering::SeqCst)
    });
    assert_eq!(results[1], 7);
}

#[test]
#[serial]
fn split_team_collective() {
    let results = launch(|dart| {
        let evens = Group::from_units((0..NUM_UNITS).step_by(2));
        let odds = Group::from_units((1..NUM_UNITS).step_by(2));
        let even_team = dart.team_create(DART_TEAM_ALL, &evens).unwrap();
        let odd_team = dart.team_create(DART_TEAM_ALL, &odds).unwrap();
        let team = even_team.or(odd_team).unwrap();
        assert_eq!(dart.team_size(team).unwrap(), 2);

        let pattern = dart
            .pattern(team, [4], [Distribution::Blocked], MemoryOrder::RowMajor)
            .unwrap();
        let array = dart
            .team_memalloc_aligned(team, pattern.local_capacity() * INT as usize)
            .unwrap();
        let me = dart.team_myid(team).unwrap();
        let local = [pattern.local_size(me).unwrap() as i64];
        let mut sum = [0i64];
        dart.allreduce(team, &local, &mut sum, DartOp::Sum).unwrap();
        dart.team_memfree(array).unwrap();
        dart.team_destroy(team).unwrap();
        (even_team.is_some(), pattern.size(), sum[0])
    });
    for (unit, (even, size, sum)) in results.into_iter().enumerate() {
        assert_eq!(even, unit % 2 == 0);
        assert_eq!(size, 4);
        assert_eq!(sum, 4);
    }
}
