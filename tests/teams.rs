use dart::{Dart, DartBuilder, DartError, DartOp, Group, DART_TEAM_ALL, USER_AM_BASE};
use serial_test::serial;

fn launch<R: Send>(num_units: usize, f: impl Fn(&Dart) -> R + Sync) -> Vec<R> {
    DartBuilder::new()
        .with_threads(1)
        .launch(num_units, f)
        .unwrap()
}

#[test]
#[serial]
fn split_into_consecutive_teams() {
    let results = launch(4, |dart| {
        let before = dart.next_avail_team_id();
        let team = dart.team_split(DART_TEAM_ALL, 2).unwrap().unwrap();
        assert_eq!(dart.team_size(team).unwrap(), 2);
        assert_eq!(dart.team_parent(team).unwrap(), Some(DART_TEAM_ALL));
        let me = dart.team_myid(team).unwrap();
        assert_eq!(dart.team_unit_l2g(team, me).unwrap(), dart.my_unit());
        assert_eq!(dart.team_unit_g2l(team, dart.my_unit()).unwrap(), me);
        let group = dart.team_get_group(team).unwrap();

        let mut sum = [0i64];
        dart.allreduce(team, &[dart.my_unit() as i64], &mut sum, DartOp::Sum)
            .unwrap();
        dart.barrier(team).unwrap();
        dart.team_destroy(team).unwrap();
        assert_eq!(dart.team_size(team), Err(DartError::NotFound));
        assert!(dart.next_avail_team_id() > before);
        (group.members().to_vec(), sum[0])
    });
    assert_eq!(results[0], (vec![0, 1], 1));
    assert_eq!(results[1], (vec![0, 1], 1));
    assert_eq!(results[2], (vec![2, 3], 5));
    assert_eq!(results[3], (vec![2, 3], 5));
}

#[test]
#[serial]
fn team_ids_agree_and_advance() {
    let results = launch(3, |dart| {
        let all = Group::all(dart.num_units());
        let first = dart.team_create(DART_TEAM_ALL, &all).unwrap().unwrap();
        dart.team_destroy(first).unwrap();
        let second = dart.team_create(DART_TEAM_ALL, &all).unwrap().unwrap();
        dart.team_destroy(second).unwrap();
        (first.id(), second.id())
    });
    for (first, second) in &results {
        assert_eq!((*first, *second), results[0]);
        assert!(second > first);
    }
}

#[test]
#[serial]
fn nested_teams_and_bad_requests() {
    launch(4, |dart| {
        let me = dart.my_unit();
        let upper = dart
            .team_create(DART_TEAM_ALL, &Group::from_units([1, 2, 3]))
            .unwrap();
        assert_eq!(upper.is_some(), me != 0);
        if let Some(upper) = upper {
            assert_eq!(
                dart.team_create(upper, &Group::from_units([0, 1])),
                Err(DartError::Inval)
            );
            let pair = dart.team_create(upper, &Group::from_units([2, 3])).unwrap();
            if let Some(pair) = pair {
                assert_eq!(dart.team_parent(pair).unwrap(), Some(upper));
                assert_eq!(dart.team_unit_l2g(pair, 1).unwrap(), 3);
                assert_eq!(dart.team_unit_g2l(pair, 1), Err(DartError::NotFound));
                let mut value = [me as i32];
                dart.bcast(pair, 1, &mut value).unwrap();
                assert_eq!(value[0], 3);
                dart.team_destroy(pair).unwrap();
            }
            dart.team_destroy(upper).unwrap();
        }
        assert_eq!(dart.team_destroy(DART_TEAM_ALL), Err(DartError::Inval));
    });
}

#[test]
#[serial]
fn gather_scatter_on_team() {
    let results = launch(4, |dart| {
        let mut gathered = [0i32; 4];
        dart.gather(DART_TEAM_ALL, 2, &[dart.my_unit() as i32 * 2], &mut gathered)
            .unwrap();
        let mut part = [0i32; 2];
        let src: Vec<i32> = (0..8).collect();
        dart.scatter(DART_TEAM_ALL, 0, &src, &mut part).unwrap();
        let mut min = [0i32];
        dart.reduce(DART_TEAM_ALL, 3, &part[..1], &mut min, DartOp::Min)
            .unwrap();
        (gathered, part, min[0])
    });
    assert_eq!(results[2].0, [0, 2, 4, 6]);
    for (unit, (_, part, _)) in results.iter().enumerate() {
        assert_eq!(*part, [2 * unit as i32, 2 * unit as i32 + 1]);
    }
    assert_eq!(results[3].2, 0);
}

#[test]
#[serial]
fn user_messages_are_handled_in_order() {
    use std::sync::{Arc, Mutex};
    let results = launch(2, |dart| {
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            dart.register_handler(USER_AM_BASE, move |src, payload| {
                seen.lock().unwrap().push((src, payload[0]));
            })
            .unwrap();
        }
        assert_eq!(
            dart.register_handler(1, |_, _| {}),
            Err(DartError::Inval)
        );
        dart.barrier(DART_TEAM_ALL).unwrap();
        let peer = (dart.my_unit() + 1) % 2;
        for i in 0..5u8 {
            dart.request_send(peer, USER_AM_BASE, vec![i]).unwrap();
        }
        while seen.lock().unwrap().len() < 5 {
            dart.progress().unwrap();
        }
        dart.barrier(DART_TEAM_ALL).unwrap();
        let seen = seen.lock().unwrap().clone();
        seen
    });
    assert_eq!(results[0], (0..5u8).map(|i| (1usize, i)).collect::<Vec<_>>());
    assert_eq!(results[1], (0..5u8).map(|i| (0usize, i)).collect::<Vec<_>>());
}

#[test]
#[serial]
fn destroy_requires_freed_segments() {
    launch(2, |dart| {
        let team = dart
            .team_create(DART_TEAM_ALL, &Group::all(dart.num_units()))
            .unwrap()
            .unwrap();
        let array = dart.team_memalloc_aligned(team, 32).unwrap();
        assert_eq!(dart.team_destroy(team), Err(DartError::Inval));
        dart.team_memfree(array).unwrap();
        dart.team_destroy(team).unwrap();
    });
}

#[test]
#[serial]
fn mismatched_contributions_are_rejected() {
    launch(4, |dart| {
        let me = dart.my_unit() as i32;
        let src: Vec<i32> = if me == 1 { vec![me, me] } else { vec![me] };

        let mut gathered = [0i32; 4];
        assert_eq!(
            dart.gather(DART_TEAM_ALL, 0, &src, &mut gathered),
            Err(DartError::Inval)
        );
        let mut all = [0i32; 4];
        assert_eq!(dart.allgather(DART_TEAM_ALL, &src, &mut all), Err(DartError::Inval));
        let mut sum = vec![0i32; src.len()];
        assert_eq!(
            dart.allreduce(DART_TEAM_ALL, &src, &mut sum, DartOp::Sum),
            Err(DartError::Inval)
        );

        // unit 3 asks for a chunk past the end of the root's buffer
        let whole: Vec<i32> = (0..8).collect();
        let mut part = if me == 3 { vec![0i32; 3] } else { vec![0i32; 2] };
        let res = dart.scatter(DART_TEAM_ALL, 0, &whole, &mut part);
        assert_eq!(res.is_err(), me == 3);

        // the team is still usable afterwards
        let mut total = [0i32];
        dart.allreduce(DART_TEAM_ALL, &[me], &mut total, DartOp::Sum)
            .unwrap();
        assert_eq!(total[0], 6);
    });
}
