use dart::{Dart, DartBuilder, Distribution, MemoryOrder, View, DART_TEAM_ALL};
use serial_test::serial;

fn launch<R: Send>(num_units: usize, f: impl Fn(&Dart) -> R + Sync) -> Vec<R> {
    DartBuilder::new()
        .with_threads(1)
        .launch(num_units, f)
        .unwrap()
}

/// Every unit fills its local part with global indices, then unit 0 reads a sub-view
/// through the transfer plan and writes it back negated.
fn view_roundtrip(
    dart: &Dart,
    extents: [usize; 2],
    dists: [Distribution; 2],
    order: MemoryOrder,
) -> Vec<i64> {
    let pattern = dart.pattern(DART_TEAM_ALL, extents, dists, order).unwrap();
    let elem = std::mem::size_of::<i64>();
    let base = dart
        .team_memalloc_aligned(DART_TEAM_ALL, pattern.local_capacity() * elem)
        .unwrap();
    let me = dart.team_myid(DART_TEAM_ALL).unwrap();
    let local: Vec<i64> = (0..pattern.local_size(me).unwrap())
        .map(|j| pattern.global(me, j).unwrap() as i64)
        .collect();
    dart.put_blocking(base.with_unit(me).unwrap(), &local).unwrap();
    dart.barrier(DART_TEAM_ALL).unwrap();

    let view = View::new(pattern, [1, 2], [extents[0] - 2, extents[1] - 3]).unwrap();
    let mut seen = Vec::new();
    if me == 0 {
        let mut buf = vec![0i64; view.size()];
        dart.get_view_blocking(base, &view, &mut buf).unwrap();
        let expect: Vec<i64> = view.indices().map(|i| i as i64).collect();
        assert_eq!(buf, expect);
        let negated: Vec<i64> = buf.iter().map(|v| -v).collect();
        dart.put_view_blocking(base, &view, &negated).unwrap();
        dart.flush_all().unwrap();
        seen = buf;
    }
    dart.barrier(DART_TEAM_ALL).unwrap();

    // the owners see exactly the view's elements negated
    let mut after = vec![0i64; local.len()];
    dart.get_blocking(&mut after, base.with_unit(me).unwrap()).unwrap();
    for (j, value) in after.iter().enumerate() {
        let global = pattern.global(me, j).unwrap();
        let coords = pattern.coords(global).unwrap();
        let inside = (0..2).all(|d| {
            coords[d] >= view.offset()[d] && coords[d] < view.offset()[d] + view.extent()[d]
        });
        let expect = if inside { -(global as i64) } else { global as i64 };
        assert_eq!(*value, expect);
    }
    dart.barrier(DART_TEAM_ALL).unwrap();
    dart.team_memfree(base).unwrap();
    seen
}

macro_rules! view_test {
    ($name:ident, $d0:expr, $d1:expr) => {
        paste::paste! {
            #[test]
            #[serial]
            fn [<view_ $name _row_major>]() {
                launch(4, |dart| view_roundtrip(dart, [8, 12], [$d0, $d1], MemoryOrder::RowMajor));
            }

            #[test]
            #[serial]
            fn [<view_ $name _col_major>]() {
                launch(4, |dart| view_roundtrip(dart, [8, 12], [$d0, $d1], MemoryOrder::ColMajor));
            }
        }
    };
}

view_test!(blocked_blocked, Distribution::Blocked, Distribution::Blocked);
view_test!(none_cyclic, Distribution::None, Distribution::Cyclic);
view_test!(blocked_blockcyclic, Distribution::Blocked, Distribution::BlockCyclic(5));
view_test!(tiles, Distribution::Tile(2), Distribution::Tile(3));

#[test]
#[serial]
fn view_buffer_must_match() {
    launch(2, |dart| {
        let pattern = dart
            .pattern(DART_TEAM_ALL, [10], [Distribution::Blocked], MemoryOrder::RowMajor)
            .unwrap();
        let base = dart.team_memalloc_aligned(DART_TEAM_ALL, 5 * 4).unwrap();
        let view = pattern.view();
        let mut short = [0i32; 3];
        assert!(dart.get_view_blocking(base, &view, &mut short[..]).is_err());
        let empty = View::new(pattern, [4], [0]).unwrap();
        dart.get_view_blocking(base, &empty, &mut [0i32; 0][..]).unwrap();
        dart.barrier(DART_TEAM_ALL).unwrap();
        dart.team_memfree(base).unwrap();
    });
}
