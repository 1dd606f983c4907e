//! Region behaviour under concurrent use.
//!
//! 1. Many threads allocating into one region see consistent accounting
//! 2. Destroying a parent from another thread invalidates children
//! 3. Value trees survive arbitrary nesting (property)

use proptest::prelude::*;
use sn_rts_region::{Materialized, Region, RegionError, Value};
use std::thread;

#[test]
fn test_concurrent_allocation_into_one_region() {
    let region = Region::root();
    let array = region.alloc_array(Vec::new()).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let region = region.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let s = region.alloc_str(&format!("w{worker}-{i}")).unwrap();
                    region.array_push(array, Value::Str(s)).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(region.array_len(array).unwrap(), 800);
    assert_eq!(region.live_objects(), 801);
    assert_eq!(region.stats().allocation_count, 801);
}

#[test]
fn test_destroy_from_other_thread() {
    let root = Region::root();
    let child = Region::child(&root).unwrap();
    let h = child.alloc_str("payload").unwrap();

    let remote = root.clone();
    thread::spawn(move || remote.destroy()).join().unwrap();

    assert!(matches!(child.read_str(h), Err(RegionError::Destroyed { .. })));
}

fn tree_strategy() -> impl Strategy<Value = Materialized> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(Materialized::Int),
        (-1.0e9f64..1.0e9).prop_map(Materialized::Double),
        any::<bool>().prop_map(Materialized::Bool),
        any::<u8>().prop_map(Materialized::Byte),
        any::<char>().prop_map(Materialized::Char),
        ".{0,12}".prop_map(Materialized::Str),
        prop::collection::vec(any::<u8>(), 1..24).prop_map(Materialized::Struct),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop::collection::vec(inner, 0..6).prop_map(Materialized::Array)
    })
}

proptest! {
    #[test]
    fn prop_child_region_reads_parent_trees(tree in tree_strategy()) {
        let root = Region::root();
        let child = Region::child(&root).unwrap();
        let value = root.build(&tree).unwrap();

        prop_assert_eq!(child.materialize(&value).unwrap(), tree);
        root.destroy();
    }
}
