// tests/property/object_refs.rs

use crate::common::{o, t};

use std::collections::BTreeSet;

use proptest::prelude::*;

use taskgov::errors::StoreError;
use taskgov::store::ObjectStore;
use taskgov::types::{SessionId, WorkerId};

#[derive(Debug, Clone)]
enum Op {
    Acquire(u64),
    Release(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![(1u64..6).prop_map(Op::Acquire), (1u64..6).prop_map(Op::Release)]
}

proptest! {
    #[test]
    fn ref_count_tracks_distinct_holders(
        ops in proptest::collection::vec(op_strategy(), 0..40),
        pinned in any::<bool>(),
    ) {
        let mut store = ObjectStore::new();
        store.register(o(1), SessionId(1), Some(t(100)), pinned, None);
        prop_assert!(store.place(o(1), WorkerId(1), 16, false)?);
        // A consumer outside the generated range keeps o1 alive until the end.
        let keeper = t(0);
        prop_assert!(store.acquire(o(1), keeper)?);

        let mut holders = BTreeSet::new();
        for op in ops {
            match op {
                Op::Acquire(task) => {
                    let fresh = store.acquire(o(1), t(task))?;
                    prop_assert_eq!(fresh, holders.insert(task));
                }
                Op::Release(task) => {
                    let result = store.release(o(1), t(task));
                    if holders.remove(&task) {
                        prop_assert_eq!(result, Ok(()));
                    } else {
                        prop_assert_eq!(result, Err(StoreError::NotHeld { object: o(1), task: t(task) }));
                    }
                }
            }
            prop_assert_eq!(store.ref_count(o(1)), holders.len() + 1);
            // Held objects are never collected.
            prop_assert!(store.gc_sweep().is_empty());
            prop_assert!(store.is_available(o(1)));
        }

        for task in std::mem::take(&mut holders) {
            store.release(o(1), t(task))?;
        }
        prop_assert!(store.gc_sweep().is_empty(), "the keeper still holds o1");
        store.release(o(1), keeper)?;
        prop_assert_eq!(store.ref_count(o(1)), 0);
        let removals = store.gc_sweep();
        prop_assert_eq!(store.is_removed(o(1)), !pinned);
        if !pinned {
            prop_assert_eq!(removals.get(&WorkerId(1)), Some(&vec![o(1)]));
        }
    }
}
