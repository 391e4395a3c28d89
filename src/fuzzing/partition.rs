/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Fuzz the partition lattice: region bookkeeping under arbitrary
//! edits, and the join against a naive closure.

use alloc::vec::Vec;

use crate::fuzzing::arbitrary::{Arbitrary, Result, Unstructured};
use crate::partition::{Partition, RegionInfo};
use crate::{IsolationDomain, Value};

const MAX_VALUES: usize = 24;

#[derive(Clone, Copy, Debug)]
enum Edit {
    Fresh(Value),
    Assign(Value, Value),
    Merge(Value, Value),
    Remove(Value),
}

impl<'a> Arbitrary<'a> for Edit {
    fn arbitrary(u: &mut Unstructured<'a>) -> Result<Edit> {
        let value = |u: &mut Unstructured<'a>| -> Result<Value> {
            Ok(Value::new(u.int_in_range(0..=MAX_VALUES - 1)?))
        };
        Ok(match u.int_in_range(0..=3)? {
            0 => Edit::Fresh(value(u)?),
            1 => Edit::Assign(value(u)?, value(u)?),
            2 => Edit::Merge(value(u)?, value(u)?),
            _ => Edit::Remove(value(u)?),
        })
    }
}

#[derive(Clone, Debug)]
pub struct TestCase {
    a: Vec<Edit>,
    b: Vec<Edit>,
    /// A parent array whose links only ever point downwards.
    parents: Vec<u32>,
}

impl<'a> Arbitrary<'a> for TestCase {
    fn arbitrary(u: &mut Unstructured<'a>) -> Result<TestCase> {
        let edits = |u: &mut Unstructured<'a>| -> Result<Vec<Edit>> {
            let n = u.int_in_range(0..=64)?;
            (0..n).map(|_| Edit::arbitrary(u)).collect()
        };
        let a = edits(u)?;
        let b = edits(u)?;
        let mut parents = Vec::new();
        for i in 0..u.int_in_range(0..=MAX_VALUES)? {
            let present: Vec<u32> = (0..i as u32)
                .filter(|&j| parents[j as usize] != u32::MAX)
                .collect();
            let parent = match u.int_in_range(0..=2)? {
                0 => u32::MAX,
                1 if !present.is_empty() => *u.choose(&present)?,
                _ => i as u32,
            };
            parents.push(parent);
        }
        Ok(TestCase { a, b, parents })
    }
}

fn apply(edits: &[Edit]) -> Partition {
    let fresh = RegionInfo::new(IsolationDomain::Nonisolated);
    let mut p = Partition::new();
    for &edit in edits {
        match edit {
            Edit::Fresh(v) => {
                p.assign_fresh(v, fresh);
            }
            Edit::Assign(d, s) => {
                let tracked = p.contains(s);
                assert_eq!(p.assign(d, s), tracked);
                if tracked {
                    assert!(p.same_region(d, s));
                }
            }
            Edit::Merge(a, b) => {
                let both = p.contains(a) && p.contains(b);
                assert_eq!(p.merge(a, b).is_some(), both);
                if both {
                    assert!(p.same_region(a, b));
                }
            }
            Edit::Remove(v) => {
                p.remove(v);
                assert!(!p.contains(v));
            }
        }
        check_consistent(&p);
    }
    p
}

/// Every tracked value belongs to a region with state, and the region
/// count matches the classes.
fn check_consistent(p: &Partition) {
    let classes = p.classes();
    assert_eq!(classes.len(), p.num_regions());
    assert_eq!(classes.iter().map(|c| c.len()).sum::<usize>(), p.len());
    for class in &classes {
        let region = p.region_of(class[0]).expect("class member is untracked");
        assert!(p.info(region).is_some());
        assert!(class.iter().all(|&v| p.region_of(v) == Some(region)));
        assert_eq!(p.elements_of(region).count(), class.len());
    }
}

/// Label propagation over both partitions: the reference join.
fn naive_join(a: &Partition, b: &Partition) -> Vec<Vec<Value>> {
    let mut label: Vec<Option<usize>> = alloc::vec![None; MAX_VALUES];
    for v in a.values().chain(b.values()) {
        label[v.index()] = Some(v.index());
    }
    let mut changed = true;
    while changed {
        changed = false;
        for side in [a, b] {
            for class in side.classes() {
                let min = class.iter().filter_map(|v| label[v.index()]).min();
                for v in &class {
                    if label[v.index()] != min {
                        label[v.index()] = min;
                        changed = true;
                    }
                }
            }
        }
    }
    let mut classes: Vec<Vec<Value>> = Vec::new();
    for root in 0..MAX_VALUES {
        let class: Vec<Value> = (0..MAX_VALUES)
            .filter(|&i| label[i] == Some(root))
            .map(Value::new)
            .collect();
        if !class.is_empty() {
            classes.push(class);
        }
    }
    classes.sort();
    classes
}

pub fn check(t: TestCase) {
    let a = apply(&t.a);
    let b = apply(&t.b);

    let ab = a.join(&b);
    check_consistent(&ab);
    assert_eq!(ab.classes(), naive_join(&a, &b));
    assert_eq!(ab.classes(), b.join(&a).classes());
    assert_eq!(a.join(&a).classes(), a.classes());

    // The join is canonical already.
    let mut canon = ab.clone();
    canon.canonicalize();
    assert_eq!(canon, ab);

    let fresh = RegionInfo::new(IsolationDomain::Nonisolated);
    let rebuilt = Partition::from_union_find(&a.to_union_find(), fresh);
    assert_eq!(rebuilt.classes(), a.classes());
    let from_parents = Partition::from_union_find(&t.parents, fresh);
    check_consistent(&from_parents);
    assert_eq!(
        Partition::from_union_find(&from_parents.to_union_find(), fresh),
        from_parents
    );
}
