/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Region tracking: a partition of the live tracked values into
//! regions, with per-region isolation and consumption state.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::ir::Operand;
use crate::isolation::IsolationDomain;
use crate::{Inst, RegionId, Value};

const ABSENT: u32 = u32::MAX;

/// Whether a region may still be used from the current domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionStatus {
    Live,
    /// Consumed within the current domain at `site`.
    Consumed { site: Inst },
    /// Handed to `to` by the operand `site`.
    Transferred { site: Operand, to: IsolationDomain },
}

impl RegionStatus {
    fn rank(&self) -> u8 {
        match self {
            RegionStatus::Live => 0,
            RegionStatus::Consumed { .. } => 1,
            RegionStatus::Transferred { .. } => 2,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, RegionStatus::Live)
    }

    /// The status after a control-flow join: the worse status wins, and
    /// between two sites of the same kind the earlier one is kept so
    /// that the join is order independent.
    pub fn merge(self, other: RegionStatus) -> RegionStatus {
        use RegionStatus::*;
        match (self, other) {
            (Consumed { site: a }, Consumed { site: b }) => Consumed { site: a.min(b) },
            (Transferred { site: a, to: ta }, Transferred { site: b, to: tb }) => {
                if b < a {
                    Transferred { site: b, to: tb }
                } else {
                    Transferred { site: a, to: ta }
                }
            }
            (a, b) => {
                if b.rank() > a.rank() {
                    b
                } else {
                    a
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub domain: IsolationDomain,
    pub status: RegionStatus,
    /// False for regions reachable from the caller (parameters and
    /// anything merged with them): the function does not own them.
    pub transferable: bool,
}

impl RegionInfo {
    pub fn new(domain: IsolationDomain) -> Self {
        RegionInfo {
            domain,
            status: RegionStatus::Live,
            transferable: true,
        }
    }

    pub fn pinned(domain: IsolationDomain) -> Self {
        RegionInfo {
            transferable: false,
            ..RegionInfo::new(domain)
        }
    }

    pub fn merge(self, other: RegionInfo) -> RegionInfo {
        RegionInfo {
            domain: self.domain.merge(other.domain),
            status: self.status.merge(other.status),
            transferable: self.transferable && other.transferable,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RegionData {
    info: RegionInfo,
    len: u32,
}

/// Disjoint regions over a set of values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    elements: BTreeMap<Value, RegionId>,
    regions: BTreeMap<RegionId, RegionData>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked values.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn contains(&self, value: Value) -> bool {
        self.elements.contains_key(&value)
    }

    pub fn region_of(&self, value: Value) -> Option<RegionId> {
        self.elements.get(&value).copied()
    }

    pub fn info(&self, region: RegionId) -> Option<&RegionInfo> {
        self.regions.get(&region).map(|data| &data.info)
    }

    pub fn info_mut(&mut self, region: RegionId) -> Option<&mut RegionInfo> {
        self.regions.get_mut(&region).map(|data| &mut data.info)
    }

    pub fn info_of(&self, value: Value) -> Option<&RegionInfo> {
        self.region_of(value).and_then(|region| self.info(region))
    }

    pub fn info_of_mut(&mut self, value: Value) -> Option<&mut RegionInfo> {
        let region = self.region_of(value)?;
        self.info_mut(region)
    }

    pub fn same_region(&self, a: Value, b: Value) -> bool {
        match (self.region_of(a), self.region_of(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    /// The values in `region`, in ascending order.
    pub fn elements_of(&self, region: RegionId) -> impl Iterator<Item = Value> + '_ {
        self.elements
            .iter()
            .filter(move |&(_, &r)| r == region)
            .map(|(&v, _)| v)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.elements.keys().copied()
    }

    pub fn regions(&self) -> impl Iterator<Item = (RegionId, &RegionInfo)> + '_ {
        self.regions.iter().map(|(&r, data)| (r, &data.info))
    }

    fn fresh_id(&self) -> RegionId {
        match self.regions.last_key_value() {
            Some((&last, _)) => RegionId(last.0 + 1),
            None => RegionId(0),
        }
    }

    fn insert(&mut self, value: Value, region: RegionId) {
        debug_assert!(!self.elements.contains_key(&value));
        self.elements.insert(value, region);
        if let Some(data) = self.regions.get_mut(&region) {
            data.len += 1;
        }
    }

    /// Stop tracking `value`. Its region disappears with its last
    /// element.
    pub fn remove(&mut self, value: Value) {
        let Some(region) = self.elements.remove(&value) else {
            return;
        };
        if let Some(data) = self.regions.get_mut(&region) {
            data.len -= 1;
            if data.len == 0 {
                self.regions.remove(&region);
            }
        }
    }

    /// Put `value` in a new singleton region.
    pub fn assign_fresh(&mut self, value: Value, info: RegionInfo) -> RegionId {
        self.remove(value);
        let region = self.fresh_id();
        self.regions.insert(region, RegionData { info, len: 0 });
        self.insert(value, region);
        trace!("  {} -> fresh {:?}", value, region);
        region
    }

    /// Move `dest` into the region of `src`, detaching it from its old
    /// region. Returns false, leaving `dest` untouched, if `src` is not
    /// tracked.
    pub fn assign(&mut self, dest: Value, src: Value) -> bool {
        if dest == src {
            return self.contains(src);
        }
        let Some(region) = self.region_of(src) else {
            return false;
        };
        self.remove(dest);
        self.insert(dest, region);
        true
    }

    /// Union the regions of `a` and `b`. The merged region keeps the
    /// smaller id. Returns the merged region, or `None` if either value
    /// is untracked.
    pub fn merge(&mut self, a: Value, b: Value) -> Option<RegionId> {
        let ra = self.region_of(a)?;
        let rb = self.region_of(b)?;
        if ra == rb {
            return Some(ra);
        }
        let (keep, gone) = if ra < rb { (ra, rb) } else { (rb, ra) };
        let gone_data = self.regions.remove(&gone)?;
        for region in self.elements.values_mut() {
            if *region == gone {
                *region = keep;
            }
        }
        if let Some(data) = self.regions.get_mut(&keep) {
            data.info = data.info.merge(gone_data.info);
            data.len += gone_data.len;
        }
        trace!("  merge {:?} into {:?}", gone, keep);
        Some(keep)
    }

    /// Simultaneously assign every `dest` from its `src`, reading all
    /// sources before writing any destination. A `None` or untracked
    /// source gives `dest` a fresh region with `fresh`.
    pub fn assign_parallel(&mut self, pairs: &[(Value, Option<Value>)], fresh: RegionInfo) {
        let snapshot: Vec<Option<(RegionId, RegionInfo)>> = pairs
            .iter()
            .map(|&(_, src)| {
                let region = self.region_of(src?)?;
                Some((region, *self.info(region)?))
            })
            .collect();
        for &(dest, _) in pairs {
            self.remove(dest);
        }
        // Reinstate every snapshot region before handing out fresh ids,
        // which must not collide with a region removed above.
        for (&(dest, _), snap) in pairs.iter().zip(&snapshot) {
            if let Some((region, info)) = *snap {
                if !self.regions.contains_key(&region) {
                    self.regions.insert(region, RegionData { info, len: 0 });
                }
                if !self.contains(dest) {
                    self.insert(dest, region);
                }
            }
        }
        for (&(dest, _), snap) in pairs.iter().zip(&snapshot) {
            if snap.is_none() && !self.contains(dest) {
                self.assign_fresh(dest, fresh);
            }
        }
    }

    /// Keep only the values for which `keep` returns true.
    pub fn retain<F: FnMut(Value) -> bool>(&mut self, mut keep: F) {
        let dropped: Vec<Value> = self
            .elements
            .keys()
            .copied()
            .filter(|&v| !keep(v))
            .collect();
        for v in dropped {
            self.remove(v);
        }
    }

    /// Renumber every region to the index of its smallest element, so
    /// that equal partitions compare equal.
    pub fn canonicalize(&mut self) {
        let mut renumber: BTreeMap<RegionId, RegionId> = BTreeMap::new();
        for (&value, &region) in &self.elements {
            renumber.entry(region).or_insert(RegionId(value.0));
        }
        if renumber.iter().all(|(old, new)| old == new) {
            return;
        }
        for region in self.elements.values_mut() {
            *region = renumber[&*region];
        }
        let regions = core::mem::take(&mut self.regions);
        self.regions = regions
            .into_iter()
            .filter_map(|(old, data)| renumber.get(&old).map(|&new| (new, data)))
            .collect();
    }

    /// The finest partition that is coarser than both `self` and
    /// `other`. Values tracked by only one side are kept; region state
    /// is merged over every region that flows into a joined region. The
    /// result is canonical.
    pub fn join(&self, other: &Partition) -> Partition {
        let size = self
            .values()
            .chain(other.values())
            .map(|v| v.index() + 1)
            .max()
            .unwrap_or(0);
        let mut uf = UnionFind::new(size);
        for side in [self, other] {
            let mut first: BTreeMap<RegionId, Value> = BTreeMap::new();
            for (&value, &region) in &side.elements {
                uf.insert(value);
                let leader = *first.entry(region).or_insert(value);
                uf.union(leader, value);
            }
        }

        let mut result = Partition::new();
        for side in [self, other] {
            for (&value, _) in &side.elements {
                if result.contains(value) {
                    continue;
                }
                let root = RegionId(uf.find(value).0);
                result.elements.insert(value, root);
                let info = side.info_of(value).copied();
                let entry = result.regions.entry(root);
                let data = entry.or_insert_with(|| RegionData {
                    info: info.unwrap_or(RegionInfo::new(IsolationDomain::Nonisolated)),
                    len: 0,
                });
                data.len += 1;
            }
        }
        for side in [self, other] {
            for (&region, data) in &side.regions {
                let Some(leader) = side.elements_of(region).next() else {
                    continue;
                };
                let root = RegionId(uf.find(leader).0);
                if let Some(joined) = result.regions.get_mut(&root) {
                    joined.info = joined.info.merge(data.info);
                }
            }
        }
        result
    }

    /// The equivalence classes, each sorted, ordered by smallest element.
    pub fn classes(&self) -> Vec<Vec<Value>> {
        let mut by_region: BTreeMap<RegionId, Vec<Value>> = BTreeMap::new();
        for (&value, &region) in &self.elements {
            by_region.entry(region).or_default().push(value);
        }
        let mut classes: Vec<Vec<Value>> = by_region.into_values().collect();
        classes.sort();
        classes
    }

    /// Flatten to a union-find parent array indexed by value: every
    /// element points at the smallest element of its region, and
    /// untracked slots hold `u32::MAX`.
    pub fn to_union_find(&self) -> Vec<u32> {
        let size = self.elements.keys().last().map(|v| v.index() + 1).unwrap_or(0);
        let mut parents = vec![ABSENT; size];
        let mut leaders: BTreeMap<RegionId, Value> = BTreeMap::new();
        for (&value, &region) in &self.elements {
            let leader = *leaders.entry(region).or_insert(value);
            parents[value.index()] = leader.0;
        }
        parents
    }

    /// Rebuild a partition from a parent array, giving every region
    /// `info`. Parent chains of any depth are accepted.
    pub fn from_union_find(parents: &[u32], info: RegionInfo) -> Partition {
        let mut uf = UnionFind {
            parent: parents.to_vec(),
        };
        let mut result = Partition::new();
        for i in 0..parents.len() {
            let value = Value::new(i);
            if !uf.contains(value) {
                continue;
            }
            let root = uf.find(value);
            let region = RegionId(root.0);
            result
                .regions
                .entry(region)
                .or_insert(RegionData { info, len: 0 });
            result.insert(value, region);
        }
        result.canonicalize();
        result
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, (region, data)) in self.regions.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{{")?;
            for (j, value) in self.elements_of(*region).enumerate() {
                if j > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", value)?;
            }
            write!(f, "}}")?;
            match data.info.status {
                RegionStatus::Live => {}
                RegionStatus::Consumed { site } => write!(f, "(consumed@{:?})", site)?,
                RegionStatus::Transferred { site, .. } => {
                    write!(f, "(transferred@{:?})", site.user)?
                }
            }
            if !data.info.transferable {
                write!(f, "(pinned)")?;
            }
        }
        write!(f, "]")
    }
}

/// Union-find over dense value indices. The root of every class is its
/// smallest member.
#[derive(Clone, Debug)]
pub struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    pub fn new(size: usize) -> Self {
        UnionFind {
            parent: vec![ABSENT; size],
        }
    }

    pub fn insert(&mut self, value: Value) {
        if self.parent.len() <= value.index() {
            self.parent.resize(value.index() + 1, ABSENT);
        }
        if self.parent[value.index()] == ABSENT {
            self.parent[value.index()] = value.0;
        }
    }

    pub fn contains(&self, value: Value) -> bool {
        self.parent
            .get(value.index())
            .map_or(false, |&p| p != ABSENT)
    }

    /// Root of `value`'s class, compressing the path on the way.
    pub fn find(&mut self, value: Value) -> Value {
        let mut root = value.0;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = value.0;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        Value(root)
    }

    pub fn union(&mut self, a: Value, b: Value) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra < rb {
            self.parent[rb.index()] = ra.0;
        } else if rb < ra {
            self.parent[ra.index()] = rb.0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::format;

    fn v(i: usize) -> Value {
        Value::new(i)
    }

    fn live() -> RegionInfo {
        RegionInfo::new(IsolationDomain::Task)
    }

    fn partition(classes: &[&[usize]]) -> Partition {
        let mut p = Partition::new();
        for class in classes {
            p.assign_fresh(v(class[0]), live());
            for &other in &class[1..] {
                p.assign_fresh(v(other), live());
                p.merge(v(class[0]), v(other));
            }
        }
        p.canonicalize();
        p
    }

    #[test]
    fn test_union_is_transitive() {
        let mut p = partition(&[&[0], &[1], &[2], &[3]]);
        p.merge(v(0), v(1));
        p.merge(v(1), v(2));
        assert_eq!(p.region_of(v(0)), p.region_of(v(2)));
        assert!(!p.same_region(v(0), v(3)));
        // Idempotent.
        let before = p.clone();
        p.merge(v(2), v(0));
        assert_eq!(p, before);
    }

    #[test]
    fn test_join_coarsens() {
        let a = partition(&[&[0, 1], &[2], &[3]]);
        let b = partition(&[&[0], &[1, 2], &[3]]);
        let joined = a.join(&b);
        assert_eq!(joined.classes(), vec![vec![v(0), v(1), v(2)], vec![v(3)]]);
        for side in [&a, &b] {
            for x in side.values() {
                for y in side.values() {
                    if side.same_region(x, y) {
                        assert!(joined.same_region(x, y));
                    }
                }
            }
        }
        assert_eq!(joined, b.join(&a));
    }

    #[test]
    fn test_join_merges_status() {
        let mut a = partition(&[&[0], &[1]]);
        let b = partition(&[&[0], &[1]]);
        a.info_of_mut(v(1)).unwrap().status = RegionStatus::Consumed { site: Inst::new(7) };
        let joined = a.join(&b);
        assert!(joined.info_of(v(0)).unwrap().status.is_live());
        assert_eq!(
            joined.info_of(v(1)).unwrap().status,
            RegionStatus::Consumed { site: Inst::new(7) }
        );
    }

    #[test]
    fn test_reassign_detaches() {
        let mut p = partition(&[&[0, 1]]);
        p.assign_fresh(v(5), live());
        assert!(p.assign(v(1), v(5)));
        assert!(!p.same_region(v(0), v(1)));
        assert!(p.same_region(v(1), v(5)));
        assert!(!p.assign(v(1), v(9)));
        assert!(p.same_region(v(1), v(5)));
    }

    #[test]
    fn test_remove_last_element_drops_region() {
        let mut p = partition(&[&[0], &[1]]);
        assert_eq!(p.num_regions(), 2);
        p.remove(v(1));
        assert_eq!(p.num_regions(), 1);
        p.retain(|_| false);
        assert!(p.is_empty());
        assert_eq!(p.num_regions(), 0);
    }

    #[test]
    fn test_assign_parallel_swap() {
        let mut p = partition(&[&[0, 2], &[1]]);
        p.assign_parallel(&[(v(0), Some(v(1))), (v(1), Some(v(0)))], live());
        assert!(p.same_region(v(1), v(2)));
        assert!(!p.same_region(v(0), v(2)));
        p.assign_parallel(&[(v(3), None)], live());
        assert!(p.contains(v(3)));
        assert_eq!(p.elements_of(p.region_of(v(3)).unwrap()).count(), 1);
    }

    #[test]
    fn test_assign_parallel_fresh_does_not_reuse_moved_region() {
        let mut p = partition(&[&[0], &[1]]);
        let consumed = RegionStatus::Consumed { site: Inst::new(3) };
        p.info_of_mut(v(1)).unwrap().status = consumed;
        p.assign_parallel(
            &[(v(5), None), (v(1), Some(v(0))), (v(6), Some(v(1)))],
            live(),
        );
        assert_eq!(
            p.classes(),
            vec![vec![v(0), v(1)], vec![v(5)], vec![v(6)]]
        );
        assert!(p.info_of(v(5)).unwrap().status.is_live());
        assert_eq!(p.info_of(v(6)).unwrap().status, consumed);
    }

    #[test]
    fn test_union_find_round_trip() {
        let p = partition(&[&[0, 4, 7], &[2], &[3, 5]]);
        let parents = p.to_union_find();
        assert_eq!(parents, vec![0, ABSENT, 2, 3, 0, 3, ABSENT, 0]);
        let q = Partition::from_union_find(&parents, live());
        assert_eq!(p.classes(), q.classes());
        assert_eq!(q.to_union_find(), parents);
    }

    #[test]
    fn test_display() {
        let mut p = partition(&[&[0, 1], &[3]]);
        p.info_of_mut(v(3)).unwrap().transferable = false;
        assert_eq!(format!("{}", p), "[{%0 %1} {%3}(pinned)]");
    }
}
