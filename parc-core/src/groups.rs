// Segment group management
//
// Groups collect segments that share a minimizer-derived key; the first
// segment of a group is its canonical reference and later members are
// LZ-encoded against it. Placement is serialized per key through the
// sharded map entry; lookups after the write session touch immutable
// state only.

use crate::codec::LzDiff;
use ahash::RandomState;
use dashmap::{DashMap, DashSet};
use parc_common::{Catalog, CodecVariant, Contig, GroupKey, MISSING_MINIMIZER};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Members a group may accumulate before adaptive mode considers a split
pub const FANOUT_CAP: u32 = 32;
/// A segment costing more than len/REGISTER_COST_DIV bytes against every
/// registered reference is considered too different from the group
const REGISTER_COST_DIV: usize = 4;

/// Outcome of placing one segment
#[derive(Debug, Clone)]
pub struct Placement {
    pub group_id: u32,
    pub in_group: u32,
    /// Reference to encode against; None when the segment itself just
    /// became the canonical reference and is stored raw
    pub reference: Option<Arc<Contig>>,
}

impl Placement {
    pub fn is_reference(&self) -> bool {
        self.in_group == 0
    }
}

struct GroupState {
    id: u32,
    reference: Arc<Contig>,
    members: u32,
    /// Estimator with a prepared index, built on first delta placement
    estimator: Option<Box<LzDiff>>,
}

impl GroupState {
    fn new(id: u32, reference: Arc<Contig>) -> Self {
        GroupState {
            id,
            reference,
            members: 1,
            estimator: None,
        }
    }
}

pub struct GroupManager {
    slots: DashMap<(u64, u64), Vec<GroupState>, RandomState>,
    known_minimizers: DashSet<u64, RandomState>,
    next_id: AtomicU32,
    variant: CodecVariant,
    min_match_len: u32,
    adaptive: bool,
}

impl GroupManager {
    pub fn new(variant: CodecVariant, min_match_len: u32, adaptive: bool) -> Self {
        GroupManager {
            slots: DashMap::with_hasher(RandomState::new()),
            known_minimizers: DashSet::with_hasher(RandomState::new()),
            next_id: AtomicU32::new(0),
            variant,
            min_match_len,
            adaptive,
        }
    }

    /// Rebuild manager state from a loaded catalog for appending.
    /// `references` holds each group's canonical segment, indexed by
    /// group id.
    pub fn from_catalog(
        catalog: &Catalog,
        references: Vec<Arc<Contig>>,
        adaptive: bool,
    ) -> Self {
        let manager = Self::new(catalog.params.variant, catalog.params.min_match_len, adaptive);
        manager
            .next_id
            .store(catalog.groups.len() as u32, Ordering::Relaxed);

        for (id, entry) in catalog.groups.iter().enumerate() {
            manager.note_known(entry.key);
            let mut slot = manager.slots.entry(entry.key.pair()).or_default();
            let mut state = GroupState::new(id as u32, references[id].clone());
            state.members = entry.members;
            // Splits were registered in ascending order during creation
            debug_assert_eq!(slot.len(), entry.key.split as usize);
            slot.push(state);
        }
        manager
    }

    fn note_known(&self, key: GroupKey) {
        if key.front != MISSING_MINIMIZER {
            self.known_minimizers.insert(key.front);
        }
        if key.back != MISSING_MINIMIZER {
            self.known_minimizers.insert(key.back);
        }
    }

    /// Whether a minimizer hash already bounds some group; the
    /// segmenter prefers cuts at such minimizers
    pub fn is_known_minimizer(&self, hash: u64) -> bool {
        self.known_minimizers.contains(&hash)
    }

    pub fn no_groups(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Place a segment under its routing key. Serialized per key; the
    /// caller encodes against the returned reference outside the lock.
    pub fn place(&self, key: GroupKey, data: &[u8]) -> Placement {
        let mut slot = self.slots.entry(key.pair()).or_default();

        if slot.is_empty() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            slot.push(GroupState::new(id, Arc::new(data.to_vec())));
            drop(slot);
            self.note_known(key);
            return Placement {
                group_id: id,
                in_group: 0,
                reference: None,
            };
        }

        // Estimate against every registered reference under this key
        // and take the cheapest
        let threshold = (data.len() / REGISTER_COST_DIV) as u32;
        let mut best_ix = 0;
        let mut best_cost = u32::MAX;
        for (ix, state) in slot.iter_mut().enumerate() {
            let estimator = state.estimator.get_or_insert_with(|| {
                let mut lz = Box::new(LzDiff::new(self.variant, self.min_match_len));
                lz.set_reference(&state.reference);
                lz
            });
            let cost = estimator.estimate(data, threshold);
            if cost < best_cost {
                best_cost = cost;
                best_ix = ix;
            }
        }

        let too_different = best_cost > threshold;
        let full = slot[best_ix].members >= FANOUT_CAP;
        if too_different && full && self.adaptive {
            // Register the segment as canonical of a fresh sub-group
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            slot.push(GroupState::new(id, Arc::new(data.to_vec())));
            return Placement {
                group_id: id,
                in_group: 0,
                reference: None,
            };
        }

        let state = &mut slot[best_ix];
        let in_group = state.members;
        state.members += 1;
        Placement {
            group_id: state.id,
            in_group,
            reference: Some(state.reference.clone()),
        }
    }

    /// Snapshot of all groups as catalog entries ordered by id, with
    /// pack starts left for the packer to fill in
    pub fn export_keys(&self) -> Vec<(u32, GroupKey, u32)> {
        let mut entries: Vec<(u32, GroupKey, u32)> = Vec::new();
        for slot in self.slots.iter() {
            let (front, back) = *slot.key();
            for (split, state) in slot.value().iter().enumerate() {
                entries.push((
                    state.id,
                    GroupKey::new(front, back).with_split(split as u32),
                    state.members,
                ));
            }
        }
        entries.sort_unstable_by_key(|&(id, _, _)| id);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_seq(len: usize, state: &mut u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                ((*state >> 33) & 3) as u8
            })
            .collect()
    }

    #[test]
    fn first_segment_becomes_reference() {
        let manager = GroupManager::new(CodecVariant::V2, 18, false);
        let mut state = 5u64;
        let data = random_seq(100, &mut state);
        let p = manager.place(GroupKey::new(1, 2), &data);
        assert_eq!(p.group_id, 0);
        assert_eq!(p.in_group, 0);
        assert!(p.is_reference());
        assert!(p.reference.is_none());
    }

    #[test]
    fn similar_segments_share_a_group() {
        let manager = GroupManager::new(CodecVariant::V2, 18, false);
        let mut state = 6u64;
        let data = random_seq(500, &mut state);
        let mut variant = data.clone();
        variant[250] = (variant[250] + 1) & 3;

        let p0 = manager.place(GroupKey::new(1, 2), &data);
        let p1 = manager.place(GroupKey::new(1, 2), &variant);
        assert_eq!(p0.group_id, p1.group_id);
        assert_eq!(p1.in_group, 1);
        assert_eq!(p1.reference.as_deref(), Some(&data));
    }

    #[test]
    fn distinct_keys_get_distinct_groups() {
        let manager = GroupManager::new(CodecVariant::V2, 18, false);
        let mut state = 7u64;
        let a = manager.place(GroupKey::new(1, 2), &random_seq(50, &mut state));
        let b = manager.place(GroupKey::new(3, 4), &random_seq(50, &mut state));
        assert_ne!(a.group_id, b.group_id);
    }

    #[test]
    fn key_canonicalization_collides_swapped_pairs() {
        let manager = GroupManager::new(CodecVariant::V2, 18, false);
        let mut state = 8u64;
        let data = random_seq(100, &mut state);
        let a = manager.place(GroupKey::new(1, 2), &data);
        let b = manager.place(GroupKey::new(2, 1), &data);
        assert_eq!(a.group_id, b.group_id);
    }

    #[test]
    fn known_minimizers_track_registered_keys() {
        let manager = GroupManager::new(CodecVariant::V2, 18, false);
        let mut state = 9u64;
        assert!(!manager.is_known_minimizer(42));
        manager.place(
            GroupKey::new(42, MISSING_MINIMIZER),
            &random_seq(50, &mut state),
        );
        assert!(manager.is_known_minimizer(42));
        assert!(!manager.is_known_minimizer(MISSING_MINIMIZER));
    }

    #[test]
    fn non_adaptive_never_splits() {
        let manager = GroupManager::new(CodecVariant::V2, 18, false);
        let mut state = 10u64;
        let key = GroupKey::new(1, 2);
        let first = manager.place(key, &random_seq(400, &mut state));
        // Far more unrelated members than the cap
        for _ in 0..(FANOUT_CAP + 8) {
            let p = manager.place(key, &random_seq(400, &mut state));
            assert_eq!(p.group_id, first.group_id);
        }
        assert_eq!(manager.no_groups(), 1);
    }

    #[test]
    fn adaptive_splits_once_full_and_dissimilar() {
        let manager = GroupManager::new(CodecVariant::V2, 18, true);
        let mut state = 11u64;
        let key = GroupKey::new(1, 2);
        manager.place(key, &random_seq(400, &mut state));
        let mut split_seen = false;
        for _ in 0..(2 * FANOUT_CAP) {
            let p = manager.place(key, &random_seq(400, &mut state));
            if p.in_group == 0 {
                split_seen = true;
            }
        }
        assert!(split_seen, "unrelated members past the cap must split");
        assert!(manager.no_groups() > 1);

        let keys = manager.export_keys();
        assert!(keys.iter().any(|&(_, k, _)| k.split > 0));
    }

    #[test]
    fn adaptive_keeps_similar_members_together() {
        let manager = GroupManager::new(CodecVariant::V2, 18, true);
        let mut state = 12u64;
        let key = GroupKey::new(1, 2);
        let base = random_seq(400, &mut state);
        manager.place(key, &base);
        for i in 0..(2 * FANOUT_CAP) {
            let mut member = base.clone();
            member[i as usize] = (member[i as usize] + 1) & 3;
            let p = manager.place(key, &member);
            assert_eq!(p.group_id, 0, "similar member must not split");
        }
    }

    #[test]
    fn export_is_ordered_and_complete() {
        let manager = GroupManager::new(CodecVariant::V2, 18, false);
        let mut state = 13u64;
        for i in 0..10u64 {
            manager.place(GroupKey::new(i, i + 100), &random_seq(60, &mut state));
        }
        let keys = manager.export_keys();
        assert_eq!(keys.len(), 10);
        for (expect, &(id, _, members)) in keys.iter().enumerate().map(|(i, e)| (i as u32, e)) {
            assert_eq!(id, expect);
            assert_eq!(members, 1);
        }
    }
}
