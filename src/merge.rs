//! Set-union-by-key merging of groups.
//!
//! Both aggregation levels merge the same way: a group's members are
//! a set keyed by the member's natural key, and incorporating a new
//! batch overlays the batch onto the existing set. On a key collision
//! the incoming member replaces the existing one, regardless of
//! either member's timestamp.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{tracked_err, ErrorKind, Result};
use crate::level::Level;
use crate::model::{truncated_avg, Summary, Timestamp};

/// Map union with right bias.
///
/// Builds a mapping from key to item for `existing`, then overlays
/// every item of `incoming` onto it. Duplicate keys within either
/// side collapse to the last item seen.
pub fn overlay_by_key<T, K, F>(
    existing: impl IntoIterator<Item = T>,
    incoming: impl IntoIterator<Item = T>,
    key: F,
) -> BTreeMap<K, T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut merged: BTreeMap<K, T> = existing.into_iter().map(|t| (key(&t), t)).collect();
    let incoming: BTreeMap<K, T> = incoming.into_iter().map(|t| (key(&t), t)).collect();
    merged.extend(incoming);
    merged
}

/// Members of a group, at most one per natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberSet<L: Level>(BTreeMap<String, L::Member>);

impl<L: Level> Default for MemberSet<L> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<L: Level> MemberSet<L> {
    pub fn from_members(members: impl IntoIterator<Item = L::Member>) -> Self {
        Self(overlay_by_key(Vec::new(), members, L::member_key))
    }

    /// Overlay `incoming` onto this set; incoming wins collisions.
    pub fn overlay(&mut self, incoming: MemberSet<L>) {
        let existing = std::mem::take(&mut self.0);
        self.0 = overlay_by_key(existing.into_values(), incoming.0.into_values(), L::member_key);
    }

    pub fn insert(&mut self, member: L::Member) {
        self.0.insert(L::member_key(&member), member);
    }

    pub fn get(&self, member_key: &str) -> Option<&L::Member> {
        self.0.get(member_key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Members in natural key order.
    pub fn iter(&self) -> btree_map::Values<'_, String, L::Member> {
        self.0.values()
    }

    /// Total `(area_count, pop_sum)` contributed by all members.
    pub fn tally(&self) -> Option<(u64, u64)> {
        self.0.values().try_fold((0u64, 0u64), |(areas, pop), member| {
            let (member_areas, member_pop) = L::tally(member);
            Some((areas.checked_add(member_areas)?, pop.checked_add(member_pop)?))
        })
    }
}

impl<L: Level> IntoIterator for MemberSet<L> {
    type Item = L::Member;

    type IntoIter = btree_map::IntoValues<String, L::Member>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

/// A mergeable, deduplicated collection of members sharing a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Group<L: Level> {
    pub key: L::Key,
    pub members: MemberSet<L>,
    /// Time of the last merge that touched this group.
    pub last_modified: Timestamp,
}

impl<L: Level> Group<L> {
    pub fn new(key: L::Key, last_modified: Timestamp) -> Self {
        Self {
            key,
            members: MemberSet::default(),
            last_modified,
        }
    }

    /// Merge a transient group for the same key into this one.
    ///
    /// Returns `false` and leaves this group untouched if `incoming`
    /// has no members.
    pub fn absorb(&mut self, incoming: Group<L>) -> Result<bool> {
        if incoming.key != self.key {
            return Err(tracked_err(
                ErrorKind::Consistency,
                &format!(
                    "can't merge {} group {:?} into group {:?}",
                    L::NAME,
                    incoming.key,
                    self.key
                ),
            ));
        }
        if incoming.members.is_empty() {
            return Ok(false);
        }
        self.members.overlay(incoming.members);
        self.last_modified = incoming.last_modified;
        Ok(true)
    }

    /// Recompute the summary of this group.
    pub fn summarize(&self) -> Result<Summary<L::Key>> {
        let (area_count, pop_sum) = self.members.tally().ok_or_else(|| {
            tracked_err(
                ErrorKind::Consistency,
                &format!("population of {} group {:?} overflows", L::NAME, self.key),
            )
        })?;
        let avg_pop = truncated_avg(pop_sum, area_count).ok_or_else(|| {
            tracked_err(
                ErrorKind::Consistency,
                &format!("{} group {:?} has no areas", L::NAME, self.key),
            )
        })?;
        Ok(Summary {
            key: self.key.clone(),
            area_count,
            pop_sum,
            avg_pop,
            last_modified: self.last_modified,
        })
    }
}

/// `key @ last_modified: [member keys]`
impl<L: Level> fmt::Display for Group<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let member_keys: Vec<String> = self.members.iter().map(L::member_key).collect();
        write!(
            f,
            "{} @ {}: [{}]",
            self.key,
            self.last_modified,
            member_keys.join(", ")
        )
    }
}

/// Group members by their group key into transient groups stamped
/// with `now`.
///
/// Members are deduplicated by natural key within each group, later
/// members winning.
pub fn group_by_key<L: Level>(
    members: impl IntoIterator<Item = L::Member>,
    now: Timestamp,
) -> BTreeMap<L::Key, Group<L>> {
    let mut groups: BTreeMap<L::Key, Group<L>> = BTreeMap::new();
    for member in members {
        let key = L::group_key(&member);
        groups
            .entry(key)
            .or_insert_with_key(|key| Group::new(key.clone(), now))
            .members
            .insert(member);
    }
    groups
}

#[test]
fn overlay_prefers_incoming() {
    let existing = vec![("x", 100), ("y", 1)];
    let incoming = vec![("x", 200), ("z", 3)];

    let found = overlay_by_key(existing, incoming, |(k, _)| *k);
    let expected = BTreeMap::from([("x", ("x", 200)), ("y", ("y", 1)), ("z", ("z", 3))]);
    assert_eq!(found, expected);
}

#[test]
fn overlay_collapses_duplicates_within_batch() {
    let found = overlay_by_key(Vec::new(), vec![("x", 1), ("x", 2)], |(k, _)| *k);
    let expected = BTreeMap::from([("x", ("x", 2))]);
    assert_eq!(found, expected);
}

#[cfg(test)]
fn area(zip: &str, city: &str, state: &str, pop: u64) -> crate::model::AreaRecord {
    crate::model::AreaRecord {
        zip: zip.into(),
        city: city.into(),
        state: state.into(),
        pop,
        last_modified: Timestamp(1),
    }
}

#[test]
fn absorb_overlays_same_natural_key() {
    use crate::level::CityLevel;
    use crate::model::CityKey;

    let key = CityKey::new("Springfield", "MA");
    let mut existing = Group::<CityLevel>::new(key.clone(), Timestamp(10));
    existing.members.insert(area("X", "Springfield", "MA", 100));

    let mut incoming = Group::<CityLevel>::new(key, Timestamp(20));
    incoming.members.insert(area("X", "Springfield", "MA", 200));

    assert!(existing.absorb(incoming).unwrap());
    assert_eq!(existing.members.len(), 1);
    assert_eq!(existing.members.get("X").map(|a| a.pop), Some(200));
    assert_eq!(existing.last_modified, Timestamp(20));
}

#[test]
fn absorb_empty_is_noop() {
    use crate::level::CityLevel;
    use crate::model::CityKey;

    let key = CityKey::new("Springfield", "MA");
    let mut existing = Group::<CityLevel>::new(key.clone(), Timestamp(10));
    existing.members.insert(area("X", "Springfield", "MA", 100));
    let before = existing.clone();

    let changed = existing
        .absorb(Group::<CityLevel>::new(key, Timestamp(20)))
        .unwrap();
    assert!(!changed);
    assert_eq!(existing, before);
}

#[test]
fn absorb_rejects_other_key() {
    use crate::level::CityLevel;
    use crate::model::CityKey;

    let mut existing = Group::<CityLevel>::new(CityKey::new("Springfield", "MA"), Timestamp(10));
    let mut incoming = Group::<CityLevel>::new(CityKey::new("Springfield", "IL"), Timestamp(20));
    incoming.members.insert(area("62701", "Springfield", "IL", 5));

    let err = existing.absorb(incoming).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
}

#[test]
fn summarize_truncates_average() {
    use crate::level::CityLevel;
    use crate::model::CityKey;

    let mut group = Group::<CityLevel>::new(CityKey::new("Springfield", "MA"), Timestamp(10));
    group.members.insert(area("1", "Springfield", "MA", 50));
    group.members.insert(area("2", "Springfield", "MA", 25));
    group.members.insert(area("3", "Springfield", "MA", 25));

    let summary = group.summarize().unwrap();
    assert_eq!(summary.area_count, 3);
    assert_eq!(summary.pop_sum, 100);
    assert_eq!(summary.avg_pop, 33);
    assert_eq!(summary.last_modified, Timestamp(10));
}

#[test]
fn summarize_empty_group_is_consistency_error() {
    use crate::level::CityLevel;
    use crate::model::CityKey;

    let group = Group::<CityLevel>::new(CityKey::new("Springfield", "MA"), Timestamp(10));
    let err = group.summarize().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
}

#[test]
fn group_by_key_dedups_within_batch() {
    use crate::level::CityLevel;
    use crate::model::CityKey;

    let groups = group_by_key::<CityLevel>(
        vec![
            area("1", "Springfield", "MA", 50),
            area("1", "Springfield", "MA", 60),
            area("2", "Boston", "MA", 70),
        ],
        Timestamp(5),
    );
    assert_eq!(groups.len(), 2);
    let springfield = &groups[&CityKey::new("Springfield", "MA")];
    assert_eq!(springfield.members.len(), 1);
    assert_eq!(springfield.members.get("1").map(|a| a.pop), Some(60));
    assert_eq!(springfield.last_modified, Timestamp(5));
}

#[test]
fn group_display_lists_member_keys() {
    use crate::level::StateLevel;
    use crate::model::{CityKey, StateKey};

    let mut group = Group::<StateLevel>::new(StateKey("MA".into()), Timestamp(0));
    for (city, pop_sum) in [("Amherst", 35000), ("Agawam", 15338)] {
        group.members.insert(Summary {
            key: CityKey::new(city, "MA"),
            area_count: 1,
            pop_sum,
            avg_pop: pop_sum,
            last_modified: Timestamp(0),
        });
    }
    assert_eq!(
        group.to_string(),
        "MA @ 1970-01-01T00:00:00.000000Z: [Agawam, Amherst]"
    );
}
