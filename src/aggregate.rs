//! Incremental aggregation, once per [`Level`].
//!
//! Each level runs in two steps. `incorporate` merges members that
//! are new since the watermark into the persistent groups. Then
//! `summarize` recomputes every group's summary and overwrites the
//! level's incremental view.
//!
//! The state level reads the city level's incremental view, so city
//! `summarize` must run before state `incorporate` within a cycle.

use std::marker::PhantomData;

use tracing::instrument;

use crate::errors::Result;
use crate::level::{CityLevel, Level, StateLevel};
use crate::merge::{group_by_key, Group};
use crate::model::{Timestamp, ViewKind};
use crate::store::Store;
use crate::watermark::Watermark;

/// What one `incorporate` call did.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IncorporateStats {
    /// New members read from the level below.
    pub selected: usize,
    /// Groups seen for the first time.
    pub groups_created: usize,
    /// Existing groups new members were merged into.
    pub groups_merged: usize,
}

pub struct Aggregator<L: Level>(PhantomData<L>);

pub type CityAggregator = Aggregator<CityLevel>;
pub type StateAggregator = Aggregator<StateLevel>;

impl<L: Level> Aggregator<L> {
    /// Merge every member modified after `watermark` into its group.
    ///
    /// Every group written is stamped with `now`.
    #[instrument(name = "incorporate", skip(store), fields(level = L::NAME))]
    pub fn incorporate<S: Store>(
        store: &mut S,
        watermark: Watermark,
        now: Timestamp,
    ) -> Result<IncorporateStats> {
        let selected = L::select_new(store, watermark)?;
        let mut stats = IncorporateStats {
            selected: selected.len(),
            ..Default::default()
        };

        for (key, incoming) in group_by_key::<L>(selected, now) {
            match store.load_group::<L>(&key)? {
                None => {
                    tracing::trace!("New {} group {key:?}", L::NAME);
                    store.upsert_group(&incoming)?;
                    stats.groups_created += 1;
                }
                Some(mut existing) => {
                    if existing.absorb(incoming)? {
                        store.upsert_group(&existing)?;
                        stats.groups_merged += 1;
                    }
                }
            }
        }

        tracing::debug!("Incorporated {stats:?}");
        Ok(stats)
    }

    /// Recompute and overwrite the incremental summary of every group.
    /// Returns how many summaries were written.
    #[instrument(name = "summarize", skip(store), fields(level = L::NAME))]
    pub fn summarize<S: Store>(store: &mut S) -> Result<usize> {
        let summaries = store
            .find_groups::<L>()?
            .iter()
            .map(Group::summarize)
            .collect::<Result<Vec<_>>>()?;
        store.replace_summaries::<L>(ViewKind::Incremental, &summaries)?;
        Ok(summaries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CityKey, RawArea, StateKey};
    use crate::store::in_mem::InMemStore;
    use crate::tagger;

    fn load(store: &mut InMemStore, areas: Vec<RawArea>, now: Timestamp) {
        store.insert_areas(areas).unwrap();
        tagger::tag(store, now).unwrap();
    }

    #[test]
    fn city_incorporate_creates_then_merges() {
        let mut store = InMemStore::new();
        load(
            &mut store,
            vec![
                RawArea::new("01001", "Agawam", "MA", 15338),
                RawArea::new("01002", "Amherst", "MA", 35000),
            ],
            Timestamp(10),
        );

        let stats = CityAggregator::incorporate(&mut store, Watermark::Unset, Timestamp(10)).unwrap();
        assert_eq!(
            stats,
            IncorporateStats {
                selected: 2,
                groups_created: 2,
                groups_merged: 0,
            }
        );

        load(
            &mut store,
            vec![RawArea::new("01003", "Amherst", "MA", 1000)],
            Timestamp(20),
        );
        let stats =
            CityAggregator::incorporate(&mut store, Watermark::At(Timestamp(10)), Timestamp(20))
                .unwrap();
        assert_eq!(
            stats,
            IncorporateStats {
                selected: 1,
                groups_created: 0,
                groups_merged: 1,
            }
        );

        let amherst = store
            .load_group::<CityLevel>(&CityKey::new("Amherst", "MA"))
            .unwrap()
            .unwrap();
        assert_eq!(amherst.members.len(), 2);
        assert_eq!(amherst.last_modified, Timestamp(20));
        let agawam = store
            .load_group::<CityLevel>(&CityKey::new("Agawam", "MA"))
            .unwrap()
            .unwrap();
        assert_eq!(agawam.last_modified, Timestamp(10));
    }

    #[test]
    fn reincorporating_same_window_is_idempotent() {
        let mut store = InMemStore::new();
        load(
            &mut store,
            vec![RawArea::new("01001", "Agawam", "MA", 15338)],
            Timestamp(10),
        );

        CityAggregator::incorporate(&mut store, Watermark::Unset, Timestamp(10)).unwrap();
        CityAggregator::incorporate(&mut store, Watermark::Unset, Timestamp(10)).unwrap();

        let groups = store.find_groups::<CityLevel>().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 1);
    }

    #[test]
    fn later_document_wins_within_batch() {
        let mut store = InMemStore::new();
        load(
            &mut store,
            vec![
                RawArea::new("01001", "Agawam", "MA", 100),
                RawArea::new("01001", "Agawam", "MA", 200),
            ],
            Timestamp(10),
        );

        CityAggregator::incorporate(&mut store, Watermark::Unset, Timestamp(10)).unwrap();
        assert_eq!(CityAggregator::summarize(&mut store).unwrap(), 1);

        let found = store
            .find_summaries::<CityLevel>(ViewKind::Incremental, None)
            .unwrap();
        assert_eq!(found[0].pop_sum, 200);
        assert_eq!(found[0].area_count, 1);
    }

    #[test]
    fn state_reads_city_summaries() {
        let mut store = InMemStore::new();
        load(
            &mut store,
            vec![
                RawArea::new("01001", "Agawam", "MA", 15338),
                RawArea::new("01002", "Amherst", "MA", 35000),
                RawArea::new("90210", "Beverly Hills", "CA", 21000),
            ],
            Timestamp(10),
        );

        CityAggregator::incorporate(&mut store, Watermark::Unset, Timestamp(10)).unwrap();
        CityAggregator::summarize(&mut store).unwrap();
        let stats =
            StateAggregator::incorporate(&mut store, Watermark::Unset, Timestamp(10)).unwrap();
        assert_eq!(stats.selected, 3);
        assert_eq!(stats.groups_created, 2);
        StateAggregator::summarize(&mut store).unwrap();

        let found: Vec<_> = store
            .find_summaries::<StateLevel>(ViewKind::Incremental, None)
            .unwrap()
            .iter()
            .map(|s| s.figures())
            .collect();
        let expected = vec![
            (StateKey("CA".into()), 1, 21000, 21000),
            (StateKey("MA".into()), 2, 50338, 25169),
        ];
        assert_eq!(found, expected);
    }
}
