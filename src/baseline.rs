//! Non-incremental recomputation of both levels, and the cross-check
//! against the incremental view.
//!
//! The baseline never merges: it groups every area from scratch and
//! overwrites the full view. Its output is what the incremental view
//! must equal for the same set of areas.

use std::collections::{BTreeMap, BTreeSet};

use opentelemetry::KeyValue;
use tracing::instrument;

use crate::clock::Clock;
use crate::errors::Result;
use crate::level::{CityLevel, Level, StateLevel};
use crate::merge::group_by_key;
use crate::metrics::{summary_labels, CycleMetrics};
use crate::model::{AreaRecord, CityKey, StateKey, Summary, Timestamp, ViewKind};
use crate::store::{in_unit_of_work, AreaFilter, Store};
use crate::tagger;
use crate::watermark::Watermark;
use crate::with_timer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub now: Timestamp,
    pub areas_tagged: usize,
    pub city_summaries: usize,
    pub state_summaries: usize,
}

/// Group, count, sum and average `members` from scratch.
fn recompute<L: Level>(
    members: impl IntoIterator<Item = L::Member>,
    now: Timestamp,
) -> Result<Vec<Summary<L::Key>>> {
    group_by_key::<L>(members, now)
        .values()
        .map(|group| group.summarize())
        .collect()
}

/// Recompute the full view of both levels from every raw area.
///
/// Untagged areas are tagged first, with a time after the current
/// watermark so the next incremental refresh still picks them up.
#[instrument(name = "rebuild", skip_all)]
pub fn rebuild<S: Store, C: Clock>(store: &mut S, clock: &C) -> Result<RebuildReport> {
    let metrics = CycleMetrics::new();
    let labels = [KeyValue::new("view", ViewKind::Full.as_str())];

    let report = with_timer!(
        metrics.refresh_duration,
        labels,
        in_unit_of_work(store, |store| rebuild_all(store, clock))
    )?;

    let view = ViewKind::Full.as_str();
    metrics.areas_tagged.add(report.areas_tagged as u64, &[]);
    metrics.summaries_written.add(
        report.city_summaries as u64,
        &summary_labels(CityLevel::NAME, view),
    );
    metrics.summaries_written.add(
        report.state_summaries as u64,
        &summary_labels(StateLevel::NAME, view),
    );
    tracing::info!("Rebuilt full view at {}", report.now);
    Ok(report)
}

fn rebuild_all<S: Store, C: Clock>(store: &mut S, clock: &C) -> Result<RebuildReport> {
    let now = Watermark::get(store)?.next_cycle_time(clock.now());
    let areas_tagged = tagger::tag(store, now)?;

    let areas = store
        .find_areas(AreaFilter::All)?
        .into_iter()
        .map(AreaRecord::try_from)
        .collect::<Result<Vec<_>>>()?;
    let cities = recompute::<CityLevel>(areas, now)?;
    store.replace_summaries::<CityLevel>(ViewKind::Full, &cities)?;

    // Read back through the store, the same way the state level reads
    // the incremental view.
    let cities = store.find_summaries::<CityLevel>(ViewKind::Full, None)?;
    let city_summaries = cities.len();
    let states = recompute::<StateLevel>(cities, now)?;
    store.replace_summaries::<StateLevel>(ViewKind::Full, &states)?;

    Ok(RebuildReport {
        now,
        areas_tagged,
        city_summaries,
        state_summaries: states.len(),
    })
}

/// `(area_count, pop_sum, avg_pop)` of one summary.
pub type Figures = (u64, u64, u64);

/// A key whose summary differs between the two views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch<K> {
    pub key: K,
    pub incremental: Option<Figures>,
    pub full: Option<Figures>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub city: Vec<Mismatch<CityKey>>,
    pub state: Vec<Mismatch<StateKey>>,
}

impl Verification {
    pub fn is_consistent(&self) -> bool {
        self.city.is_empty() && self.state.is_empty()
    }
}

fn figures_by_key<L: Level, S: Store>(
    store: &S,
    view: ViewKind,
) -> Result<BTreeMap<L::Key, Figures>> {
    Ok(store
        .find_summaries::<L>(view, None)?
        .into_iter()
        .map(|s| (s.key, (s.area_count, s.pop_sum, s.avg_pop)))
        .collect())
}

fn compare<L: Level, S: Store>(store: &S) -> Result<Vec<Mismatch<L::Key>>> {
    let incremental = figures_by_key::<L, S>(store, ViewKind::Incremental)?;
    let full = figures_by_key::<L, S>(store, ViewKind::Full)?;

    let keys: BTreeSet<&L::Key> = incremental.keys().chain(full.keys()).collect();
    Ok(keys
        .into_iter()
        .filter_map(|key| {
            let inc = incremental.get(key).copied();
            let ful = full.get(key).copied();
            (inc != ful).then(|| Mismatch {
                key: key.clone(),
                incremental: inc,
                full: ful,
            })
        })
        .collect())
}

/// Compare the incremental and full views of both levels as sets of
/// `(key, count, sum, average)`.
pub fn verify<S: Store>(store: &S) -> Result<Verification> {
    let verification = Verification {
        city: compare::<CityLevel, S>(store)?,
        state: compare::<StateLevel, S>(store)?,
    };
    if !verification.is_consistent() {
        tracing::warn!(
            "Views disagree on {} cities and {} states",
            verification.city.len(),
            verification.state.len()
        );
    }
    Ok(verification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestingClock;
    use crate::model::RawArea;
    use crate::refresh::refresh;
    use crate::store::in_mem::InMemStore;

    fn sample() -> Vec<RawArea> {
        vec![
            RawArea::new("01001", "Agawam", "MA", 15338),
            RawArea::new("01002", "Amherst", "MA", 35000),
            RawArea::new("90210", "Beverly Hills", "CA", 21000),
        ]
    }

    #[test]
    fn rebuild_writes_full_view() {
        let mut store = InMemStore::new();
        store.insert_areas(sample()).unwrap();
        let clock = TestingClock::new(Timestamp(100));

        let report = rebuild(&mut store, &clock).unwrap();
        assert_eq!(report.areas_tagged, 3);
        assert_eq!(report.city_summaries, 3);
        assert_eq!(report.state_summaries, 2);

        let found: Vec<_> = store
            .find_summaries::<StateLevel>(ViewKind::Full, None)
            .unwrap()
            .iter()
            .map(|s| s.figures())
            .collect();
        let expected = vec![
            (StateKey("CA".into()), 1, 21000, 21000),
            (StateKey("MA".into()), 2, 50338, 25169),
        ];
        assert_eq!(found, expected);
        assert!(store
            .find_summaries::<StateLevel>(ViewKind::Incremental, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn verify_reports_stale_incremental_view() {
        let mut store = InMemStore::new();
        store.insert_areas(sample()).unwrap();
        let clock = TestingClock::new(Timestamp(100));
        refresh(&mut store, &clock).unwrap();
        rebuild(&mut store, &clock).unwrap();
        assert!(verify(&store).unwrap().is_consistent());

        store
            .insert_areas(vec![RawArea::new("01003", "Amherst", "MA", 1000)])
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        rebuild(&mut store, &clock).unwrap();

        let verification = verify(&store).unwrap();
        assert_eq!(
            verification.city,
            vec![Mismatch {
                key: CityKey::new("Amherst", "MA"),
                incremental: Some((1, 35000, 35000)),
                full: Some((2, 36000, 18000)),
            }]
        );
        assert_eq!(verification.state.len(), 1);

        clock.advance(chrono::Duration::seconds(1));
        refresh(&mut store, &clock).unwrap();
        assert!(verify(&store).unwrap().is_consistent());
    }
}
