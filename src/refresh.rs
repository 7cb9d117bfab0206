//! One refresh cycle: tag, aggregate cities, aggregate states, then
//! advance the watermark.
//!
//! The whole cycle is one unit of work in the store. If any step
//! fails nothing it wrote is kept and the watermark stays put, so the
//! next cycle re-reads the same window.

use opentelemetry::KeyValue;
use tracing::instrument;

use crate::aggregate::{CityAggregator, IncorporateStats, StateAggregator};
use crate::clock::Clock;
use crate::errors::Result;
use crate::level::{CityLevel, Level, StateLevel};
use crate::metrics::{level_labels, summary_labels, CycleMetrics};
use crate::model::{Timestamp, ViewKind};
use crate::store::{in_unit_of_work, Store};
use crate::tagger;
use crate::watermark::Watermark;
use crate::with_timer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    /// Watermark the cycle started from.
    pub previous: Watermark,
    /// Time every write of the cycle was stamped with; the new
    /// watermark.
    pub now: Timestamp,
    pub areas_tagged: usize,
    pub city: IncorporateStats,
    pub state: IncorporateStats,
    pub city_summaries: usize,
    pub state_summaries: usize,
}

/// Run one refresh cycle against `store`.
///
/// Running it again with no new areas rewrites the same summaries.
#[instrument(name = "refresh", skip_all)]
pub fn refresh<S: Store, C: Clock>(store: &mut S, clock: &C) -> Result<RefreshReport> {
    let metrics = CycleMetrics::new();
    let labels = [KeyValue::new("view", ViewKind::Incremental.as_str())];

    let report = with_timer!(
        metrics.refresh_duration,
        labels,
        in_unit_of_work(store, |store| run_cycle(store, clock))
    )?;

    record(&metrics, &report);
    tracing::info!(
        "Refreshed {} -> {}: tagged {} areas, {} city and {} state summaries",
        report.previous,
        report.now,
        report.areas_tagged,
        report.city_summaries,
        report.state_summaries
    );
    Ok(report)
}

fn run_cycle<S: Store, C: Clock>(store: &mut S, clock: &C) -> Result<RefreshReport> {
    // Read the watermark first so "now" can be kept after it.
    let previous = Watermark::get(store)?;
    let now = previous.next_cycle_time(clock.now());

    let areas_tagged = tagger::tag(store, now)?;

    let city = CityAggregator::incorporate(store, previous, now)?;
    let city_summaries = CityAggregator::summarize(store)?;

    let state = StateAggregator::incorporate(store, previous, now)?;
    let state_summaries = StateAggregator::summarize(store)?;

    Watermark::advance(store, now)?;

    Ok(RefreshReport {
        previous,
        now,
        areas_tagged,
        city,
        state,
        city_summaries,
        state_summaries,
    })
}

fn record(metrics: &CycleMetrics, report: &RefreshReport) {
    metrics.areas_tagged.add(report.areas_tagged as u64, &[]);
    metrics
        .areas_incorporated
        .add(report.city.selected as u64, &[]);
    metrics.groups_merged.add(
        report.city.groups_merged as u64,
        &level_labels(CityLevel::NAME),
    );
    metrics.groups_merged.add(
        report.state.groups_merged as u64,
        &level_labels(StateLevel::NAME),
    );
    let view = ViewKind::Incremental.as_str();
    metrics.summaries_written.add(
        report.city_summaries as u64,
        &summary_labels(CityLevel::NAME, view),
    );
    metrics.summaries_written.add(
        report.state_summaries as u64,
        &summary_labels(StateLevel::NAME, view),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestingClock;
    use crate::model::RawArea;
    use crate::store::in_mem::InMemStore;
    use crate::store::AreaFilter;

    #[test]
    fn first_cycle_advances_watermark() {
        let mut store = InMemStore::new();
        store
            .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338)])
            .unwrap();
        let clock = TestingClock::new(Timestamp(100));

        let report = refresh(&mut store, &clock).unwrap();
        assert_eq!(report.previous, Watermark::Unset);
        assert_eq!(report.now, Timestamp(100));
        assert_eq!(report.areas_tagged, 1);
        assert_eq!(report.city_summaries, 1);
        assert_eq!(report.state_summaries, 1);
        assert!(!store.in_transaction());
        assert_eq!(
            Watermark::get(&store).unwrap(),
            Watermark::At(Timestamp(100))
        );
    }

    #[test]
    fn stalled_clock_still_moves_watermark() {
        let mut store = InMemStore::new();
        let clock = TestingClock::new(Timestamp(100));
        refresh(&mut store, &clock).unwrap();

        store
            .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338)])
            .unwrap();
        let report = refresh(&mut store, &clock).unwrap();
        assert_eq!(report.now, Timestamp(101));
        assert_eq!(report.city.selected, 1);

        let tagged = store
            .find_areas(AreaFilter::ModifiedAfter(Timestamp(100)))
            .unwrap();
        assert_eq!(tagged.len(), 1);
    }

    #[test]
    fn failed_cycle_keeps_nothing() {
        let mut store = InMemStore::new();
        let mut bad = RawArea::new("01002", "Amherst", "MA", 0);
        bad.city = None;
        store
            .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338), bad])
            .unwrap();
        let clock = TestingClock::new(Timestamp(100));

        assert!(refresh(&mut store, &clock).is_err());
        assert!(!store.in_transaction());
        assert_eq!(Watermark::get(&store).unwrap(), Watermark::Unset);
        assert_eq!(store.find_areas(AreaFilter::Untagged).unwrap().len(), 2);
    }
}
