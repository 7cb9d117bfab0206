//! Refresh cycle properties, checked against both store
//! implementations.

use chrono::Duration;
use zipagg::baseline::{rebuild, verify};
use zipagg::clock::{Clock, TestingClock};
use zipagg::errors::{tracked_err, ErrorKind, Result};
use zipagg::level::{CityLevel, Level, StateLevel};
use zipagg::merge::Group;
use zipagg::model::{CityKey, RawArea, StateKey, StoredArea, Summary, Timestamp, ViewKind};
use zipagg::refresh;
use zipagg::store::in_mem::InMemStore;
use zipagg::store::sqlite::SqliteStore;
use zipagg::store::{AreaFilter, Store};
use zipagg::watermark::Watermark;

type Figures<K> = Vec<(K, u64, u64, u64)>;

fn figures<L: Level, S: Store>(store: &S, view: ViewKind) -> Figures<L::Key> {
    store
        .find_summaries::<L>(view, None)
        .unwrap()
        .iter()
        .map(Summary::figures)
        .collect()
}

fn clock() -> TestingClock {
    TestingClock::new(Timestamp(1_600_000_000_000_000))
}

/// Refresh, then move the clock on so the next cycle gets a later
/// time.
fn refresh_and_tick<S: Store>(store: &mut S, clock: &TestingClock) {
    refresh(store, clock).unwrap();
    clock.advance(Duration::seconds(1));
}

fn example_areas() -> Vec<RawArea> {
    vec![
        RawArea::new("01001", "Agawam", "MA", 15338),
        RawArea::new("01002", "Amherst", "MA", 35000),
        RawArea::new("90210", "Beverly Hills", "CA", 21000),
    ]
}

const CITIES: [(&str, &str); 6] = [
    ("Springfield", "MA"),
    ("Springfield", "IL"),
    ("Boston", "MA"),
    ("Chicago", "IL"),
    ("Fresno", "CA"),
    ("Agawam", "MA"),
];

/// Areas with some repeated zips. A zip always belongs to the same
/// city, but repeats carry a different population.
fn random_areas(rng: &fastrand::Rng, count: usize) -> Vec<RawArea> {
    (0..count)
        .map(|_| {
            let city_index = rng.usize(..CITIES.len());
            let (city, state) = CITIES[city_index];
            let zip = format!("{city_index}{:04}", rng.u32(0..40));
            RawArea::new(&zip, city, state, rng.i64(0..50_000))
        })
        .collect()
}

fn end_to_end_example<S: Store>(mut store: S) {
    store.insert_areas(example_areas()).unwrap();
    refresh(&mut store, &clock()).unwrap();

    let cities = figures::<CityLevel, _>(&store, ViewKind::Incremental);
    let expected = vec![
        (CityKey::new("Agawam", "MA"), 1, 15338, 15338),
        (CityKey::new("Amherst", "MA"), 1, 35000, 35000),
        (CityKey::new("Beverly Hills", "CA"), 1, 21000, 21000),
    ];
    assert_eq!(cities, expected);

    let states = figures::<StateLevel, _>(&store, ViewKind::Incremental);
    let expected = vec![
        (StateKey("CA".into()), 1, 21000, 21000),
        (StateKey("MA".into()), 2, 50338, 25169),
    ];
    assert_eq!(states, expected);
}

fn refresh_is_idempotent<S: Store>(mut store: S) {
    let rng = fastrand::Rng::with_seed(7);
    let clock = clock();
    store.insert_areas(random_areas(&rng, 200)).unwrap();
    refresh_and_tick(&mut store, &clock);

    let cities = store
        .find_summaries::<CityLevel>(ViewKind::Incremental, None)
        .unwrap();
    let states = store
        .find_summaries::<StateLevel>(ViewKind::Incremental, None)
        .unwrap();

    let report = refresh(&mut store, &clock).unwrap();
    assert_eq!(report.areas_tagged, 0);
    assert_eq!(report.city.selected, 0);
    assert_eq!(report.state.selected, 0);

    assert_eq!(
        store
            .find_summaries::<CityLevel>(ViewKind::Incremental, None)
            .unwrap(),
        cities
    );
    assert_eq!(
        store
            .find_summaries::<StateLevel>(ViewKind::Incremental, None)
            .unwrap(),
        states
    );
}

fn incremental_matches_baseline<S: Store>(mut store: S) {
    let rng = fastrand::Rng::with_seed(11);
    let clock = clock();
    store.insert_areas(random_areas(&rng, 300)).unwrap();
    refresh_and_tick(&mut store, &clock);
    rebuild(&mut store, &clock).unwrap();

    assert_eq!(
        figures::<CityLevel, _>(&store, ViewKind::Incremental),
        figures::<CityLevel, _>(&store, ViewKind::Full)
    );
    assert_eq!(
        figures::<StateLevel, _>(&store, ViewKind::Incremental),
        figures::<StateLevel, _>(&store, ViewKind::Full)
    );
    assert!(verify(&store).unwrap().is_consistent());
}

fn split_loads_match_single_load<S: Store>(mut split: S, mut single: S) {
    let clock = clock();
    for seed in 0..5 {
        let rng = fastrand::Rng::with_seed(seed);
        let areas = random_areas(&rng, 150);
        let at = rng.usize(..=areas.len());
        let (first, second) = areas.split_at(at);

        split.insert_areas(first.to_vec()).unwrap();
        refresh_and_tick(&mut split, &clock);
        split.insert_areas(second.to_vec()).unwrap();
        refresh_and_tick(&mut split, &clock);

        single.insert_areas(areas.clone()).unwrap();
        refresh_and_tick(&mut single, &clock);

        assert_eq!(
            figures::<CityLevel, _>(&split, ViewKind::Incremental),
            figures::<CityLevel, _>(&single, ViewKind::Incremental),
            "seed {seed} split at {at}"
        );
        assert_eq!(
            figures::<StateLevel, _>(&split, ViewKind::Incremental),
            figures::<StateLevel, _>(&single, ViewKind::Incremental),
            "seed {seed} split at {at}"
        );
    }
}

fn watermark_gating_is_strict<S: Store>(mut store: S) {
    let clock = clock();
    let mark = clock.now();
    refresh_and_tick(&mut store, &clock);
    assert_eq!(Watermark::get(&store).unwrap(), Watermark::At(mark));

    store
        .insert_areas(vec![
            RawArea::new("01001", "Agawam", "MA", 15338).with_last_modified(mark),
            RawArea::new("01002", "Amherst", "MA", 35000).with_last_modified(mark.succ()),
        ])
        .unwrap();
    let report = refresh(&mut store, &clock).unwrap();
    assert_eq!(report.city.selected, 1);

    let cities = figures::<CityLevel, _>(&store, ViewKind::Incremental);
    assert_eq!(cities, vec![(CityKey::new("Amherst", "MA"), 1, 35000, 35000)]);
}

fn later_load_overlays_same_zip<S: Store>(mut store: S) {
    let clock = clock();
    store
        .insert_areas(vec![RawArea::new("X", "Springfield", "MA", 100)])
        .unwrap();
    refresh_and_tick(&mut store, &clock);
    store
        .insert_areas(vec![RawArea::new("X", "Springfield", "MA", 200)])
        .unwrap();
    refresh_and_tick(&mut store, &clock);

    let group = store
        .load_group::<CityLevel>(&CityKey::new("Springfield", "MA"))
        .unwrap()
        .unwrap();
    assert_eq!(group.members.len(), 1);
    assert_eq!(group.members.get("X").map(|a| a.pop), Some(200));

    let states = figures::<StateLevel, _>(&store, ViewKind::Incremental);
    assert_eq!(states, vec![(StateKey("MA".into()), 1, 200, 200)]);
}

fn malformed_area_fails_cycle<S: Store>(mut store: S) {
    let clock = clock();
    let mut bad = RawArea::new("01002", "Amherst", "MA", 0);
    bad.pop = None;
    store
        .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338), bad])
        .unwrap();

    let err = refresh(&mut store, &clock).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    assert_eq!(Watermark::get(&store).unwrap(), Watermark::Unset);
    assert!(store.find_groups::<CityLevel>().unwrap().is_empty());
}

macro_rules! for_each_store {
    ($($name:ident),* $(,)?) => {
        mod in_mem {
            use super::*;
            $(
                #[test]
                fn $name() {
                    super::$name(InMemStore::new());
                }
            )*
        }

        mod sqlite {
            use super::*;
            $(
                #[test]
                fn $name() {
                    super::$name(SqliteStore::open_in_memory().unwrap());
                }
            )*
        }
    };
}

for_each_store!(
    end_to_end_example,
    refresh_is_idempotent,
    incremental_matches_baseline,
    watermark_gating_is_strict,
    later_load_overlays_same_zip,
    malformed_area_fails_cycle,
);

#[test]
fn split_loads_match_single_load_in_mem() {
    split_loads_match_single_load(InMemStore::new(), InMemStore::new());
}

#[test]
fn split_loads_match_single_load_sqlite() {
    split_loads_match_single_load(
        SqliteStore::open_in_memory().unwrap(),
        SqliteStore::open_in_memory().unwrap(),
    );
}

/// Delegates to an [`InMemStore`] but can fail writing state
/// summaries, the last step before the watermark advances.
struct FlakyStore {
    inner: InMemStore,
    fail_state_summaries: bool,
}

impl Store for FlakyStore {
    fn begin(&mut self) -> Result<()> {
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn insert_areas(&mut self, areas: Vec<RawArea>) -> Result<usize> {
        self.inner.insert_areas(areas)
    }

    fn stamp_untagged_areas(&mut self, now: Timestamp) -> Result<usize> {
        self.inner.stamp_untagged_areas(now)
    }

    fn find_areas(&self, filter: AreaFilter) -> Result<Vec<StoredArea>> {
        self.inner.find_areas(filter)
    }

    fn load_group<L: Level>(&self, key: &L::Key) -> Result<Option<Group<L>>> {
        self.inner.load_group(key)
    }

    fn find_groups<L: Level>(&self) -> Result<Vec<Group<L>>> {
        self.inner.find_groups()
    }

    fn upsert_group<L: Level>(&mut self, group: &Group<L>) -> Result<()> {
        self.inner.upsert_group(group)
    }

    fn replace_summaries<L: Level>(
        &mut self,
        view: ViewKind,
        summaries: &[Summary<L::Key>],
    ) -> Result<()> {
        if self.fail_state_summaries && L::NAME == StateLevel::NAME {
            return Err(tracked_err(
                ErrorKind::StoreUnavailable,
                "lost connection writing state summaries",
            ));
        }
        self.inner.replace_summaries::<L>(view, summaries)
    }

    fn find_summaries<L: Level>(
        &self,
        view: ViewKind,
        after: Option<Timestamp>,
    ) -> Result<Vec<Summary<L::Key>>> {
        self.inner.find_summaries::<L>(view, after)
    }

    fn load_watermark(&self) -> Result<Option<Timestamp>> {
        self.inner.load_watermark()
    }

    fn save_watermark(&mut self, at: Timestamp) -> Result<()> {
        self.inner.save_watermark(at)
    }
}

#[test]
fn failed_cycle_does_not_advance_watermark() {
    let clock = clock();
    let mut store = FlakyStore {
        inner: InMemStore::new(),
        fail_state_summaries: false,
    };
    store
        .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338)])
        .unwrap();
    let first = clock.now();
    refresh_and_tick(&mut store, &clock);

    store
        .insert_areas(vec![RawArea::new("01002", "Amherst", "MA", 35000)])
        .unwrap();
    store.fail_state_summaries = true;
    let err = refresh(&mut store, &clock).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert_eq!(Watermark::get(&store).unwrap(), Watermark::At(first));
    assert_eq!(store.find_groups::<CityLevel>().unwrap().len(), 1);
    assert_eq!(store.find_areas(AreaFilter::Untagged).unwrap().len(), 1);

    // The retry sees the same window again.
    store.fail_state_summaries = false;
    clock.advance(Duration::seconds(1));
    let report = refresh(&mut store, &clock).unwrap();
    assert_eq!(report.previous, Watermark::At(first));
    assert_eq!(report.city.selected, 1);
    let states = figures::<StateLevel, _>(&store, ViewKind::Incremental);
    assert_eq!(states, vec![(StateKey("MA".into()), 2, 50338, 25169)]);
}

#[test]
fn sqlite_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zipagg.sqlite3");
    let clock = clock();
    let first = clock.now();

    {
        let mut store = SqliteStore::open(&path).unwrap();
        store.insert_areas(example_areas()).unwrap();
        refresh_and_tick(&mut store, &clock);
    }

    let mut store = SqliteStore::open(&path).unwrap();
    assert_eq!(Watermark::get(&store).unwrap(), Watermark::At(first));
    let report = refresh(&mut store, &clock).unwrap();
    assert_eq!(report.city.selected, 0);
    let states = figures::<StateLevel, _>(&store, ViewKind::Incremental);
    assert_eq!(states.len(), 2);
}

#[test]
fn sqlite_cycle_lock_serializes_writers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zipagg.sqlite3");
    let clock = clock();
    let mut holder = SqliteStore::open(&path).unwrap();
    let mut other = SqliteStore::open(&path).unwrap();
    other
        .set_busy_timeout(std::time::Duration::from_millis(10))
        .unwrap();

    holder.begin().unwrap();
    holder.save_watermark(Timestamp(5)).unwrap();

    let err = other.begin().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    let err = other.insert_areas(example_areas()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    let err = refresh(&mut other, &clock).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    // Readers only see committed writes.
    assert_eq!(Watermark::get(&other).unwrap(), Watermark::Unset);

    holder.commit().unwrap();

    assert_eq!(
        Watermark::get(&other).unwrap(),
        Watermark::At(Timestamp(5))
    );
    assert_eq!(other.insert_areas(example_areas()).unwrap(), 3);
    let report = refresh(&mut other, &clock).unwrap();
    assert_eq!(report.city.selected, 3);
    assert_eq!(holder.find_areas(AreaFilter::All).unwrap().len(), 3);
}
