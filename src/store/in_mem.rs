//! Implementation of an in-memory store.
//!
//! Rows are kept encoded the same way the SQLite store encodes them,
//! so round trips through here exercise the same codecs.

use std::collections::BTreeMap;

use crate::errors::{tracked_err, ErrorKind, Result};
use crate::level::Level;
use crate::merge::Group;
use crate::model::{DocId, RawArea, StoredArea, Summary, Timestamp, ViewKind};

use super::{
    decode_area, decode_group, decode_key, encode_area, encode_key, encode_members, AreaFilter,
    Store,
};

#[derive(Debug, Clone)]
struct AreaRow {
    body: String,
    last_modified: Option<Timestamp>,
}

#[derive(Debug, Clone)]
struct GroupRow {
    members: String,
    last_modified: Timestamp,
}

#[derive(Debug, Clone)]
struct SummaryRow {
    area_count: u64,
    pop_sum: u64,
    avg_pop: u64,
    last_modified: Timestamp,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    areas: BTreeMap<DocId, AreaRow>,
    next_doc_id: u64,
    /// Keyed by `(level, encoded group key)`.
    groups: BTreeMap<(&'static str, String), GroupRow>,
    /// Keyed by `(view, level, encoded group key)`.
    summaries: BTreeMap<(ViewKind, &'static str, String), SummaryRow>,
    watermark: Option<Timestamp>,
}

/// A store with all data in memory.
#[derive(Debug, Default)]
pub struct InMemStore {
    tables: Tables,
    /// Copy of the tables taken at [`Store::begin`].
    snapshot: Option<Tables>,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl Store for InMemStore {
    fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(tracked_err(
                ErrorKind::StoreUnavailable,
                "a unit of work is already in progress",
            ));
        }
        self.snapshot = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.snapshot
            .take()
            .map(drop)
            .ok_or_else(|| tracked_err(ErrorKind::StoreUnavailable, "no unit of work to commit"))
    }

    fn rollback(&mut self) -> Result<()> {
        let snapshot = self.snapshot.take().ok_or_else(|| {
            tracked_err(ErrorKind::StoreUnavailable, "no unit of work to roll back")
        })?;
        self.tables = snapshot;
        Ok(())
    }

    fn insert_areas(&mut self, areas: Vec<RawArea>) -> Result<usize> {
        let count = areas.len();
        for area in areas {
            self.tables.next_doc_id += 1;
            let doc_id = DocId(self.tables.next_doc_id);
            tracing::trace!("Inserting {doc_id:?}: {area:?}");
            let row = AreaRow {
                body: encode_area(&area)?,
                last_modified: area.last_modified,
            };
            self.tables.areas.insert(doc_id, row);
        }
        Ok(count)
    }

    fn stamp_untagged_areas(&mut self, now: Timestamp) -> Result<usize> {
        let mut stamped = 0;
        for row in self.tables.areas.values_mut() {
            if row.last_modified.is_none() {
                row.last_modified = Some(now);
                stamped += 1;
            }
        }
        Ok(stamped)
    }

    fn find_areas(&self, filter: AreaFilter) -> Result<Vec<StoredArea>> {
        self.tables
            .areas
            .iter()
            .filter(|(_doc_id, row)| filter.matches(row.last_modified))
            .map(|(doc_id, row)| {
                decode_area(&row.body, row.last_modified).map(|area| StoredArea(*doc_id, area))
            })
            .collect()
    }

    fn load_group<L: Level>(&self, key: &L::Key) -> Result<Option<Group<L>>> {
        let enc_key = encode_key(key)?;
        self.tables
            .groups
            .get(&(L::NAME, enc_key.clone()))
            .map(|row| decode_group(&enc_key, &row.members, row.last_modified))
            .transpose()
    }

    fn find_groups<L: Level>(&self) -> Result<Vec<Group<L>>> {
        let mut groups = self
            .tables
            .groups
            .iter()
            .filter(|((level, _key), _row)| *level == L::NAME)
            .map(|((_level, key), row)| decode_group(key, &row.members, row.last_modified))
            .collect::<Result<Vec<Group<L>>>>()?;
        groups.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(groups)
    }

    fn upsert_group<L: Level>(&mut self, group: &Group<L>) -> Result<()> {
        tracing::trace!("Writing {} group {:?}", L::NAME, group.key);
        let row = GroupRow {
            members: encode_members(&group.members)?,
            last_modified: group.last_modified,
        };
        self.tables
            .groups
            .insert((L::NAME, encode_key(&group.key)?), row);
        Ok(())
    }

    fn replace_summaries<L: Level>(
        &mut self,
        view: ViewKind,
        summaries: &[Summary<L::Key>],
    ) -> Result<()> {
        let mut rows = BTreeMap::new();
        for summary in summaries {
            let row = SummaryRow {
                area_count: summary.area_count,
                pop_sum: summary.pop_sum,
                avg_pop: summary.avg_pop,
                last_modified: summary.last_modified,
            };
            rows.insert((view, L::NAME, encode_key(&summary.key)?), row);
        }
        self.tables
            .summaries
            .retain(|(row_view, level, _key), _row| !(*row_view == view && *level == L::NAME));
        self.tables.summaries.extend(rows);
        Ok(())
    }

    fn find_summaries<L: Level>(
        &self,
        view: ViewKind,
        after: Option<Timestamp>,
    ) -> Result<Vec<Summary<L::Key>>> {
        let mut summaries = self
            .tables
            .summaries
            .iter()
            .filter(|((row_view, level, _key), row)| {
                *row_view == view
                    && *level == L::NAME
                    && after.map_or(true, |after| row.last_modified > after)
            })
            .map(|((_view, _level, key), row)| {
                Ok(Summary {
                    key: decode_key::<L::Key>(key)?,
                    area_count: row.area_count,
                    pop_sum: row.pop_sum,
                    avg_pop: row.avg_pop,
                    last_modified: row.last_modified,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(summaries)
    }

    fn load_watermark(&self) -> Result<Option<Timestamp>> {
        Ok(self.tables.watermark)
    }

    fn save_watermark(&mut self, at: Timestamp) -> Result<()> {
        self.tables.watermark = Some(at);
        Ok(())
    }
}

#[test]
fn rollback_restores_tables() {
    let mut store = InMemStore::new();
    store
        .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338)])
        .unwrap();

    store.begin().unwrap();
    assert!(store.in_transaction());
    store.stamp_untagged_areas(Timestamp(3)).unwrap();
    store.save_watermark(Timestamp(3)).unwrap();
    store.rollback().unwrap();

    assert!(!store.in_transaction());
    assert_eq!(store.load_watermark().unwrap(), None);
    assert_eq!(store.find_areas(AreaFilter::Untagged).unwrap().len(), 1);
}

#[test]
fn nested_begin_fails() {
    let mut store = InMemStore::new();
    store.begin().unwrap();
    let err = store.begin().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    store.commit().unwrap();
    assert!(store.commit().is_err());
}

#[test]
fn replace_summaries_only_touches_one_view_and_level() {
    use crate::level::{CityLevel, StateLevel};
    use crate::model::{CityKey, StateKey};

    let mut store = InMemStore::new();
    let city = Summary {
        key: CityKey::new("Agawam", "MA"),
        area_count: 1,
        pop_sum: 10,
        avg_pop: 10,
        last_modified: Timestamp(1),
    };
    let state = Summary {
        key: StateKey("MA".into()),
        area_count: 1,
        pop_sum: 10,
        avg_pop: 10,
        last_modified: Timestamp(1),
    };
    store
        .replace_summaries::<CityLevel>(ViewKind::Incremental, &[city.clone()])
        .unwrap();
    store
        .replace_summaries::<CityLevel>(ViewKind::Full, &[city.clone()])
        .unwrap();
    store
        .replace_summaries::<StateLevel>(ViewKind::Incremental, &[state.clone()])
        .unwrap();

    store
        .replace_summaries::<CityLevel>(ViewKind::Incremental, &[])
        .unwrap();

    assert_eq!(
        store
            .find_summaries::<CityLevel>(ViewKind::Incremental, None)
            .unwrap(),
        vec![]
    );
    assert_eq!(
        store.find_summaries::<CityLevel>(ViewKind::Full, None).unwrap(),
        vec![city]
    );
    assert_eq!(
        store
            .find_summaries::<StateLevel>(ViewKind::Incremental, None)
            .unwrap(),
        vec![state]
    );
}

#[test]
fn areas_round_trip_through_document_codec() {
    let mut area = RawArea::new("01001", "Agawam", "MA", 15338).with_last_modified(Timestamp(4));
    area.loc = Some([-72.5, 42.25]);

    let mut store = InMemStore::new();
    store.insert_areas(vec![area.clone()]).unwrap();

    let found = store.find_areas(AreaFilter::All).unwrap();
    assert_eq!(found, vec![StoredArea(DocId(1), area)]);
    assert!(!store.tables.areas[&DocId(1)].body.contains("last_modified"));
}
