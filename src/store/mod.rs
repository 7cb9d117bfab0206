//! Persistent stores for raw areas, groups, summaries and the
//! watermark.
//!
//! A store is modeled as a handful of keyed tables; it has no
//! aggregation abilities of its own. All grouping and merging happens
//! in [`crate::merge`], and stores only persist the results.
//!
//! There are two implementations: [`sqlite::SqliteStore`] for real
//! use and [`in_mem::InMemStore`] for tests and dry runs.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{tracked_err, ErrorKind, Reraise, Result};
use crate::level::Level;
use crate::merge::{Group, MemberSet};
use crate::model::{RawArea, StoredArea, Summary, Timestamp, ViewKind};

pub mod in_mem;
pub mod sqlite;

/// Which raw area documents to read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AreaFilter {
    All,
    /// Documents without a modification time.
    Untagged,
    /// Documents modified strictly after the given time.
    ModifiedAfter(Timestamp),
}

impl AreaFilter {
    pub(crate) fn matches(&self, last_modified: Option<Timestamp>) -> bool {
        match (self, last_modified) {
            (Self::All, _) => true,
            (Self::Untagged, lm) => lm.is_none(),
            (Self::ModifiedAfter(after), Some(lm)) => lm > *after,
            (Self::ModifiedAfter(_), None) => false,
        }
    }
}

/// All the operations the aggregation engine needs from a store.
///
/// Single writer: methods take `&mut self` to write. Reads must
/// observe every write made through the same store, including the
/// watermark.
pub trait Store {
    /// Start the unit of work for one cycle.
    ///
    /// Writes made until [`Self::commit`] or [`Self::rollback`] are
    /// applied together or not at all.
    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Append raw documents. Returns how many were written.
    fn insert_areas(&mut self, areas: Vec<RawArea>) -> Result<usize>;

    /// Set the modification time of every untagged document to `now`.
    /// Returns how many were stamped.
    fn stamp_untagged_areas(&mut self, now: Timestamp) -> Result<usize>;

    /// Read documents in insertion order.
    fn find_areas(&self, filter: AreaFilter) -> Result<Vec<StoredArea>>;

    fn load_group<L: Level>(&self, key: &L::Key) -> Result<Option<Group<L>>>;

    /// Every group of a level, in key order.
    fn find_groups<L: Level>(&self) -> Result<Vec<Group<L>>>;

    /// Insert or replace the group with the same key.
    fn upsert_group<L: Level>(&mut self, group: &Group<L>) -> Result<()>;

    /// Overwrite every summary of a level in a view.
    fn replace_summaries<L: Level>(
        &mut self,
        view: ViewKind,
        summaries: &[Summary<L::Key>],
    ) -> Result<()>;

    /// Summaries of a level in a view, in key order, optionally only
    /// those modified strictly after a time.
    fn find_summaries<L: Level>(
        &self,
        view: ViewKind,
        after: Option<Timestamp>,
    ) -> Result<Vec<Summary<L::Key>>>;

    /// The most populous summaries first, ties in key order.
    fn top_summaries<L: Level>(&self, view: ViewKind, limit: usize) -> Result<Vec<Summary<L::Key>>> {
        let mut summaries = self.find_summaries::<L>(view, None)?;
        // Stable sort keeps key order among equal populations.
        summaries.sort_by(|a, b| b.pop_sum.cmp(&a.pop_sum));
        summaries.truncate(limit);
        Ok(summaries)
    }

    fn load_watermark(&self) -> Result<Option<Timestamp>>;

    /// Upsert the single watermark record.
    fn save_watermark(&mut self, at: Timestamp) -> Result<()>;
}

/// Run `work` between [`Store::begin`] and [`Store::commit`].
///
/// If `work` or the commit fails the unit of work is rolled back, so
/// the store is ready for the next one, and the first error is
/// returned.
pub fn in_unit_of_work<S, T, F>(store: &mut S, work: F) -> Result<T>
where
    S: Store,
    F: FnOnce(&mut S) -> Result<T>,
{
    store.begin()?;
    match work(store).and_then(|res| store.commit().map(|()| res)) {
        Ok(res) => Ok(res),
        Err(err) => {
            tracing::warn!("Unit of work failed; rolling back: {err}");
            if let Err(rollback_err) = store.rollback() {
                tracing::error!("Rollback failed too: {rollback_err}");
            }
            Err(err)
        }
    }
}

/// Group keys are stored as their JSON encoding, the way a document
/// store would use a compound `_id`.
pub(crate) fn encode_key<K: Serialize>(key: &K) -> Result<String> {
    serde_json::to_string(key).raise(ErrorKind::Consistency, "error encoding group key")
}

pub(crate) fn decode_key<K: DeserializeOwned>(key: &str) -> Result<K> {
    serde_json::from_str(key)
        .raise(ErrorKind::Consistency, &format!("malformed group key {key:?}"))
}

/// Members are stored as a JSON array in natural key order.
pub(crate) fn encode_members<L: Level>(members: &MemberSet<L>) -> Result<String> {
    let members: Vec<_> = members.iter().collect();
    serde_json::to_string(&members).raise(ErrorKind::Consistency, "error encoding members")
}

pub(crate) fn decode_members<L: Level>(members: &str) -> Result<MemberSet<L>> {
    let members: Vec<L::Member> = serde_json::from_str(members).raise(
        ErrorKind::Consistency,
        &format!("malformed {} group members", L::NAME),
    )?;
    Ok(MemberSet::from_members(members))
}

/// Rebuild a stored group, checking every member belongs under its
/// key.
pub(crate) fn decode_group<L: Level>(
    key: &str,
    members: &str,
    last_modified: Timestamp,
) -> Result<Group<L>> {
    let key: L::Key = decode_key(key)?;
    let members = decode_members::<L>(members)?;
    if let Some(stray) = members.iter().find(|m| L::group_key(m) != key) {
        return Err(tracked_err(
            ErrorKind::Consistency,
            &format!("{} group {key:?} holds a member of another group: {stray:?}", L::NAME),
        ));
    }
    Ok(Group {
        key,
        members,
        last_modified,
    })
}

/// Raw documents are stored without their modification time, which
/// lives in its own column so it can be compared and stamped.
pub(crate) fn encode_area(area: &RawArea) -> Result<String> {
    let body = RawArea {
        last_modified: None,
        ..area.clone()
    };
    serde_json::to_string(&body).raise(ErrorKind::Consistency, "error encoding area document")
}

pub(crate) fn decode_area(body: &str, last_modified: Option<Timestamp>) -> Result<RawArea> {
    let mut area: RawArea = serde_json::from_str(body)
        .raise(ErrorKind::MalformedRecord, &format!("malformed area document {body:?}"))?;
    area.last_modified = last_modified;
    Ok(area)
}

#[test]
fn filter_matches() {
    assert!(AreaFilter::All.matches(None));
    assert!(AreaFilter::Untagged.matches(None));
    assert!(!AreaFilter::Untagged.matches(Some(Timestamp(1))));
    assert!(!AreaFilter::ModifiedAfter(Timestamp(1)).matches(Some(Timestamp(1))));
    assert!(AreaFilter::ModifiedAfter(Timestamp(1)).matches(Some(Timestamp(2))));
    assert!(!AreaFilter::ModifiedAfter(Timestamp(1)).matches(None));
}

#[test]
fn city_key_encoding_is_compound() {
    use crate::model::CityKey;

    let found = encode_key(&CityKey::new("Agawam", "MA")).unwrap();
    assert_eq!(found, r#"{"city":"Agawam","state":"MA"}"#);
    let back: CityKey = decode_key(&found).unwrap();
    assert_eq!(back, CityKey::new("Agawam", "MA"));
}
