//! Stamp raw areas with a modification time.

use tracing::instrument;

use crate::errors::{tracked_err, ErrorKind, Result};
use crate::model::{StoredArea, Timestamp};
use crate::store::{AreaFilter, Store};

/// Set the modification time of every untagged area to `now`.
///
/// Already tagged areas are untouched, so tagging twice is a no-op.
/// Untagged documents missing a required field fail the whole call
/// before anything is written. Returns how many areas were tagged.
#[instrument(name = "tag", skip(store))]
pub fn tag<S: Store>(store: &mut S, now: Timestamp) -> Result<usize> {
    let untagged = store.find_areas(AreaFilter::Untagged)?;
    untagged.iter().try_for_each(StoredArea::validate)?;

    let stamped = store.stamp_untagged_areas(now)?;
    if stamped != untagged.len() {
        return Err(tracked_err(
            ErrorKind::Consistency,
            &format!(
                "found {} untagged areas but stamped {stamped}; was the store written concurrently?",
                untagged.len()
            ),
        ));
    }
    tracing::debug!("Tagged {stamped} areas");
    Ok(stamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawArea;
    use crate::store::in_mem::InMemStore;

    #[test]
    fn tags_only_untagged() {
        let mut store = InMemStore::new();
        store
            .insert_areas(vec![
                RawArea::new("01001", "Agawam", "MA", 15338),
                RawArea::new("01002", "Amherst", "MA", 35000).with_last_modified(Timestamp(1)),
            ])
            .unwrap();

        assert_eq!(tag(&mut store, Timestamp(5)).unwrap(), 1);
        assert_eq!(tag(&mut store, Timestamp(9)).unwrap(), 0);

        let found: Vec<_> = store
            .find_areas(AreaFilter::All)
            .unwrap()
            .into_iter()
            .map(|StoredArea(_doc_id, area)| area.last_modified)
            .collect();
        assert_eq!(found, vec![Some(Timestamp(5)), Some(Timestamp(1))]);
    }

    #[test]
    fn malformed_area_fails_without_tagging() {
        let mut store = InMemStore::new();
        let mut missing_pop = RawArea::new("01002", "Amherst", "MA", 0);
        missing_pop.pop = None;
        store
            .insert_areas(vec![RawArea::new("01001", "Agawam", "MA", 15338), missing_pop])
            .unwrap();

        let err = tag(&mut store, Timestamp(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
        assert_eq!(store.find_areas(AreaFilter::Untagged).unwrap().len(), 2);
    }
}
