//! The checkpoint of the last completed refresh cycle.
//!
//! A single record in the store holds `last_loaded_time`. Anything
//! modified strictly after it has not been incorporated yet.

use tracing::instrument;

use crate::errors::Result;
use crate::model::Timestamp;
use crate::store::Store;

/// The boundary between processed and unprocessed input.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Watermark {
    /// No cycle has completed yet; all input is new.
    #[default]
    Unset,
    /// Last completed cycle's time.
    At(Timestamp),
}

impl Watermark {
    /// Read the current watermark.
    ///
    /// A missing record is the normal state before the first cycle.
    pub fn get<S: Store>(store: &S) -> Result<Self> {
        Ok(store.load_watermark()?.map_or(Self::Unset, Self::At))
    }

    /// Overwrite the watermark. Upserting the same value twice is a
    /// no-op.
    ///
    /// Must be the last write of a successful cycle.
    #[instrument(name = "advance_watermark", skip(store))]
    pub fn advance<S: Store>(store: &mut S, at: Timestamp) -> Result<Self> {
        store.save_watermark(at)?;
        tracing::debug!("Watermark advanced to {at}");
        Ok(Self::At(at))
    }

    /// The lower bound (exclusive) of new input, if any.
    pub fn after(&self) -> Option<Timestamp> {
        match self {
            Self::Unset => None,
            Self::At(at) => Some(*at),
        }
    }

    /// The time to stamp a new cycle with, given the clock's `now`.
    ///
    /// Must be strictly after the watermark, otherwise areas tagged by
    /// the cycle would never be selected.
    pub fn next_cycle_time(&self, now: Timestamp) -> Timestamp {
        match self {
            Self::At(mark) if now <= *mark => {
                tracing::warn!(
                    "Clock reads {now} which is not after watermark {mark}; using {}",
                    mark.succ()
                );
                mark.succ()
            }
            _ => now,
        }
    }

    /// Would something modified at `at` be selected as new?
    pub fn admits(&self, at: Timestamp) -> bool {
        match self {
            Self::Unset => true,
            Self::At(mark) => at > *mark,
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => f.write_str("unset"),
            Self::At(at) => std::fmt::Display::fmt(at, f),
        }
    }
}

#[test]
fn gating_is_strict() {
    let mark = Watermark::At(Timestamp(1_000));
    assert!(!mark.admits(Timestamp(999)));
    assert!(!mark.admits(Timestamp(1_000)));
    assert!(mark.admits(Timestamp(1_001)));
    assert!(Watermark::Unset.admits(Timestamp(i64::MIN)));
}

#[test]
fn get_before_first_advance_is_unset() {
    use crate::store::in_mem::InMemStore;

    let mut store = InMemStore::new();
    assert_eq!(Watermark::get(&store).unwrap(), Watermark::Unset);

    Watermark::advance(&mut store, Timestamp(5)).unwrap();
    Watermark::advance(&mut store, Timestamp(5)).unwrap();
    assert_eq!(Watermark::get(&store).unwrap(), Watermark::At(Timestamp(5)));

    Watermark::advance(&mut store, Timestamp(9)).unwrap();
    assert_eq!(Watermark::get(&store).unwrap(), Watermark::At(Timestamp(9)));
}

#[test]
fn next_cycle_time_is_after_watermark() {
    let mark = Watermark::At(Timestamp(1_000));
    assert_eq!(mark.next_cycle_time(Timestamp(2_000)), Timestamp(2_000));
    assert_eq!(mark.next_cycle_time(Timestamp(1_000)), Timestamp(1_001));
    assert_eq!(mark.next_cycle_time(Timestamp(5)), Timestamp(1_001));
    assert_eq!(Watermark::Unset.next_cycle_time(Timestamp(5)), Timestamp(5));
}
