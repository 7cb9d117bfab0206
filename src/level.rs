//! The two aggregation levels.
//!
//! A [`Level`] says what a group at that level is keyed by, what its
//! members are, and where new members come from. The merge and
//! summarize machinery is written once against this trait.

use std::fmt::{Debug, Display};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::Result;
use crate::model::{AreaRecord, CityKey, CitySummary, StateKey, ViewKind};
use crate::store::{AreaFilter, Store};
use crate::watermark::Watermark;

pub trait Level {
    /// Group key.
    type Key: Clone + Ord + Debug + Display + Serialize + DeserializeOwned;
    /// What a group of this level collects.
    type Member: Clone + Debug + PartialEq + Serialize + DeserializeOwned;

    /// Name used for storage and logging.
    const NAME: &'static str;

    /// Natural key of a member. Unique within one group.
    fn member_key(member: &Self::Member) -> String;

    /// Key of the group a member belongs to.
    fn group_key(member: &Self::Member) -> Self::Key;

    /// `(area_count, pop_sum)` a member contributes to its group.
    fn tally(member: &Self::Member) -> (u64, u64);

    /// Read every member modified after the watermark.
    fn select_new<S: Store>(store: &S, watermark: Watermark) -> Result<Vec<Self::Member>>;
}

/// Areas grouped by `(city, state)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CityLevel;

impl Level for CityLevel {
    type Key = CityKey;
    type Member = AreaRecord;

    const NAME: &'static str = "city";

    fn member_key(member: &AreaRecord) -> String {
        member.zip.clone()
    }

    fn group_key(member: &AreaRecord) -> CityKey {
        CityKey::new(&member.city, &member.state)
    }

    fn tally(member: &AreaRecord) -> (u64, u64) {
        (1, member.pop)
    }

    fn select_new<S: Store>(store: &S, watermark: Watermark) -> Result<Vec<AreaRecord>> {
        let filter = match watermark {
            Watermark::Unset => AreaFilter::All,
            Watermark::At(at) => AreaFilter::ModifiedAfter(at),
        };
        store
            .find_areas(filter)?
            .into_iter()
            .map(AreaRecord::try_from)
            .collect()
    }
}

/// City summaries grouped by state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StateLevel;

impl Level for StateLevel {
    type Key = StateKey;
    type Member = CitySummary;

    const NAME: &'static str = "state";

    /// Within one state a city name is unique.
    fn member_key(member: &CitySummary) -> String {
        member.key.city.clone()
    }

    fn group_key(member: &CitySummary) -> StateKey {
        StateKey(member.key.state.clone())
    }

    fn tally(member: &CitySummary) -> (u64, u64) {
        (member.area_count, member.pop_sum)
    }

    fn select_new<S: Store>(store: &S, watermark: Watermark) -> Result<Vec<CitySummary>> {
        store.find_summaries::<CityLevel>(ViewKind::Incremental, watermark.after())
    }
}
