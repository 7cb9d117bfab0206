//! Data model for ZIP areas and the aggregates derived from them.
//!
//! Raw input is kept as [`RawArea`] documents so that a missing field
//! is observable and can be rejected, instead of being defaulted by
//! deserialization. Components convert them into validated
//! [`AreaRecord`]s before aggregating.

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{tracked_err, ErrorKind, Result};

/// Point in time with microsecond resolution, UTC.
///
/// Persisted as the integer count of microseconds since the Unix
/// epoch so the store can compare it directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_micros())
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.div_euclid(1_000_000);
        let nanos = (self.0.rem_euclid(1_000_000) * 1_000) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }

    /// The smallest timestamp strictly after this one.
    pub fn succ(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// An area document as ingested.
///
/// Field names follow the public ZIP code data set: the natural key
/// is `_id`, but `zip` is accepted too.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawArea {
    #[serde(rename = "_id", alias = "zip", default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pop: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
}

impl RawArea {
    pub fn new(zip: &str, city: &str, state: &str, pop: i64) -> Self {
        Self {
            zip: Some(zip.to_owned()),
            city: Some(city.to_owned()),
            state: Some(state.to_owned()),
            pop: Some(pop),
            loc: None,
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, at: Timestamp) -> Self {
        self.last_modified = Some(at);
        self
    }
}

/// Insertion sequence number of a raw document in the store.
///
/// Later documents overlay earlier ones with the same natural key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocId(pub u64);

/// A raw document as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArea(pub DocId, pub RawArea);

impl StoredArea {
    /// Check every field the aggregations depend on, except the
    /// modification time.
    pub fn validate(&self) -> Result<()> {
        let StoredArea(doc_id, raw) = self;
        let missing = |field: &str| {
            tracked_err(
                ErrorKind::MalformedRecord,
                &format!("area document {doc_id:?} is missing `{field}`: {raw:?}"),
            )
        };
        match raw.zip.as_deref() {
            None | Some("") => return Err(missing("_id")),
            Some(_) => {}
        }
        match raw.city.as_deref() {
            None | Some("") => return Err(missing("city")),
            Some(_) => {}
        }
        match raw.state.as_deref() {
            None | Some("") => return Err(missing("state")),
            Some(_) => {}
        }
        match raw.pop {
            None => Err(missing("pop")),
            Some(pop) if pop < 0 => Err(tracked_err(
                ErrorKind::MalformedRecord,
                &format!("area document {doc_id:?} has negative `pop` {pop}"),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// A validated, tagged ZIP area.
///
/// Immutable once created; the engine only ever reads these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaRecord {
    pub zip: String,
    pub city: String,
    pub state: String,
    pub pop: u64,
    pub last_modified: Timestamp,
}

impl TryFrom<StoredArea> for AreaRecord {
    type Error = crate::errors::Error;

    fn try_from(stored: StoredArea) -> Result<Self> {
        stored.validate()?;
        let StoredArea(doc_id, raw) = stored;
        let last_modified = raw.last_modified.ok_or_else(|| {
            tracked_err(
                ErrorKind::MalformedRecord,
                &format!("area document {doc_id:?} was never tagged with `last_modified`"),
            )
        })?;
        // `validate` already checked that every field is present.
        match (raw.zip, raw.city, raw.state, raw.pop) {
            (Some(zip), Some(city), Some(state), Some(pop)) => Ok(Self {
                zip,
                city,
                state,
                pop: pop as u64,
                last_modified,
            }),
            _ => Err(tracked_err(
                ErrorKind::MalformedRecord,
                &format!("area document {doc_id:?} is incomplete"),
            )),
        }
    }
}

/// Natural key of a city: city names repeat across states.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CityKey {
    pub city: String,
    pub state: String,
}

impl CityKey {
    pub fn new(city: &str, state: &str) -> Self {
        Self {
            city: city.to_owned(),
            state: state.to_owned(),
        }
    }
}

impl fmt::Display for CityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.city, self.state)
    }
}

/// Natural key of a state, its postal code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(pub String);

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Average population projection of a group.
///
/// Has no state of its own; it is recomputed and overwritten from
/// the group it summarizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary<K> {
    pub key: K,
    pub area_count: u64,
    pub pop_sum: u64,
    pub avg_pop: u64,
    /// Modification time of the group this was computed from.
    pub last_modified: Timestamp,
}

impl<K: Clone> Summary<K> {
    /// The `(key, count, sum, average)` tuple, without the timestamp.
    pub fn figures(&self) -> (K, u64, u64, u64) {
        (
            self.key.clone(),
            self.area_count,
            self.pop_sum,
            self.avg_pop,
        )
    }
}

pub type CitySummary = Summary<CityKey>;
pub type StateSummary = Summary<StateKey>;

/// Population sum divided by area count, truncated toward zero.
///
/// Returns [`None`] for an empty group.
pub fn truncated_avg(pop_sum: u64, area_count: u64) -> Option<u64> {
    pop_sum.checked_div(area_count)
}

/// Which materialization a summary belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ViewKind {
    /// Maintained by incorporating new areas into groups.
    Incremental,
    /// Recomputed from every raw area by the baseline.
    Full,
}

impl ViewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[test]
fn avg_truncates() {
    assert_eq!(truncated_avg(100, 3), Some(33));
    assert_eq!(truncated_avg(100, 4), Some(25));
    assert_eq!(truncated_avg(2, 3), Some(0));
    assert_eq!(truncated_avg(100, 0), None);
}

#[test]
fn timestamp_serializes_as_micros() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(&Timestamp(1_600_000_000_000_001), &[Token::I64(1_600_000_000_000_001)]);
}

#[test]
fn timestamp_round_trips_datetime() {
    let dt = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
    let ts = Timestamp::from(dt);
    assert_eq!(ts.to_datetime(), Some(dt));
    assert_eq!(ts.to_string(), "2021-03-04T05:06:07.000000Z");
    assert_eq!(Timestamp(-1).to_string(), "1969-12-31T23:59:59.999999Z");
}

#[test]
fn raw_area_reads_data_set_shape() {
    let raw: RawArea = serde_json::from_str(
        r#"{"_id": "01001", "city": "AGAWAM", "loc": [-72.622739, 42.070206], "pop": 15338, "state": "MA"}"#,
    )
    .unwrap();
    assert_eq!(raw.zip.as_deref(), Some("01001"));
    assert_eq!(raw.pop, Some(15338));
    assert_eq!(raw.last_modified, None);

    let raw: RawArea =
        serde_json::from_str(r#"{"zip": "90210", "city": "Beverly Hills", "state": "CA"}"#)
            .unwrap();
    assert_eq!(raw.zip.as_deref(), Some("90210"));
    assert_eq!(raw.pop, None);
}

#[test]
fn validate_rejects_missing_fields() {
    let mut raw = RawArea::new("01001", "Agawam", "MA", 15338);
    raw.pop = None;
    let err = StoredArea(DocId(1), raw).validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRecord);

    let raw = RawArea::new("01001", "", "MA", 15338);
    let err = StoredArea(DocId(1), raw).validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRecord);

    let raw = RawArea::new("01001", "Agawam", "MA", -4);
    let err = StoredArea(DocId(1), raw).validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRecord);
}

#[test]
fn area_record_requires_tag() {
    let raw = RawArea::new("01001", "Agawam", "MA", 15338);
    let err = AreaRecord::try_from(StoredArea(DocId(1), raw.clone())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRecord);

    let found = AreaRecord::try_from(StoredArea(DocId(1), raw.with_last_modified(Timestamp(7))));
    let expected = AreaRecord {
        zip: "01001".into(),
        city: "Agawam".into(),
        state: "MA".into(),
        pop: 15338,
        last_modified: Timestamp(7),
    };
    assert_eq!(found.unwrap(), expected);
}
