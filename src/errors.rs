//! Error kinds surfaced by a refresh cycle.
//!
//! Every failure aborts the whole cycle, so callers mostly care about
//! [`ErrorKind`]: a store that can't be reached, data in the store
//! that breaks an aggregation invariant, or an input document missing
//! a load-bearing field.

use std::panic::Location;

/// Boxed foreign error kept as the source of an [`Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A store operation failed to connect or execute.
    StoreUnavailable,
    /// Stored aggregates contradict an invariant. Never repaired
    /// silently.
    Consistency,
    /// An input area document is missing a required field.
    MalformedRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store unavailable: {msg}")]
    StoreUnavailable {
        msg: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("consistency violation: {msg}")]
    Consistency {
        msg: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("malformed input record: {msg}")]
    MalformedRecord {
        msg: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            Self::Consistency { .. } => ErrorKind::Consistency,
            Self::MalformedRecord { .. } => ErrorKind::MalformedRecord,
        }
    }

    fn new(kind: ErrorKind, msg: String, source: Option<BoxError>) -> Self {
        match kind {
            ErrorKind::StoreUnavailable => Self::StoreUnavailable { msg, source },
            ErrorKind::Consistency => Self::Consistency { msg, source },
            ErrorKind::MalformedRecord => Self::MalformedRecord { msg, source },
        }
    }
}

/// A trait to build a located [`Error`] from anything that can be
/// converted into a boxed error result.
pub(crate) trait Reraise<T> {
    /// Only this needs to be implemented.
    fn into_boxed(self) -> std::result::Result<T, BoxError>;

    /// Keep the existing error as the source and raise a
    /// [`Error::StoreUnavailable`] with its own message.
    ///
    /// Example:
    ///     conn.execute(sql, ()).reraise("error deleting summaries")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_boxed().map_err(|err| {
            Error::new(
                ErrorKind::StoreUnavailable,
                prepend_caller(caller, msg),
                Some(err),
            )
        })
    }

    /// Like [`Self::reraise`] but only builds the message on error.
    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> Result<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_boxed().map_err(|err| {
            Error::new(
                ErrorKind::StoreUnavailable,
                prepend_caller(caller, &msg()),
                Some(err),
            )
        })
    }

    /// Raise a specific kind of error, keeping the existing one as
    /// the source.
    ///
    /// Example:
    ///     serde_json::from_str(&body).raise(ErrorKind::Consistency, "bad members")?;
    #[track_caller]
    fn raise(self, kind: ErrorKind, msg: &str) -> Result<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_boxed()
            .map_err(|err| Error::new(kind, prepend_caller(caller, msg), Some(err)))
    }
}

impl<T> Reraise<T> for std::result::Result<T, rusqlite::Error> {
    fn into_boxed(self) -> std::result::Result<T, BoxError> {
        self.map_err(BoxError::from)
    }
}

impl<T> Reraise<T> for std::result::Result<T, rusqlite_migration::Error> {
    fn into_boxed(self) -> std::result::Result<T, BoxError> {
        self.map_err(BoxError::from)
    }
}

impl<T> Reraise<T> for std::result::Result<T, serde_json::Error> {
    fn into_boxed(self) -> std::result::Result<T, BoxError> {
        self.map_err(BoxError::from)
    }
}

impl<T> Reraise<T> for std::io::Result<T> {
    fn into_boxed(self) -> std::result::Result<T, BoxError> {
        self.map_err(BoxError::from)
    }
}

/// Use this function to create an [`Error`] with location tracking.
#[track_caller]
pub fn tracked_err(kind: ErrorKind, msg: &str) -> Error {
    let caller = Location::caller();
    Error::new(kind, prepend_caller(caller, msg), None)
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

#[test]
fn tracked_err_includes_location() {
    let err = tracked_err(ErrorKind::Consistency, "group has no members");
    assert_eq!(err.kind(), ErrorKind::Consistency);
    let msg = err.to_string();
    assert!(msg.starts_with("consistency violation: (src/errors.rs:"), "{msg}");
    assert!(msg.ends_with("group has no members"), "{msg}");
}

#[test]
fn reraise_keeps_source() {
    use std::error::Error as _;

    let res: std::io::Result<()> = Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no such db",
    ));
    let err = res.reraise("can't open store").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert_eq!(err.source().map(|s| s.to_string()), Some("no such db".into()));
}

#[test]
fn raise_changes_kind() {
    let res: std::result::Result<u64, serde_json::Error> = serde_json::from_str("nope");
    let err = res.raise(ErrorKind::Consistency, "bad members").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
}
