//! Incrementally maintained population averages over ZIP areas.
//!
//! Raw area documents are loaded into a [`store::Store`]. Each
//! [`refresh::refresh`] cycle folds only the areas modified since the
//! last cycle's [`watermark::Watermark`] into per-city groups, then the
//! changed city summaries into per-state groups, and recomputes the
//! average population of each. [`baseline::rebuild`] recomputes the
//! same summaries from scratch for cross-checking.

pub mod aggregate;
pub mod baseline;
pub mod clock;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod level;
pub mod logging;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod refresh;
pub mod store;
pub mod tagger;
pub mod watermark;

pub use errors::{Error, ErrorKind, Result};
pub use refresh::refresh;
