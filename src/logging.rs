//! Logging setup.
//!
//! Logging to stderr is always enabled, at least at the "ERROR" level.
//!
//! The filter can be configured with an env var: "ZIPAGG_LOG". See
//! tracing-subscriber's documentation:
//! https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html
//!
//! eg: to set zipagg's logs to the "debug" level, and all other
//! packages to the "error" level:
//!     $ ZIPAGG_LOG="zipagg=debug,error" zipagg refresh

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_ENV_VAR: &str = "ZIPAGG_LOG";

fn get_log_level(level: Option<&str>) -> Result<LevelFilter, String> {
    match level.map(str::to_lowercase).as_deref() {
        None => Ok(LevelFilter::ERROR),
        Some("trace") => Ok(LevelFilter::TRACE),
        Some("debug") => Ok(LevelFilter::DEBUG),
        Some("info") => Ok(LevelFilter::INFO),
        Some("warn") => Ok(LevelFilter::WARN),
        Some("error") => Ok(LevelFilter::ERROR),
        Some(level) => Err(format!("Wrong log level: {level}")),
    }
}

/// Install the global subscriber.
///
/// An explicit `log_level` applies to this crate only. Otherwise the
/// filter comes from [`LOG_ENV_VAR`], falling back to errors only.
pub fn setup(log_level: Option<&str>) -> Result<(), String> {
    let logs = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);

    match log_level {
        Some(level) => {
            let level = get_log_level(Some(level))?;
            let logs = logs.with_filter(Targets::new().with_target("zipagg", level));
            set_global_subscriber(Registry::default().with(logs));
        }
        None => {
            let filter = EnvFilter::builder()
                .with_default_directive(LevelFilter::ERROR.into())
                .with_env_var(LOG_ENV_VAR)
                .from_env_lossy();
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)));
        }
    }
    Ok(())
}

// Try to set a global default subscriber, logging the error without
// panicking if it was already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if logging was already initialized, which
    // happens when tests set it up more than once per process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_level_parsing() {
    assert_eq!(get_log_level(None), Ok(LevelFilter::ERROR));
    assert_eq!(get_log_level(Some("DEBUG")), Ok(LevelFilter::DEBUG));
    assert!(get_log_level(Some("loud")).is_err());
}

#[test]
fn second_setup_does_not_panic() {
    setup(Some("debug")).unwrap();
    setup(None).unwrap();
}
