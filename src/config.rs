//! Runtime configuration shared by every command.

use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// SQLite database holding areas, groups, summaries and the
    /// watermark. Created if missing.
    #[arg(long, env = "ZIPAGG_DB", default_value = "zipagg.sqlite3")]
    pub db_path: PathBuf,

    /// Log level for zipagg: trace, debug, info, warn or error.
    /// Overrides the ZIPAGG_LOG filter.
    #[arg(long)]
    pub log_level: Option<String>,

    /// How many of the most populous summaries `show` prints per
    /// level.
    #[arg(long, default_value = "3")]
    pub sample_size: usize,

    /// Print Prometheus metrics after the command.
    #[arg(long, default_value = "false")]
    pub metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("zipagg.sqlite3"),
            log_level: None,
            sample_size: 3,
            metrics: false,
        }
    }
}

impl Config {
    /// Validate the configuration at startup
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_size == 0 {
            return Err("--sample-size must be at least 1".to_string());
        }
        if self.db_path.as_os_str().is_empty() {
            return Err("--db-path must not be empty".to_string());
        }
        Ok(())
    }
}

#[test]
fn defaults_are_valid() {
    assert_eq!(Config::default().validate(), Ok(()));

    let config = Config {
        sample_size: 0,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}
