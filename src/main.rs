//! Command line entry point.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use zipagg::baseline::{self, Mismatch};
use zipagg::clock::SystemClock;
use zipagg::config::Config;
use zipagg::level::{CityLevel, Level, StateLevel};
use zipagg::model::{Summary, ViewKind};
use zipagg::store::sqlite::SqliteStore;
use zipagg::store::Store;
use zipagg::watermark::Watermark;
use zipagg::{ingest, logging, metrics, refresh};

#[derive(Parser)]
#[command(
    name = "zipagg",
    about = "Incrementally maintained city and state population averages"
)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load raw area documents from a JSON lines file
    Load {
        file: PathBuf,
        /// Load in splits of this many documents, refreshing after
        /// each one
        #[arg(long)]
        split_size: Option<usize>,
    },
    /// Fold new areas into the incremental summaries
    Refresh,
    /// Recompute the full summaries from every area
    Rebuild,
    /// Print the watermark and the most populous summaries
    Show {
        #[arg(long, default_value = "incremental", value_enum)]
        view: ViewArg,
        /// Also print every persisted city and state group
        #[arg(long, default_value = "false")]
        groups: bool,
    },
    /// Check the incremental summaries against the full ones
    Verify,
    /// Print the watermark
    Watermark,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ViewArg {
    Incremental,
    Full,
}

impl From<ViewArg> for ViewKind {
    fn from(view: ViewArg) -> Self {
        match view {
            ViewArg::Incremental => ViewKind::Incremental,
            ViewArg::Full => ViewKind::Full,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.config;
    config.validate().map_err(anyhow::Error::msg)?;

    logging::setup(config.log_level.as_deref()).map_err(anyhow::Error::msg)?;
    if config.metrics {
        metrics::initialize_metrics().context("can't initialize metrics")?;
    }

    let mut store = SqliteStore::open(&config.db_path)?;
    let code = match cli.command {
        Commands::Load { file, split_size } => {
            load(&mut store, &file, split_size)?;
            ExitCode::SUCCESS
        }
        Commands::Refresh => {
            let report = refresh(&mut store, &SystemClock)?;
            println!(
                "watermark {} -> {}: tagged {} areas; {} new areas into {} new and {} merged cities; \
                 {} changed cities into {} new and {} merged states",
                report.previous,
                report.now,
                report.areas_tagged,
                report.city.selected,
                report.city.groups_created,
                report.city.groups_merged,
                report.state.selected,
                report.state.groups_created,
                report.state.groups_merged,
            );
            ExitCode::SUCCESS
        }
        Commands::Rebuild => {
            let report = baseline::rebuild(&mut store, &SystemClock)?;
            println!(
                "rebuilt at {}: {} cities, {} states",
                report.now, report.city_summaries, report.state_summaries
            );
            ExitCode::SUCCESS
        }
        Commands::Show { view, groups } => {
            show(&store, view.into(), config.sample_size)?;
            if groups {
                print_groups::<CityLevel>(&store)?;
                print_groups::<StateLevel>(&store)?;
            }
            ExitCode::SUCCESS
        }
        Commands::Verify => {
            let verification = baseline::verify(&store)?;
            print_mismatches("city", &verification.city);
            print_mismatches("state", &verification.state);
            if verification.is_consistent() {
                println!("incremental and full views agree");
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Watermark => {
            println!("{}", Watermark::get(&store)?);
            ExitCode::SUCCESS
        }
    };

    if config.metrics {
        print!("{}", metrics::render().context("can't render metrics")?);
    }
    Ok(code)
}

fn load(store: &mut SqliteStore, file: &Path, split_size: Option<usize>) -> Result<()> {
    let areas = ingest::read_areas(file)?;
    match split_size {
        None => {
            let count = store.insert_areas(areas)?;
            println!("loaded {count} areas");
        }
        Some(0) => anyhow::bail!("--split-size must be at least 1"),
        Some(size) => {
            for (i, split) in areas.chunks(size).enumerate() {
                let count = store.insert_areas(split.to_vec())?;
                let report = refresh(store, &SystemClock)
                    .with_context(|| format!("refresh after split {} failed", i + 1))?;
                println!(
                    "split {}: loaded {count} areas, watermark {}",
                    i + 1,
                    report.now
                );
            }
        }
    }
    Ok(())
}

fn show(store: &SqliteStore, view: ViewKind, sample_size: usize) -> Result<()> {
    println!("watermark: {}", Watermark::get(store)?);
    println!("top {sample_size} {view} city summaries:");
    print_summaries(&store.top_summaries::<CityLevel>(view, sample_size)?);
    println!("top {sample_size} {view} state summaries:");
    print_summaries(&store.top_summaries::<StateLevel>(view, sample_size)?);
    Ok(())
}

fn print_groups<L: Level>(store: &SqliteStore) -> Result<()> {
    let groups = store.find_groups::<L>()?;
    println!("{} {} groups:", groups.len(), L::NAME);
    for group in &groups {
        println!("  {group}");
    }
    Ok(())
}

fn print_summaries<K: Display>(summaries: &[Summary<K>]) {
    for s in summaries {
        println!(
            "  {}: areas={} pop={} avg={}",
            s.key, s.area_count, s.pop_sum, s.avg_pop
        );
    }
}

fn print_mismatches<K: Display>(level: &str, mismatches: &[Mismatch<K>]) {
    for m in mismatches {
        println!(
            "{level} {}: incremental={:?} full={:?}",
            m.key, m.incremental, m.full
        );
    }
}
