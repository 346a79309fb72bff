use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use statline_compact::CompactionOutcome;
use statline_core::UnitRange;
use statline_sync::{
    compact_dataset, report_recent_runs, CompactWhen, DatasetRegistry, IngestOptions,
    IngestPipeline, SyncConfig,
};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "statline")]
#[command(about = "Incremental sports-stat ingestion and season compaction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch a range of units and store the ones that are new or changed.
    Ingest(IngestArgs),
    /// Rebuild a period's table from the stored artifacts.
    Compact {
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        year: i32,
        #[arg(long)]
        dry_run: bool,
    },
    /// List the dataset registry.
    Datasets,
    /// Summarise recent batch reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    dataset: String,
    #[arg(long)]
    year: i32,
    #[arg(long, requires = "end_week", conflicts_with_all = ["start_date", "end_date"])]
    start_week: Option<u32>,
    #[arg(long, requires = "start_week")]
    end_week: Option<u32>,
    /// YYYY-MM-DD
    #[arg(long, requires = "end_date")]
    start_date: Option<NaiveDate>,
    #[arg(long, requires = "start_date")]
    end_date: Option<NaiveDate>,
    /// Rewrite artifacts even when their content is unchanged.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    dry_run: bool,
    /// auto, always or never
    #[arg(long, default_value = "auto")]
    compact: CompactWhen,
}

impl IngestArgs {
    fn range(&self) -> Result<UnitRange> {
        match (self.start_week, self.end_week, self.start_date, self.end_date) {
            (Some(start), Some(end), None, None) => Ok(UnitRange::Weeks {
                year: self.year,
                start,
                end,
            }),
            (None, None, Some(start), Some(end)) => Ok(UnitRange::Dates { start, end }),
            _ => bail!("pass either --start-week/--end-week or --start-date/--end-date"),
        }
    }

    fn options(&self) -> IngestOptions {
        IngestOptions {
            year: self.year,
            force_refresh: self.force,
            dry_run: self.dry_run,
            compact: self.compact,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

fn print_compaction(outcome: &CompactionOutcome) {
    match outcome {
        CompactionOutcome::NothingToCompile { reason, unreadable } => {
            println!(
                "nothing to compile ({reason:?}); {} unreadable artifacts; existing table left as is",
                unreadable.len()
            );
        }
        CompactionOutcome::Written(report) => {
            println!(
                "compacted: rows={} columns={} units={} duplicates_dropped={} unreadable={} changed={} path={}",
                report.rows,
                report.columns.len(),
                report.units,
                report.duplicates_dropped,
                report.unreadable.len(),
                report.changed,
                report.path.display()
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Ingest(args) => {
            let range = args.range()?;
            let registry = DatasetRegistry::load(&config.registry_path).await?;
            let dataset = registry.get(&args.dataset)?.clone();
            let pipeline = IngestPipeline::new(config, dataset, args.options())?;
            info!(run_id = %pipeline.run_id(), dataset = %args.dataset, "starting batch");

            let summary = pipeline.run(&range).await?;
            println!("{}", summary.one_line());
            if let Some(outcome) = &summary.compaction {
                print_compaction(outcome);
            }
        }
        Commands::Compact {
            dataset,
            year,
            dry_run,
        } => {
            let registry = DatasetRegistry::load(&config.registry_path).await?;
            let dataset = registry.get(&dataset)?;
            let outcome = compact_dataset(&config, dataset, year, dry_run).await?;
            print_compaction(&outcome);
        }
        Commands::Datasets => {
            let registry = DatasetRegistry::load(&config.registry_path).await?;
            println!("{}", registry.describe());
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}
