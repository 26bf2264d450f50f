//! CLI entry point for forcing_prep.
//!
//! Provides subcommands for generating AORC and HRRR catchment forcing,
//! post-processing the results, and maintaining the processing log.

use anyhow::Result;
use clap::{Parser, Subcommand};
use forcing_prep::config::{AorcConfig, HrrrConfig, expand_home};
use forcing_prep::post_process::{compile_hrrr, default_specs, load_specs, post_process};
use forcing_prep::process_log::ProcessLog;
use forcing_prep::{aorc, hrrr};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "forcing_prep")]
#[command(about = "Aggregate gridded meteorological forcing onto catchments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate AORC forcing for the basins of a YAML config
    Aorc {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
    /// Generate daily HRRR forcing for the basins of a YAML config
    Hrrr {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
    /// Round AORC basin means and split them by water year
    PostProcess {
        /// Directory holding the `{basin}_{start}_to_{end}_agg.csv` files
        #[arg(value_name = "FORCING_DIR")]
        forcing_dir: PathBuf,

        #[arg(long)]
        year_start: i32,

        #[arg(long)]
        year_end: i32,

        /// YAML map of variable to decimal places (defaults to the AORC variables)
        #[arg(long)]
        specs: Option<PathBuf>,
    },
    /// Concatenate daily HRRR basin means into one series per basin
    CompileHrrr {
        /// HRRR config whose `out_dir` holds the daily outputs
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Directory to write `HRRR_ts_gage_{basin}.csv` into
        #[arg(value_name = "DIR_WRITE")]
        dir_write: String,
    },
    /// Inspect or repair a processing log
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
}

#[derive(Subcommand)]
enum LogAction {
    /// Count the distinct basins in the log
    Count {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Mark every basin with cached coverage weights as finished
    Backfill {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/forcing_prep.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("forcing_prep.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Aorc { config } => {
            let config = AorcConfig::load(&config)?;
            aorc::run(&config).await?;
        }
        Commands::Hrrr { config } => {
            let config = HrrrConfig::load(&config)?;
            hrrr::run(&config).await?;
        }
        Commands::PostProcess {
            forcing_dir,
            year_start,
            year_end,
            specs,
        } => {
            let specs = match specs {
                Some(path) => load_specs(&path)?,
                None => default_specs(),
            };
            let written = tokio::task::spawn_blocking(move || {
                post_process(&forcing_dir, year_start, year_end, &specs)
            })
            .await??;
            info!(basins = written, "Post-processing complete");
        }
        Commands::CompileHrrr { config, dir_write } => {
            let config = HrrrConfig::load(&config)?;
            let dir_write = PathBuf::from(expand_home(&dir_write));
            let written = compile_hrrr(Path::new(&config.out_dir), &dir_write)?;
            info!(basins = written.len(), dir = %dir_write.display(), "HRRR series compiled");
        }
        Commands::Log { action } => match action {
            LogAction::Count { dir } => {
                let log = ProcessLog::open(&dir)?;
                let count = log.count_unique()?;
                info!(log = %log.path().display(), count, "Unique basins in processing log");
                println!("Number of unique basin IDs: {count}");
            }
            LogAction::Backfill { dir } => {
                let log = ProcessLog::open(&dir)?;
                let added = log.backfill_from_coverage(&dir)?;
                println!("Added {} basin(s) to {}", added.len(), log.path().display());
            }
        },
    }

    Ok(())
}
