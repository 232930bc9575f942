// FX Feature Pipeline - CLI
// One subcommand per stage plus the full run. Exit codes: 0 ok, 1 error,
// 2 quality gate halt, 3 degraded (features written, version not pushed).

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fx_pipeline::extract::FileRateSource;
use fx_pipeline::logging::init_tracing;
use fx_pipeline::snapshot::timestamp_label;
use fx_pipeline::{db, Pipeline, PipelineConfig, QualityGate, RunOutcome};

#[derive(Parser)]
#[command(name = "fx-pipeline")]
#[command(about = "Exchange-rate feature pipeline", version, long_about = None)]
struct Cli {
    /// Put data/, reports/ and models/ below this directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, validate, engineer, profile and version
    Run {
        /// Replay a saved API response instead of calling the API
        #[arg(long)]
        from_file: Option<PathBuf>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the quality gate on a raw CSV file
    Validate {
        file: PathBuf,
    },

    /// Regenerate the feature dataset from the stored history
    Features,

    /// Profile the feature dataset and write the HTML report
    Profile,

    /// Show the dataset version log and recent runs
    Versions {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Restore a committed dataset by hash or commit id prefix
    Checkout {
        reference: String,

        /// Destination (defaults to the live dataset path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write lag statistics of the training target
    TrainingStats,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env().context("Failed to load configuration")?;
    if let Some(root) = &cli.root {
        config = config.rooted_at(root);
    }

    let code = match cli.command {
        Commands::Run { from_file, json } => run_command(config, from_file, json)?,
        Commands::Validate { file } => validate_command(config, file)?,
        Commands::Features => features_command(config)?,
        Commands::Profile => profile_command(config)?,
        Commands::Versions { limit } => versions_command(config, limit)?,
        Commands::Checkout { reference, output } => checkout_command(config, reference, output)?,
        Commands::TrainingStats => training_stats_command(config)?,
        Commands::Config => config_command(config)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn open_pipeline(config: PipelineConfig, from_file: Option<PathBuf>) -> Result<Pipeline> {
    let pipeline = match from_file {
        Some(path) => Pipeline::with_source(config, Box::new(FileRateSource::new(&path))),
        None => Pipeline::from_config(config),
    };
    pipeline.context("Failed to initialise pipeline")
}

fn run_command(config: PipelineConfig, from_file: Option<PathBuf>, json: bool) -> Result<i32> {
    let pipeline = open_pipeline(config, from_file)?;
    let report = pipeline.run(Utc::now()).context("Failed to record pipeline run")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.outcome.exit_code());
    }

    println!("🔁 FX Feature Pipeline - run {}", report.record.timestamp);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if let Some(path) = &report.raw_path {
        println!("📥 Raw snapshot:  {}", path.display());
    }
    if let Some(verdict) = &report.verdict {
        println!("✅ Quality gate:  {}", verdict.summary());
    }
    if let Some(path) = &report.dataset_path {
        println!("🧮 Features:      {} rows → {}", report.feature_rows, path.display());
    }
    if let Some(path) = &report.report_path {
        println!("📊 Profile:       {}", path.display());
    }
    if let Some(version) = &report.version {
        println!(
            "📦 Version:       {} ({})",
            version.short_hash(),
            if version.uploaded { "uploaded" } else { "already stored" }
        );
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    match report.outcome {
        RunOutcome::Succeeded => println!("🎉 {}", report.summary()),
        RunOutcome::Halted => {
            println!("🛑 Pipeline halted by the quality gate:");
            for reason in &report.reasons {
                println!("   - {}", reason);
            }
        }
        RunOutcome::Degraded => {
            println!("⚠️  Degraded: features written locally, version not pushed");
            println!("   {}", report.reasons.join("; "));
        }
        RunOutcome::Failed => {
            println!("❌ {}", report.summary());
            if report.retryable {
                println!("   (retryable)");
            }
        }
    }

    Ok(report.outcome.exit_code())
}

fn validate_command(config: PipelineConfig, file: PathBuf) -> Result<i32> {
    let table = fx_pipeline::DataTable::from_csv_path(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let verdict = QualityGate::new(config.thresholds).evaluate(&table);

    println!("✅ Quality gate: {}", file.display());
    for check in &verdict.checks {
        let mark = if !check.passed {
            "❌"
        } else if check.severity == fx_pipeline::Severity::Warning {
            "⚠️ "
        } else {
            "✓ "
        };
        println!("   {} [{}] {}", mark, check.rule_name, check.message);
    }
    println!("{}", verdict.summary());

    Ok(if verdict.pass {
        RunOutcome::Succeeded.exit_code()
    } else {
        RunOutcome::Halted.exit_code()
    })
}

fn features_command(config: PipelineConfig) -> Result<i32> {
    let pipeline = open_pipeline(config, None)?;
    let features = pipeline.engineer_features()?;

    println!(
        "🧮 {} rows, {} currencies, {} tracked → {}",
        features.row_count(),
        features.currencies.len(),
        features.tracked.len(),
        pipeline.config().dataset_path().display()
    );
    Ok(0)
}

fn profile_command(config: PipelineConfig) -> Result<i32> {
    let pipeline = open_pipeline(config, None)?;
    let (profile, path) = pipeline.profile_dataset(&timestamp_label(Utc::now()))?;

    println!(
        "📊 {} rows x {} columns, missing ratio {:.4} → {}",
        profile.rows,
        profile.columns,
        profile.missing_ratio,
        path.display()
    );
    Ok(0)
}

fn versions_command(config: PipelineConfig, limit: usize) -> Result<i32> {
    let conn = db::open_database(&config.db_path)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;

    let versions = db::get_dataset_versions(&conn)?;
    println!("📦 Dataset versions ({})", versions.len());
    for version in versions.iter().rev().take(limit) {
        println!(
            "   {}  {}  {:>6} rows  {}",
            version.committed_at.format("%Y-%m-%d %H:%M:%S"),
            version.short_hash(),
            version.row_count,
            version.message
        );
    }

    let runs = db::get_runs(&conn, limit)?;
    println!("\n🔁 Recent runs ({})", runs.len());
    for run in &runs {
        println!(
            "   {}  {:<18} {}",
            run.timestamp,
            run.state.as_str(),
            run.reason.as_deref().unwrap_or("")
        );
    }
    Ok(0)
}

fn checkout_command(config: PipelineConfig, reference: String, output: Option<PathBuf>) -> Result<i32> {
    let pipeline = open_pipeline(config, None)?;
    let version = pipeline
        .checkout(&reference, output.as_deref())
        .with_context(|| format!("Failed to check out {}", reference))?;

    println!(
        "📦 Restored {} ({} rows, committed {})",
        version.short_hash(),
        version.row_count,
        version.committed_at.to_rfc3339()
    );
    Ok(0)
}

fn training_stats_command(config: PipelineConfig) -> Result<i32> {
    let pipeline = open_pipeline(config, None)?;
    let (stats, path) = pipeline.training_stats(Utc::now())?;

    println!(
        "📈 {} lags of {} over {} samples → {}",
        stats.n_lags,
        stats.target,
        stats.sample_count,
        path.display()
    );
    for (name, feature) in &stats.features {
        println!(
            "   {:<10} min {:.6}  max {:.6}  mean {:.6}  std {:.6}",
            name, feature.min, feature.max, feature.mean, feature.std
        );
    }
    Ok(0)
}

fn config_command(config: PipelineConfig) -> Result<i32> {
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(0)
}
