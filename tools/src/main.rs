//! riskpipe: headless batch runner for the risk-scoring pipeline.
//!
//! Usage:
//!   riskpipe score --entities entities.json --events events.json --analysis-date 2024-06-01
//!   riskpipe score --source-db analytics.db --ruleset data/rulesets/fraud.json \
//!       --analysis-date "2024-06-01 12:00:00" --store scores.db --format json
//!   riskpipe check-ruleset data/rulesets/churn.json

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand, ValueEnum};
use riskpipe_core::{
    entity::{parse_timestamp, EntityRecord, EventRecord},
    report::{self, CohortRetention, Dimension, GroupedReport, PivotReport},
    store::{InputSource, ScoreStore},
    Pipeline, Ruleset, RunInput, RunOptions, RunOutput,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "riskpipe", version, about = "Batch risk scoring, classification and segmentation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score every entity and print detail and summary reports
    Score(ScoreArgs),
    /// Validate a ruleset file without running anything
    CheckRuleset {
        path: PathBuf,
    },
}

#[derive(Args)]
struct ScoreArgs {
    /// Ruleset JSON file; overrides --builtin
    #[arg(long)]
    ruleset: Option<PathBuf>,

    /// Built-in ruleset used when --ruleset is absent
    #[arg(long, value_enum, default_value_t = Builtin::Churn)]
    builtin: Builtin,

    /// JSON array of entity records
    #[arg(long, requires = "events", conflicts_with = "source_db")]
    entities: Option<PathBuf>,

    /// JSON array of event records
    #[arg(long, requires = "entities")]
    events: Option<PathBuf>,

    /// SQLite database with `entity` and `event` tables
    #[arg(long)]
    source_db: Option<PathBuf>,

    /// Analysis date (YYYY-MM-DD) or timestamp
    #[arg(long)]
    analysis_date: String,

    /// Abort on the first invalid input record
    #[arg(long)]
    strict: bool,

    /// Persist scores, audit rows and the run log to this SQLite file
    #[arg(long)]
    store: Option<PathBuf>,

    /// Actor recorded on audit rows
    #[arg(long, default_value = "riskpipe")]
    actor: String,

    /// Grouping dimensions for the summary report
    #[arg(long, value_delimiter = ',', default_value = "category,region")]
    group_by: Vec<Dimension>,

    /// Row dimension of the category pivot
    #[arg(long, default_value = "region")]
    pivot: Dimension,

    /// Maximum detail rows in text output
    #[arg(long)]
    top: Option<usize>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum Builtin {
    Churn,
    Fraud,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    run: &'a RunOutput,
    summary: &'a GroupedReport,
    pivot: &'a PivotReport,
    retention: &'a [CohortRetention],
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::CheckRuleset { path } => check_ruleset(&path),
        Command::Score(args) => score(args),
    }
}

fn check_ruleset(path: &Path) -> Result<()> {
    let ruleset = Ruleset::load(path)?;
    println!(
        "ok: ruleset '{}' v{}: {} scoring rules, {} categories, {} segment rules, max score {}",
        ruleset.name(),
        ruleset.version(),
        ruleset.scoring_rules().len(),
        ruleset.classification().len(),
        ruleset.segmentation().len(),
        ruleset.max_score(),
    );
    Ok(())
}

fn score(args: ScoreArgs) -> Result<()> {
    let ruleset = match &args.ruleset {
        Some(path) => Ruleset::load(path)?,
        None => match args.builtin {
            Builtin::Churn => Ruleset::churn_default(),
            Builtin::Fraud => Ruleset::fraud_default(),
        },
    };

    let analysis_time = parse_analysis_time(&args.analysis_date)?;
    let input = read_input(&args)?;

    let options = RunOptions {
        analysis_time,
        strict: args.strict,
        actor: args.actor.clone(),
    };
    let categories = ruleset.categories();
    let pipeline = Pipeline::new(ruleset, options);

    let output = match &args.store {
        Some(path) => {
            let path = path.to_string_lossy();
            let store = ScoreStore::open(&path)?;
            store.migrate()?;
            log::info!("persisting to {path}");
            pipeline.run_and_persist(&input, &store)?
        }
        None => pipeline.run(&input)?,
    };
    if !output.rejected.is_empty() {
        log::warn!("{} input records rejected", output.rejected.len());
    }

    let summary = report::group_by(&output.results, &args.group_by);
    let pivot = report::category_pivot(&output.results, args.pivot, &categories);
    let retention = report::cohort_retention(&output.results);

    match args.format {
        OutputFormat::Json => {
            let doc = JsonReport {
                run: &output,
                summary: &summary,
                pivot: &pivot,
                retention: &retention,
            };
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => {
            println!("riskpipe: {} v{}", output.ruleset, output.ruleset_version);
            println!("  run:       {}", output.run_id);
            println!("  analysis:  {}", output.analysis_time);
            println!("  scored:    {}", output.results.len());
            println!("  rejected:  {}", output.rejected.len());
            println!();
            print!("{}", report::render_detail_text(&output, args.top));
            println!();
            print!("{}", report::render_grouped_text(&summary));
            println!();
            print!("{}", report::render_pivot_text(&pivot));
            println!();
            print!("{}", report::render_retention_text(&retention));
        }
    }

    Ok(())
}

fn parse_analysis_time(raw: &str) -> Result<NaiveDateTime> {
    parse_timestamp(raw)
        .with_context(|| format!("invalid --analysis-date '{raw}' (expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS)"))
}

fn read_input(args: &ScoreArgs) -> Result<RunInput> {
    if let Some(db) = &args.source_db {
        let source = InputSource::open(&db.to_string_lossy())?;
        return Ok(source.read_input()?);
    }
    match (&args.entities, &args.events) {
        (Some(entities), Some(events)) => Ok(RunInput {
            entities: read_json::<EntityRecord>(entities)?,
            events: read_json::<EventRecord>(events)?,
        }),
        _ => bail!("provide either --source-db or both --entities and --events"),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Cannot parse {}", path.display()))
}
