use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

mod config;
mod error;
mod export;
mod loader;
mod logging;
mod metrics;
mod models;
mod patterns;
mod pipeline;
mod report;
mod sheet;
mod term;

use config::ThresholdConfig;
use error::{ConfigWarning, SchemaError};
use loader::{ColumnMap, NormalizeOptions};
use pipeline::Analysis;

#[derive(Parser)]
#[command(name = "course-patterns")]
#[command(about = "Find courses with persistent or worsening student success problems", long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InputArgs {
    /// Exported worksheet CSV, or a directory holding one CSV per worksheet
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value = sheet::DEFAULT_SHEET)]
    sheet: String,
    /// Also remove embedded totals whose enrollment equals the sum of sibling sections
    #[arg(long)]
    detect_sum_rollups: bool,
    /// Accept another header for a column, e.g. --alias dropped=Drops
    #[arg(long = "alias", value_parser = loader::parse_alias)]
    aliases: Vec<(loader::Field, String)>,
    #[command(flatten)]
    thresholds: ThresholdArgs,
}

#[derive(Args)]
struct ThresholdArgs {
    /// TOML file of threshold overrides
    #[arg(long = "thresholds")]
    file: Option<PathBuf>,
    /// Override one threshold, e.g. --set high_dfw_threshold=0.25
    #[arg(long = "set", value_parser = config::parse_override)]
    overrides: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect patterns and list flagged courses
    Analyze {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long, default_value_t = 25)]
        limit: usize,
        /// Print run metadata and every flag as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write course-term metrics, flags, and section detail as CSV
    Export {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long, default_value = "exports")]
        out_dir: PathBuf,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Show the effective thresholds as TOML
    Thresholds {
        #[command(flatten)]
        thresholds: ThresholdArgs,
    },
}

impl ThresholdArgs {
    fn resolve(&self) -> anyhow::Result<(ThresholdConfig, Vec<ConfigWarning>)> {
        let (base, mut warnings) = match &self.file {
            Some(path) => ThresholdConfig::load_file(path)?,
            None => (ThresholdConfig::default(), Vec::new()),
        };
        let (config, override_warnings) = base.with_overrides(self.overrides.iter().cloned());
        warnings.extend(override_warnings);
        Ok((config, warnings))
    }
}

struct Loaded {
    analysis: Analysis,
    thresholds: ThresholdConfig,
    config_warnings: Vec<ConfigWarning>,
}

fn load(input: &InputArgs) -> anyhow::Result<Loaded> {
    let (thresholds, config_warnings) = input.thresholds.resolve()?;
    let table = sheet::read_sheet(&input.input, &input.sheet)?;
    let options = NormalizeOptions {
        detect_sum_rollups: input.detect_sum_rollups,
    };
    let columns = input
        .aliases
        .iter()
        .cloned()
        .fold(ColumnMap::default(), |columns, (field, header)| {
            columns.with_alias(field, header)
        });
    let analysis = Analysis::from_table(&table, &columns, &options)
        .with_context(|| format!("cannot analyze {}", input.input.display()))?;
    Ok(Loaded {
        analysis,
        thresholds,
        config_warnings,
    })
}

fn print_flags(loaded: &Loaded, flags: &[models::Flag], limit: usize) {
    let analysis = &loaded.analysis;
    for warning in &loaded.config_warnings {
        println!("Threshold warning: {warning}");
    }
    let d = &analysis.diagnostics;
    println!(
        "Read {} rows: kept {}, removed {} rollups, skipped {} invalid.",
        d.rows_read, d.rows_kept, d.rollup_rows, d.invalid_rows
    );
    println!(
        "{} courses across {} course-terms.",
        analysis.courses.len(),
        analysis.course_term_count()
    );

    if flags.is_empty() {
        println!("No courses flagged with these thresholds.");
        return;
    }

    println!("Flags:");
    for flag in flags.iter().take(limit) {
        let terms: Vec<&str> = flag.evidence.iter().map(|e| e.term.label()).collect();
        println!(
            "- {} [{}] {} ({})",
            flag.course,
            flag.kind,
            flag.detail,
            terms.join(", ")
        );
    }
    if flags.len() > limit {
        println!("... {} more (raise --limit or use export)", flags.len() - limit);
    }
}

fn write_text(path: &Path, contents: &str) -> anyhow::Result<()> {
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Analyze { input, limit, json } => {
            let loaded = load(&input)?;
            let flags = loaded.analysis.detect(&loaded.thresholds);
            if json {
                let value = export::flags_json(
                    &loaded.analysis,
                    &loaded.thresholds,
                    &loaded.config_warnings,
                    &flags,
                );
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                print_flags(&loaded, &flags, limit);
            }
        }
        Commands::Export { input, out_dir } => {
            let loaded = load(&input)?;
            for warning in &loaded.config_warnings {
                println!("Threshold warning: {warning}");
            }
            let flags = loaded.analysis.detect(&loaded.thresholds);
            for path in export::write_all(&out_dir, &loaded.analysis, &flags)? {
                println!("Wrote {}.", path.display());
            }
        }
        Commands::Report { input, out } => {
            let loaded = load(&input)?;
            let flags = loaded.analysis.detect(&loaded.thresholds);
            let report = report::build_report(
                &loaded.analysis,
                &flags,
                &loaded.thresholds,
                &loaded.config_warnings,
            );
            write_text(&out, &report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Thresholds { thresholds } => {
            let (config, warnings) = thresholds.resolve()?;
            for warning in &warnings {
                println!("# warning: {warning}");
            }
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_json);

    if let Err(err) = run(cli) {
        if let Some(schema) = err.downcast_ref::<SchemaError>() {
            tracing::error!("schema error: {schema}");
        }
        return Err(err);
    }
    Ok(())
}
