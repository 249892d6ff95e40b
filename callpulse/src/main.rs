//! callpulse - call-analytics ingestion for voice AI assistants
//!
//! This tool provides commands for:
//! - Ingesting call-lifecycle events (one JSON object per line)
//! - Inspecting template and assistant aggregates
//! - Registering assistants in the directory
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/callpulse/aggregates.db (~/.local/share/callpulse/aggregates.db)
//! - Config: $XDG_CONFIG_HOME/callpulse/config.toml (~/.config/callpulse/config.toml)
//! - Logs: $XDG_STATE_HOME/callpulse/

use anyhow::{bail, Context, Result};
use callpulse_core::{
    AggregateStore, AssistantProfile, Config, Database, Disposition, IngestReport, Ingestor,
    Period, TemplateAggregate,
};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "callpulse")]
#[command(about = "Call-analytics ingestion and aggregation for voice AI assistants")]
#[command(version)]
struct Args {
    /// Database path (default: $XDG_DATA_HOME/callpulse/aggregates.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print a line per processed event
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest call-lifecycle events, one JSON object per line
    Ingest {
        /// Input file; reads stdin when omitted or "-"
        file: Option<PathBuf>,
    },

    /// Show aggregate statistics
    Stats {
        /// Template to show
        #[arg(short, long, conflicts_with = "assistant", required_unless_present = "assistant")]
        template: Option<String>,

        /// Period key: 2024-03 (month) or 2024-03-15T14 (hour); default current month
        #[arg(short, long)]
        period: Option<String>,

        /// Assistant to show instead of a template
        #[arg(short, long)]
        assistant: Option<String>,

        /// Output JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Add or update an assistant in the directory
    RegisterAssistant {
        #[arg(long)]
        assistant: String,

        #[arg(long)]
        template: String,

        #[arg(long)]
        user: Option<String>,

        /// Template category, e.g. lead_qualification
        #[arg(long)]
        category: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        callpulse_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = args.db.clone().unwrap_or_else(Config::database_path);
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    let db = Arc::new(db);

    match args.command {
        Command::Ingest { file } => cmd_ingest(&config, db, file, args.verbose),
        Command::Stats {
            template,
            period,
            assistant,
            json,
        } => match (template, assistant) {
            (Some(template), _) => cmd_template_stats(&db, &template, period.as_deref(), json),
            (None, Some(assistant)) => cmd_assistant_stats(&db, &assistant, json),
            (None, None) => bail!("either --template or --assistant is required"),
        },
        Command::RegisterAssistant {
            assistant,
            template,
            user,
            category,
        } => cmd_register(&db, assistant, template, user, category),
    }
}

#[derive(Default)]
struct IngestTotals {
    applied: usize,
    duplicate: usize,
    ignored: usize,
    noop: usize,
    failed: usize,
    alerts: usize,
}

impl IngestTotals {
    fn record(&mut self, report: &IngestReport) {
        match report.disposition {
            Disposition::Applied => self.applied += 1,
            Disposition::Duplicate => self.duplicate += 1,
            Disposition::Ignored => self.ignored += 1,
            Disposition::NoOp => self.noop += 1,
        }
        self.alerts += report.alerts.len();
    }
}

fn cmd_ingest(config: &Config, db: Arc<Database>, file: Option<PathBuf>, verbose: bool) -> Result<()> {
    let ingestor =
        Ingestor::from_database(config, db.clone()).context("failed to build ingestor")?;

    let reader: Box<dyn BufRead> = match file {
        Some(path) if path.as_os_str() != "-" => {
            let f = std::fs::File::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Box::new(BufReader::new(f))
        }
        _ => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut totals = IngestTotals::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;

        match ingestor.handle(&line) {
            Ok(report) => {
                if verbose {
                    println!(
                        "line {}: {} {:?} ({} alerts)",
                        line_no,
                        report.event_type,
                        report.disposition,
                        report.alerts.len()
                    );
                }
                for failure in &report.secondary_failures {
                    eprintln!("line {}: warning: {}", line_no, failure);
                }
                totals.record(&report);
            }
            Err(e) => {
                eprintln!("line {}: error: {}", line_no, e);
                totals.failed += 1;
            }
        }
    }

    let retention_days = config.ingest.ledger_retention_days;
    if retention_days > 0 {
        db.prune_processed_events(Utc::now() - Duration::days(retention_days))
            .context("failed to prune idempotency ledger")?;
    }

    println!("Ingest complete:");
    println!("  Applied:    {}", totals.applied);
    println!("  Duplicates: {}", totals.duplicate);
    println!("  Ignored:    {}", totals.ignored);
    println!("  No-op:      {}", totals.noop);
    println!("  Failed:     {}", totals.failed);
    println!("  Alerts:     {}", totals.alerts);

    if totals.failed > 0 {
        bail!("{} event(s) failed", totals.failed);
    }
    Ok(())
}

fn cmd_template_stats(db: &Database, template: &str, period: Option<&str>, json: bool) -> Result<()> {
    let period = match period {
        Some(key) => Period::parse(key).context("invalid --period")?,
        None => Period::month_of(Utc::now()),
    };

    let row = db
        .template_aggregate(template, &period)
        .context("failed to read template aggregate")?;
    let concurrent = db
        .concurrent_calls(template, Utc::now())
        .context("failed to read concurrent calls")?;

    let Some(row) = row else {
        if json {
            println!("null");
        } else {
            println!("No data for template {} in {}", template, period);
            println!("Concurrent calls: {}", concurrent);
        }
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&row)?);
        return Ok(());
    }

    print_template(&row);
    println!("Concurrent calls:      {}", concurrent);
    Ok(())
}

fn fmt_opt(value: Option<f64>, suffix: &str) -> String {
    value
        .map(|v| format!("{:.2}{}", v, suffix))
        .unwrap_or_else(|| "-".to_string())
}

fn print_template(row: &TemplateAggregate) {
    println!("Template {} ({})", row.template_id, row.period);
    println!("==================================");
    println!("Total calls:           {}", row.total_calls);
    println!("Successful calls:      {}", row.successful_calls);
    println!("Failed calls:          {}", row.failed_calls);
    println!(
        "Failure rate:          {}",
        fmt_opt(row.failure_rate().map(|r| r * 100.0), "%")
    );
    println!("Escalations:           {}", row.escalations_triggered);
    println!("Total duration:        {:.0}s", row.total_duration);
    println!("Average duration:      {}", fmt_opt(row.average_duration(), "s"));
    println!("Average quality:       {}", fmt_opt(row.average_quality(), ""));
    println!("Calls started:         {}", row.calls_started);
    println!("Function calls:        {}", row.function_calls);
    println!("Usages:                {}", row.total_usages);
    println!("Views:                 {}", row.template_views);
    println!(
        "Ratings:               {} (avg {})",
        row.total_ratings,
        fmt_opt(row.average_rating(), "")
    );
    println!("Rating distribution:   {:?}", row.rating_distribution);
    println!("Active assistants:     {}", row.active_assistants);
    println!("Deployed assistants:   {}", row.deployed_assistants);
    println!("Unique users:          {}", row.unique_users.len());

    if !row.objective_counts.is_empty() {
        println!();
        println!("Objectives:");
        for (tag, count) in &row.objective_counts {
            println!("  {:<24} {}", tag, count);
        }
    }
    for (label, set) in [
        ("Failure reasons", &row.failure_reasons),
        ("Escalation reasons", &row.escalation_reasons),
        ("Functions invoked", &row.functions_invoked),
    ] {
        if !set.is_empty() {
            println!();
            println!("{}:", label);
            for member in set {
                println!("  {}", member);
            }
        }
    }
}

fn cmd_assistant_stats(db: &Database, assistant: &str, json: bool) -> Result<()> {
    let row = db
        .assistant_aggregate(assistant)
        .context("failed to read assistant aggregate")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&row)?);
        return Ok(());
    }

    let Some(row) = row else {
        println!("No data for assistant {}", assistant);
        return Ok(());
    };

    println!("Assistant {}", row.assistant_id);
    println!("==================================");
    println!("Total calls:           {}", row.total_calls);
    println!("Successful calls:      {}", row.successful_calls);
    println!(
        "Last call:             {}",
        row.last_call_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(metrics) = &row.performance_metrics {
        println!("Performance metrics:   {}", metrics);
    }
    println!("Updated:               {}", row.updated_at.to_rfc3339());
    Ok(())
}

fn cmd_register(
    db: &Database,
    assistant_id: String,
    template_id: String,
    user_id: Option<String>,
    category: Option<String>,
) -> Result<()> {
    let profile = AssistantProfile {
        assistant_id,
        template_id,
        user_id,
        category,
    };
    db.register_assistant(&profile)
        .context("failed to register assistant")?;
    println!(
        "Registered assistant {} -> template {}",
        profile.assistant_id, profile.template_id
    );
    Ok(())
}
